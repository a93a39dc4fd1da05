//! Shared entity plumbing
//!
//! Every entity embeds an [`EntityCore`]: identifier, protection object,
//! properties, the deleted marker, the internal persisted cell that
//! creates and deletes the stored row, and the scope lock.
//!
//! Every operation that runs in a transaction scope takes the scope lock of
//! each entity it reads or changes, through [`EntityCore::require_in`] or
//! [`InstanceMode::resolve_in`]. The lock is held until the scope ends, so
//! a second scope sees an entity either before or after the first scope,
//! never in between.

use crate::error::{Error, Result};
use crate::persistence::{DatabaseDrivers, SingleColumnDatabaseDriver};
use crate::props::{PropsContainer, SecureProps};
use crate::security::{AccessContext, AccessType, ObjectProtection};
use crate::transaction::{ScopeLock, TransactionMgr, TransactionSimpleObject};
use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use std::sync::{Arc, Weak};
use uuid::Uuid;

/// How a `get_instance` factory treats an existing or missing object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceMode {
    /// Create the object; fail if it already exists
    Create,
    /// Return the existing object or create it
    LoadOrCreate,
    /// Return the existing object, or nothing
    Load,
    /// Return the existing object; fail if it does not exist
    Require,
}

impl InstanceMode {
    /// Applies the mode to the result of a lookup, calling `create` when a
    /// new object is required
    pub(crate) fn resolve<T>(
        self,
        existing: Option<Arc<T>>,
        kind: &'static str,
        key: impl FnOnce() -> String,
        create: impl FnOnce() -> Result<Arc<T>>,
    ) -> Result<Option<Arc<T>>> {
        match (existing, self) {
            (Some(_), InstanceMode::Create) => Err(Error::DataAlreadyExists { kind, key: key() }),
            (Some(object), _) => Ok(Some(object)),
            (None, InstanceMode::Load) => Ok(None),
            (None, InstanceMode::Require) => Err(Error::NotFound { kind, key: key() }),
            (None, InstanceMode::Create | InstanceMode::LoadOrCreate) => create().map(Some),
        }
    }

    /// [`resolve`](Self::resolve) for entities: an existing entity is
    /// locked for `tx` first, so one that another scope is still building
    /// or changing is a conflict
    pub(crate) fn resolve_in<T: Entity>(
        self,
        tx: &TransactionMgr,
        existing: Option<Arc<T>>,
        kind: &'static str,
        key: impl FnOnce() -> String,
        create: impl FnOnce() -> Result<Arc<T>>,
    ) -> Result<Option<Arc<T>>> {
        if let Some(object) = &existing {
            object.entity_core().claim(tx)?;
        }
        self.resolve(existing, kind, key, create)
    }
}

/// Implemented by every entity type
pub(crate) trait Entity {
    fn entity_core(&self) -> &EntityCore;
}

/// Unwraps the result of a factory call that cannot return nothing
pub(crate) fn created<T>(object: Option<Arc<T>>, kind: &'static str) -> Result<Arc<T>> {
    object.ok_or_else(|| Error::implementation(format!("factory returned no {}", kind)))
}

/// Upgrades a reference to a related entity
pub(crate) fn upgrade<T>(reference: &Weak<T>, kind: &'static str, key: &str) -> Result<Arc<T>> {
    reference
        .upgrade()
        .ok_or_else(|| Error::implementation(format!("dangling reference to {} {}", kind, key)))
}

/// Identity, protection and lifecycle state common to all entities
pub(crate) struct EntityCore {
    kind: &'static str,
    key: String,
    uuid: Uuid,
    obj_prot: Arc<ObjectProtection>,
    props: PropsContainer,
    drivers: Arc<DatabaseDrivers>,
    deleted: TransactionSimpleObject<bool>,
    persisted: TransactionSimpleObject<bool>,
    scope_lock: ScopeLock,
    structure: ReentrantMutex<()>,
}

impl EntityCore {
    /// `persisted` is true for restored objects and false for new ones
    pub(crate) fn new(
        kind: &'static str,
        key: String,
        uuid: Uuid,
        obj_prot: Arc<ObjectProtection>,
        drivers: &Arc<DatabaseDrivers>,
        existence: Arc<dyn SingleColumnDatabaseDriver<bool>>,
        persisted: bool,
    ) -> Self {
        let scope_lock = ScopeLock::new();
        Self {
            kind,
            props: PropsContainer::new(obj_prot.path(), drivers.props.clone()).with_scope_lock(scope_lock.clone()),
            drivers: drivers.clone(),
            key,
            uuid,
            obj_prot,
            deleted: TransactionSimpleObject::new(false, None),
            persisted: TransactionSimpleObject::new(persisted, Some(existence)),
            scope_lock,
            structure: ReentrantMutex::new(()),
        }
    }

    pub(crate) fn kind(&self) -> &'static str {
        self.kind
    }

    pub(crate) fn key(&self) -> &str {
        &self.key
    }

    /// Drivers used for objects created below this entity
    pub(crate) fn drivers(&self) -> &Arc<DatabaseDrivers> {
        &self.drivers
    }

    pub(crate) fn check_deleted(&self) -> Result<()> {
        if self.deleted.get() {
            return Err(Error::AccessToDeleted {
                kind: self.kind,
                key: self.key.clone(),
            });
        }
        Ok(())
    }

    /// Deleted check followed by the access check
    pub(crate) fn require(&self, ctx: &AccessContext, access: AccessType) -> Result<()> {
        self.check_deleted()?;
        self.obj_prot.require_access(ctx, access)
    }

    /// [`require`](Self::require), then the scope lock for `tx`
    pub(crate) fn require_in(&self, ctx: &AccessContext, tx: &TransactionMgr, access: AccessType) -> Result<()> {
        self.require(ctx, access)?;
        self.claim(tx)
    }

    /// Takes the scope lock for `tx`
    pub(crate) fn claim(&self, tx: &TransactionMgr) -> Result<()> {
        self.scope_lock.acquire(tx)
    }

    /// Shared with the flag set and properties of the entity
    pub(crate) fn scope_lock(&self) -> &ScopeLock {
        &self.scope_lock
    }

    pub(crate) fn uuid(&self) -> Result<Uuid> {
        self.check_deleted()?;
        Ok(self.uuid)
    }

    pub(crate) fn raw_uuid(&self) -> Uuid {
        self.uuid
    }

    pub(crate) fn obj_prot(&self) -> Result<&Arc<ObjectProtection>> {
        self.check_deleted()?;
        Ok(&self.obj_prot)
    }

    pub(crate) fn raw_obj_prot(&self) -> &Arc<ObjectProtection> {
        &self.obj_prot
    }

    pub(crate) fn props<'a>(&'a self, ctx: &'a AccessContext) -> Result<SecureProps<'a>> {
        self.check_deleted()?;
        SecureProps::new(ctx, &self.obj_prot, &self.props)
    }

    pub(crate) fn raw_props(&self) -> &PropsContainer {
        &self.props
    }

    pub(crate) fn is_deleted(&self) -> bool {
        self.deleted.get()
    }

    /// Stages the insert of the stored row
    pub(crate) fn persist(&self, tx: &TransactionMgr) -> Result<()> {
        self.claim(tx)?;
        self.persisted.set(tx, true)?;
        Ok(())
    }

    /// Removes properties, protection and the stored row, then marks the
    /// entity deleted
    pub(crate) fn destroy(&self, tx: &TransactionMgr) -> Result<()> {
        self.claim(tx)?;
        self.props.delete(tx)?;
        self.obj_prot.delete(tx)?;
        self.persisted.set(tx, false)?;
        self.deleted.set(tx, true)?;
        Ok(())
    }

    /// Serializes structural changes of this entity's collections
    pub(crate) fn lock(&self) -> ReentrantMutexGuard<'_, ()> {
        self.structure.lock()
    }
}

/// Accessors every entity shares through its [`EntityCore`]
macro_rules! entity_accessors {
    ($entity:ty) => {
        impl $entity {
            pub fn uuid(&self) -> crate::error::Result<uuid::Uuid> {
                self.core.uuid()
            }

            pub fn obj_prot(&self) -> crate::error::Result<&std::sync::Arc<crate::security::ObjectProtection>> {
                self.core.obj_prot()
            }

            /// Access-checked properties of this object
            pub fn props<'a>(
                &'a self,
                ctx: &'a crate::security::AccessContext,
            ) -> crate::error::Result<crate::props::SecureProps<'a>> {
                self.core.props(ctx)
            }

            pub fn is_deleted(&self) -> bool {
                self.core.is_deleted()
            }

            pub(crate) fn core(&self) -> &crate::objects::common::EntityCore {
                &self.core
            }
        }

        impl crate::objects::common::Entity for $entity {
            fn entity_core(&self) -> &crate::objects::common::EntityCore {
                &self.core
            }
        }

        impl std::fmt::Debug for $entity {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.debug_struct(stringify!($entity))
                    .field("kind", &self.core.kind())
                    .field("key", &self.core.key())
                    .field("uuid", &self.core.raw_uuid())
                    .field("deleted", &self.core.is_deleted())
                    .finish()
            }
        }
    };
}

pub(crate) use entity_accessors;

/// Orders two endpoints of an undirected connection by node name. The
/// endpoint on the smaller node name becomes the source.
pub fn canonical_pair<'a, T>(
    first: &'a T,
    first_node: &crate::domain::NodeName,
    second: &'a T,
    second_node: &crate::domain::NodeName,
) -> (&'a T, &'a T) {
    if first_node <= second_node {
        (first, second)
    } else {
        (second, first)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::NodeName;
    use assert_matches::assert_matches;
    use proptest::prelude::*;

    #[test]
    fn test_instance_modes() {
        let existing = Some(Arc::new(1u32));
        let never = || -> Result<Arc<u32>> { panic!("must not create") };

        assert_matches!(
            InstanceMode::Create.resolve(existing.clone(), "node", || "n1".into(), never),
            Err(Error::DataAlreadyExists { .. })
        );
        assert_eq!(
            InstanceMode::Load.resolve(existing.clone(), "node", || "n1".into(), never).unwrap(),
            existing
        );
        assert_eq!(
            InstanceMode::Load.resolve::<u32>(None, "node", || "n1".into(), never).unwrap(),
            None
        );
        assert_matches!(
            InstanceMode::Require.resolve::<u32>(None, "node", || "n1".into(), never),
            Err(Error::NotFound { kind: "node", .. })
        );
        let made = InstanceMode::LoadOrCreate
            .resolve::<u32>(None, "node", || "n1".into(), || Ok(Arc::new(2)))
            .unwrap();
        assert_eq!(made.as_deref(), Some(&2));
    }

    proptest! {
        #[test]
        fn prop_canonical_pair_ignores_argument_order(a in "[a-z][a-z0-9]{1,8}", b in "[a-z][a-z0-9]{1,8}") {
            let name_a = NodeName::new(&a).unwrap();
            let name_b = NodeName::new(&b).unwrap();
            let forward = canonical_pair(&name_a, &name_a, &name_b, &name_b);
            let backward = canonical_pair(&name_b, &name_b, &name_a, &name_a);
            prop_assert_eq!(forward, backward);
            prop_assert!(forward.0 <= forward.1);
        }
    }
}
