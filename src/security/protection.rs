//! Object Protection
//!
//! Access control gate owned by every entity. The owner role always has
//! CONTROL access, every other role gets the access of its ACL entry, and
//! the privileges of the context grant access independent of both.
//! Creator, owner, security type and the ACL are transactional and
//! persisted as one protection row plus one row per ACL entry.

use super::access::{AccessContext, AccessType, Identity, Privilege, Role, SecurityType};
use crate::error::{DbResult, Error, Result};
use crate::persistence::{
    columns, AclRow, ColumnDriver, DatabaseDrivers, DbBatch, EntityDatabaseDriver, ExistenceDriver,
    ObjectProtectionRow, PersistedRow,
};
use crate::transaction::{MapDatabaseDriver, TransactionMap, TransactionMgr, TransactionSimpleObject};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Persists ACL entries of one protection object
struct AclMapDriver {
    object_path: String,
    driver: Arc<dyn EntityDatabaseDriver<AclRow>>,
}

impl MapDatabaseDriver<Role, AccessType> for AclMapDriver {
    fn persist(
        &self,
        batch: &mut DbBatch,
        role: &Role,
        old: Option<&AccessType>,
        new: Option<&AccessType>,
    ) -> DbResult<()> {
        if old == new {
            return Ok(());
        }
        match new {
            Some(access) => self.driver.put(
                batch,
                &AclRow {
                    object_path: self.object_path.clone(),
                    role: role.value().to_string(),
                    access: access.value(),
                },
            ),
            None => self
                .driver
                .delete(batch, &AclRow::key_of(&self.object_path, role.value())),
        }
    }
}

/// Access control object of one protected object
pub struct ObjectProtection {
    path: String,
    creator: TransactionSimpleObject<Identity>,
    owner: TransactionSimpleObject<Role>,
    security_type: TransactionSimpleObject<SecurityType>,
    acl: TransactionMap<Role, AccessType>,
    persisted: TransactionSimpleObject<bool>,
}

impl ObjectProtection {
    fn build(
        path: String,
        creator: Identity,
        owner: Role,
        security_type: SecurityType,
        persisted: bool,
        drivers: &DatabaseDrivers,
    ) -> Arc<Self> {
        let table = drivers.object_protection.clone();
        Arc::new_cyclic(|weak| Self {
            creator: TransactionSimpleObject::new(
                creator,
                Some(ColumnDriver::new(table.clone(), path.clone(), columns::CREATOR_IDENTITY)),
            ),
            owner: TransactionSimpleObject::new(
                owner,
                Some(ColumnDriver::new(table.clone(), path.clone(), columns::OWNER_ROLE)),
            ),
            security_type: TransactionSimpleObject::new(
                security_type,
                Some(ColumnDriver::new(table.clone(), path.clone(), columns::SECURITY_TYPE)),
            ),
            acl: TransactionMap::new(Some(Arc::new(AclMapDriver {
                object_path: path.clone(),
                driver: drivers.acl.clone(),
            }))),
            persisted: TransactionSimpleObject::new(
                persisted,
                Some(ExistenceDriver::new(weak.clone(), table, path.clone(), Self::row)),
            ),
            path,
        })
    }

    /// Creates the protection object of a new object. The creating role
    /// becomes the owner and receives a CONTROL entry.
    pub fn create(
        ctx: &AccessContext,
        tx: &TransactionMgr,
        path: impl Into<String>,
        drivers: &DatabaseDrivers,
    ) -> Result<Arc<Self>> {
        let prot = Self::build(
            path.into(),
            ctx.identity().clone(),
            ctx.role().clone(),
            ctx.domain().clone(),
            false,
            drivers,
        );
        prot.persisted.set(tx, true)?;
        prot.acl.insert(tx, ctx.role().clone(), AccessType::Control)?;
        debug!("Created object protection {} owned by {}", prot.path, ctx.role());
        Ok(prot)
    }

    /// Rebuilds a stored protection object
    pub fn restore(row: &ObjectProtectionRow, acl_rows: &[AclRow], drivers: &DatabaseDrivers) -> Result<Arc<Self>> {
        let corrupt = |err: Error| Error::corrupt(ObjectProtectionRow::TABLE, row.object_path.clone(), err);
        let creator = Identity::new(&row.creator_identity).map_err(corrupt)?;
        let owner = Role::new(&row.owner_role).map_err(corrupt)?;
        let security_type = SecurityType::new(&row.security_type).map_err(corrupt)?;

        let prot = Self::build(row.object_path.clone(), creator, owner, security_type, true, drivers);
        for acl_row in acl_rows {
            let key = acl_row.primary_key();
            let role = Role::new(&acl_row.role).map_err(|err| Error::corrupt(AclRow::TABLE, key.clone(), err))?;
            let access = AccessType::from_value(acl_row.access).ok_or_else(|| {
                Error::corrupt(
                    AclRow::TABLE,
                    key.clone(),
                    format!("invalid access type {:#x}", acl_row.access),
                )
            })?;
            prot.acl.restore(role, access);
        }
        Ok(prot)
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn creator(&self) -> Identity {
        self.creator.get()
    }

    pub fn owner(&self) -> Role {
        self.owner.get()
    }

    pub fn security_type(&self) -> SecurityType {
        self.security_type.get()
    }

    // =========================================================================
    // Access Checks
    // =========================================================================

    /// Effective access of `ctx`, or `None` if it has no access at all
    pub fn query_access(&self, ctx: &AccessContext) -> Option<AccessType> {
        let granted = ctx.privileges().object_access();
        let role_access = if self.owner.with(|owner| owner == ctx.role()) {
            Some(AccessType::Control)
        } else {
            self.acl.get(ctx.role())
        };
        granted.max(role_access)
    }

    /// Fails with [`Error::AccessDenied`] unless `ctx` has at least `requested`
    pub fn require_access(&self, ctx: &AccessContext, requested: AccessType) -> Result<()> {
        match self.query_access(ctx) {
            Some(access) if access.has_access(requested) => Ok(()),
            _ => Err(self.denied(ctx, requested)),
        }
    }

    fn require_privilege(&self, ctx: &AccessContext, privilege: Privilege) -> Result<()> {
        if ctx.privileges().contains(privilege) {
            Ok(())
        } else {
            Err(self.denied(ctx, AccessType::Control))
        }
    }

    fn denied(&self, ctx: &AccessContext, requested: AccessType) -> Error {
        Error::AccessDenied {
            path: self.path.clone(),
            role: ctx.role().to_string(),
            requested,
        }
    }

    // =========================================================================
    // Access Control List
    // =========================================================================

    pub fn get_acl_entry(&self, role: &Role) -> Option<AccessType> {
        self.acl.get(role)
    }

    pub fn acl_entries(&self) -> Vec<(Role, AccessType)> {
        self.acl.entries()
    }

    /// Grants `access` to `role`
    pub fn add_acl_entry(
        &self,
        ctx: &AccessContext,
        tx: &TransactionMgr,
        role: Role,
        access: AccessType,
    ) -> Result<Option<AccessType>> {
        self.require_acl_change(ctx, &role)?;
        self.acl.insert(tx, role, access)
    }

    /// Removes the entry of `role`
    pub fn del_acl_entry(&self, ctx: &AccessContext, tx: &TransactionMgr, role: &Role) -> Result<Option<AccessType>> {
        self.require_acl_change(ctx, role)?;
        self.acl.remove(tx, role)
    }

    fn require_acl_change(&self, ctx: &AccessContext, role: &Role) -> Result<()> {
        self.require_access(ctx, AccessType::Control)?;
        // a non-owner may only edit its own entry with the object control privilege
        if role == ctx.role()
            && !self.owner.with(|owner| owner == ctx.role())
            && !ctx.privileges().contains(Privilege::OBJ_CONTROL)
        {
            return Err(self.denied(ctx, AccessType::Control));
        }
        Ok(())
    }

    // =========================================================================
    // Ownership
    // =========================================================================

    pub fn set_owner(&self, ctx: &AccessContext, tx: &TransactionMgr, owner: Role) -> Result<Role> {
        self.require_privilege(ctx, Privilege::OBJ_OWNER)?;
        self.owner.set(tx, owner)
    }

    /// Makes the identity of `ctx` the creator of this object
    pub fn reset_creator(&self, ctx: &AccessContext, tx: &TransactionMgr) -> Result<Identity> {
        self.require_privilege(ctx, Privilege::SYS_ALL)?;
        self.creator.set(tx, ctx.identity().clone())
    }

    pub fn set_security_type(
        &self,
        ctx: &AccessContext,
        tx: &TransactionMgr,
        security_type: SecurityType,
    ) -> Result<SecurityType> {
        self.require_privilege(ctx, Privilege::SYS_ALL)?;
        self.security_type.set(tx, security_type)
    }

    /// Removes the protection object and its ACL from the store
    pub fn delete(&self, tx: &TransactionMgr) -> Result<()> {
        self.acl.clear(tx)?;
        self.persisted.set(tx, false)?;
        Ok(())
    }

    pub fn row(&self) -> ObjectProtectionRow {
        ObjectProtectionRow {
            object_path: self.path.clone(),
            creator_identity: self.creator.get().value().to_string(),
            owner_role: self.owner.get().value().to_string(),
            security_type: self.security_type.get().value().to_string(),
        }
    }
}

impl fmt::Debug for ObjectProtection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectProtection")
            .field("path", &self.path)
            .field("owner", &self.owner.get())
            .field("acl", &self.acl.entries())
            .finish()
    }
}
