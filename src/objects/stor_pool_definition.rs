//! Storage pool definition
//!
//! Cluster-wide name of a storage pool. Every node that provides the pool
//! holds its own [`StorPool`] instance of the definition.

use super::api::StorPoolDefinitionApi;
use super::common::{entity_accessors, upgrade, EntityCore, InstanceMode};
use super::{CoreObjects, StorPool};
use crate::domain::{NodeName, StorPoolName};
use crate::error::{Error, Result};
use crate::persistence::{db_key, ExistenceDriver, StorPoolDefinitionRow};
use crate::security::{paths, AccessContext, AccessType, ObjectProtection};
use crate::transaction::{TransactionMap, TransactionMgr};
use std::sync::{Arc, Weak};
use tracing::debug;
use uuid::Uuid;

const KIND: &str = "storage pool definition";

pub struct StorPoolDefinition {
    core: EntityCore,
    objects: Weak<CoreObjects>,
    name: StorPoolName,
    pub(crate) stor_pools: TransactionMap<NodeName, Arc<StorPool>>,
}

entity_accessors!(StorPoolDefinition);

impl StorPoolDefinition {
    fn build(
        objects: &Arc<CoreObjects>,
        uuid: Uuid,
        name: StorPoolName,
        obj_prot: Arc<ObjectProtection>,
        persisted: bool,
    ) -> Arc<Self> {
        let drivers = objects.drivers.clone();
        Arc::new_cyclic(|weak| Self {
            core: EntityCore::new(
                KIND,
                name.display_name().to_string(),
                uuid,
                obj_prot,
                &drivers,
                ExistenceDriver::new(
                    weak.clone(),
                    drivers.stor_pool_definitions.clone(),
                    db_key(&[name.value()]),
                    Self::row,
                ),
                persisted,
            ),
            objects: Arc::downgrade(objects),
            name,
            stor_pools: TransactionMap::new(None),
        })
    }

    pub fn get_instance(
        ctx: &AccessContext,
        tx: &TransactionMgr,
        objects: &Arc<CoreObjects>,
        name: StorPoolName,
        mode: InstanceMode,
    ) -> Result<Option<Arc<Self>>> {
        objects.stor_pool_definitions_prot().require_access(ctx, AccessType::View)?;
        let _guard = objects.lock();
        let existing = objects.stor_pool_definitions.get(&name);
        mode.resolve_in(
            tx,
            existing,
            KIND,
            || name.display_name().to_string(),
            || {
                objects
                    .stor_pool_definitions_prot()
                    .require_access(ctx, AccessType::Change)?;
                let obj_prot =
                    ObjectProtection::create(ctx, tx, paths::stor_pool_definition(&name), &objects.drivers)?;
                let definition = Self::build(objects, Uuid::new_v4(), name.clone(), obj_prot, false);
                definition.core.persist(tx)?;
                objects
                    .stor_pool_definitions
                    .insert(tx, name.clone(), definition.clone())?;
                debug!("Created storage pool definition {}", name);
                Ok(definition)
            },
        )
    }

    pub(crate) fn restore(
        objects: &Arc<CoreObjects>,
        uuid: Uuid,
        name: StorPoolName,
        obj_prot: Arc<ObjectProtection>,
    ) -> Arc<Self> {
        let definition = Self::build(objects, uuid, name.clone(), obj_prot, true);
        objects.stor_pool_definitions.restore(name, definition.clone());
        definition
    }

    fn row(&self) -> StorPoolDefinitionRow {
        StorPoolDefinitionRow {
            uuid: self.core.raw_uuid().to_string(),
            pool_name: self.name.display_name().to_string(),
        }
    }

    pub(crate) fn pool_name(&self) -> &StorPoolName {
        &self.name
    }

    pub fn name(&self) -> Result<StorPoolName> {
        self.core.check_deleted()?;
        Ok(self.name.clone())
    }

    pub fn stor_pool(&self, ctx: &AccessContext, node_name: &NodeName) -> Result<Option<Arc<StorPool>>> {
        self.core.require(ctx, AccessType::View)?;
        Ok(self.stor_pools.get(node_name))
    }

    pub fn stor_pools(&self, ctx: &AccessContext) -> Result<Vec<Arc<StorPool>>> {
        self.core.require(ctx, AccessType::View)?;
        Ok(self.stor_pools.values())
    }

    /// Deletes the definition. Fails while any node still provides the pool.
    pub fn delete(&self, ctx: &AccessContext, tx: &TransactionMgr) -> Result<()> {
        self.core.require_in(ctx, tx, AccessType::Control)?;
        if !self.stor_pools.is_empty() {
            return Err(Error::StillInUse {
                kind: KIND,
                key: self.core.key().to_string(),
                reason: format!("provided by {} node(s)", self.stor_pools.len()),
            });
        }
        let objects = upgrade(&self.objects, "controller objects", self.core.key())?;
        {
            let _guard = objects.lock();
            objects.stor_pool_definitions.remove(tx, &self.name)?;
        }
        self.core.destroy(tx)?;
        debug!("Deleted storage pool definition {}", self.name);
        Ok(())
    }

    pub fn api_data(&self, ctx: &AccessContext) -> Result<StorPoolDefinitionApi> {
        self.core.require(ctx, AccessType::View)?;
        Ok(StorPoolDefinitionApi {
            uuid: self.core.raw_uuid(),
            name: self.name.display_name().to_string(),
            props: self.core.raw_props().map(),
            nodes: self
                .stor_pools
                .keys()
                .iter()
                .map(|node| node.display_name().to_string())
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::DeviceProviderKind;
    use crate::objects::test_support::Fixture;
    use assert_matches::assert_matches;

    #[test]
    fn test_delete_refused_while_in_use() {
        let fx = Fixture::new();
        let tx = fx.tx();
        let node = fx.node(&tx, "alpha");
        let pool = fx.stor_pool(&tx, &node, "pool1", DeviceProviderKind::Lvm);
        tx.commit().unwrap();

        let definition = fx
            .objects
            .stor_pool_definition(&fx.ctx, &StorPoolName::new("pool1").unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(definition.api_data(&fx.ctx).unwrap().nodes, vec!["alpha".to_string()]);

        let tx = fx.tx();
        assert_matches!(definition.delete(&fx.ctx, &tx), Err(Error::StillInUse { .. }));
        pool.delete(&fx.ctx, &tx).unwrap();
        definition.delete(&fx.ctx, &tx).unwrap();
        tx.commit().unwrap();

        assert_eq!(fx.objects.stor_pool_definition_count(), 0);
        assert_matches!(definition.name(), Err(Error::AccessToDeleted { .. }));
        assert_matches!(definition.stor_pools(&fx.ctx), Err(Error::AccessToDeleted { .. }));
    }

    #[test]
    fn test_require_mode() {
        let fx = Fixture::new();
        let tx = fx.tx();
        assert_matches!(
            StorPoolDefinition::get_instance(
                &fx.ctx,
                &tx,
                &fx.objects,
                StorPoolName::new("missing").unwrap(),
                InstanceMode::Require
            ),
            Err(Error::NotFound { kind: KIND, .. })
        );
    }
}
