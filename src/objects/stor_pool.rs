//! Storage pool of one node

use super::api::StorPoolApi;
use super::common::{entity_accessors, upgrade, EntityCore, InstanceMode};
use super::{Node, SnapshotVolume, StorPoolDefinition, Volume};
use crate::domain::{DeviceProviderKind, NodeName, ResourceName, SnapshotName, StorPoolName, VolumeNumber};
use crate::error::{Error, Result};
use crate::persistence::{db_key, ExistenceDriver, StorPoolRow};
use crate::security::{paths, AccessContext, AccessType, ObjectProtection};
use crate::transaction::{TransactionMap, TransactionMgr, TransactionSimpleObject};
use std::sync::{Arc, Weak};
use tracing::debug;
use uuid::Uuid;

const KIND: &str = "storage pool";

pub struct StorPool {
    core: EntityCore,
    node: Weak<Node>,
    definition: Weak<StorPoolDefinition>,
    node_name: NodeName,
    pool_name: StorPoolName,
    provider_kind: DeviceProviderKind,
    /// Reported by the satellite, never persisted
    free_space: TransactionSimpleObject<Option<u64>>,
    pub(crate) volumes: TransactionMap<(ResourceName, VolumeNumber), Arc<Volume>>,
    pub(crate) snapshot_volumes: TransactionMap<(ResourceName, SnapshotName, VolumeNumber), Arc<SnapshotVolume>>,
}

entity_accessors!(StorPool);

impl StorPool {
    fn build(
        node: &Arc<Node>,
        definition: &Arc<StorPoolDefinition>,
        uuid: Uuid,
        provider_kind: DeviceProviderKind,
        obj_prot: Arc<ObjectProtection>,
        persisted: bool,
    ) -> Arc<Self> {
        let drivers = node.core().drivers().clone();
        let node_name = node.node_name().clone();
        let pool_name = definition.pool_name().clone();
        Arc::new_cyclic(|weak| Self {
            core: EntityCore::new(
                KIND,
                format!("{}/{}", node_name, pool_name),
                uuid,
                obj_prot,
                &drivers,
                ExistenceDriver::new(
                    weak.clone(),
                    drivers.stor_pools.clone(),
                    db_key(&[node_name.value(), pool_name.value()]),
                    Self::row,
                ),
                persisted,
            ),
            node: Arc::downgrade(node),
            definition: Arc::downgrade(definition),
            node_name,
            pool_name,
            provider_kind,
            free_space: TransactionSimpleObject::new(None, None),
            volumes: TransactionMap::new(None),
            snapshot_volumes: TransactionMap::new(None),
        })
    }

    /// Looks up or creates the pool of `definition` on `node`. Creation
    /// requires CHANGE on the node and USE on the definition.
    pub fn get_instance(
        ctx: &AccessContext,
        tx: &TransactionMgr,
        node: &Arc<Node>,
        definition: &Arc<StorPoolDefinition>,
        provider_kind: DeviceProviderKind,
        mode: InstanceMode,
    ) -> Result<Option<Arc<Self>>> {
        node.core().require_in(ctx, tx, AccessType::View)?;
        definition.core().require_in(ctx, tx, AccessType::View)?;
        let _guard = node.core().lock();
        let existing = node.stor_pools.get(definition.pool_name());
        mode.resolve_in(
            tx,
            existing,
            KIND,
            || format!("{}/{}", node.node_name(), definition.pool_name()),
            || {
                node.core().require_in(ctx, tx, AccessType::Change)?;
                definition.core().require_in(ctx, tx, AccessType::Use)?;
                let obj_prot = ObjectProtection::create(
                    ctx,
                    tx,
                    paths::stor_pool(node.node_name(), definition.pool_name()),
                    node.core().drivers(),
                )?;
                let pool = Self::build(node, definition, Uuid::new_v4(), provider_kind, obj_prot, false);
                pool.core.persist(tx)?;
                node.stor_pools
                    .insert(tx, definition.pool_name().clone(), pool.clone())?;
                definition
                    .stor_pools
                    .insert(tx, node.node_name().clone(), pool.clone())?;
                debug!(
                    "Created storage pool {}/{} ({})",
                    node.node_name(),
                    definition.pool_name(),
                    provider_kind
                );
                Ok(pool)
            },
        )
    }

    pub(crate) fn restore(
        node: &Arc<Node>,
        definition: &Arc<StorPoolDefinition>,
        uuid: Uuid,
        provider_kind: DeviceProviderKind,
        obj_prot: Arc<ObjectProtection>,
    ) -> Arc<Self> {
        let pool = Self::build(node, definition, uuid, provider_kind, obj_prot, true);
        node.stor_pools.restore(definition.pool_name().clone(), pool.clone());
        definition.stor_pools.restore(node.node_name().clone(), pool.clone());
        pool
    }

    fn row(&self) -> StorPoolRow {
        StorPoolRow {
            uuid: self.core.raw_uuid().to_string(),
            node_name: self.node_name.display_name().to_string(),
            pool_name: self.pool_name.display_name().to_string(),
            provider_kind: self.provider_kind.as_str().to_string(),
        }
    }

    pub(crate) fn pool_name(&self) -> &StorPoolName {
        &self.pool_name
    }

    pub(crate) fn node_name(&self) -> &NodeName {
        &self.node_name
    }

    pub(crate) fn raw_provider_kind(&self) -> DeviceProviderKind {
        self.provider_kind
    }

    pub fn name(&self) -> Result<StorPoolName> {
        self.core.check_deleted()?;
        Ok(self.pool_name.clone())
    }

    pub fn node(&self) -> Result<Arc<Node>> {
        self.core.check_deleted()?;
        upgrade(&self.node, "node", self.core.key())
    }

    pub fn definition(&self) -> Result<Arc<StorPoolDefinition>> {
        self.core.check_deleted()?;
        upgrade(&self.definition, "storage pool definition", self.core.key())
    }

    pub fn provider_kind(&self, ctx: &AccessContext) -> Result<DeviceProviderKind> {
        self.core.require(ctx, AccessType::View)?;
        Ok(self.provider_kind)
    }

    pub fn free_space(&self, ctx: &AccessContext) -> Result<Option<u64>> {
        self.core.require(ctx, AccessType::View)?;
        Ok(self.free_space.get())
    }

    /// Records the free capacity in KiB reported for this pool
    pub fn set_free_space(&self, ctx: &AccessContext, tx: &TransactionMgr, free_kib: Option<u64>) -> Result<()> {
        self.core.require_in(ctx, tx, AccessType::Use)?;
        self.free_space.set(tx, free_kib)?;
        Ok(())
    }

    pub fn volumes(&self, ctx: &AccessContext) -> Result<Vec<Arc<Volume>>> {
        self.core.require(ctx, AccessType::View)?;
        Ok(self.volumes.values())
    }

    pub fn snapshot_volumes(&self, ctx: &AccessContext) -> Result<Vec<Arc<SnapshotVolume>>> {
        self.core.require(ctx, AccessType::View)?;
        Ok(self.snapshot_volumes.values())
    }

    /// Deletes the pool. Fails while volumes or snapshot volumes are placed
    /// on it.
    pub fn delete(&self, ctx: &AccessContext, tx: &TransactionMgr) -> Result<()> {
        self.core.require_in(ctx, tx, AccessType::Control)?;
        if !self.volumes.is_empty() || !self.snapshot_volumes.is_empty() {
            return Err(Error::StillInUse {
                kind: KIND,
                key: self.core.key().to_string(),
                reason: format!(
                    "{} volume(s) and {} snapshot volume(s) placed on it",
                    self.volumes.len(),
                    self.snapshot_volumes.len()
                ),
            });
        }

        let node = upgrade(&self.node, "node", self.core.key())?;
        let definition = upgrade(&self.definition, "storage pool definition", self.core.key())?;
        {
            let _guard = node.core().lock();
            node.stor_pools.remove(tx, &self.pool_name)?;
            definition.stor_pools.remove(tx, &self.node_name)?;
        }
        self.core.destroy(tx)?;
        debug!("Deleted storage pool {}/{}", self.node_name, self.pool_name);
        Ok(())
    }

    pub fn api_data(&self, ctx: &AccessContext) -> Result<StorPoolApi> {
        self.core.require(ctx, AccessType::View)?;
        let definition = upgrade(&self.definition, "storage pool definition", self.core.key())?;
        Ok(StorPoolApi {
            uuid: self.core.raw_uuid(),
            node_name: self.node_name.display_name().to_string(),
            pool_name: self.pool_name.display_name().to_string(),
            definition_uuid: definition.core().raw_uuid(),
            provider_kind: self.provider_kind,
            free_space_kib: self.free_space.get(),
            props: self.core.raw_props().map(),
            volume_count: self.volumes.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::test_support::Fixture;
    use crate::objects::{Volume, VolumeFlags};
    use assert_matches::assert_matches;

    #[test]
    fn test_free_space_is_not_persisted() {
        let fx = Fixture::new();
        let tx = fx.tx();
        let node = fx.node(&tx, "alpha");
        let pool = fx.stor_pool(&tx, &node, "pool1", DeviceProviderKind::LvmThin);
        tx.commit().unwrap();
        fx.db.clear_journal();

        let tx = fx.tx();
        pool.set_free_space(&fx.ctx, &tx, Some(4096)).unwrap();
        let stats = tx.commit().unwrap();
        assert_eq!(stats.writes, 0);
        assert_eq!(pool.free_space(&fx.ctx).unwrap(), Some(4096));
        assert!(fx.db.journal().is_empty());
    }

    #[test]
    fn test_delete_refused_while_volumes_placed() {
        let fx = Fixture::new();
        let tx = fx.tx();
        let node = fx.node(&tx, "alpha");
        let pool = fx.stor_pool(&tx, &node, "pool1", DeviceProviderKind::Lvm);
        let rsc_dfn = fx.rsc_dfn(&tx, "data1", 7000);
        let vlm_dfn = fx.vlm_dfn(&tx, &rsc_dfn, 0, 1000);
        let rsc = fx.resource(&tx, &node, &rsc_dfn, 0);
        let volume = Volume::get_instance(
            &fx.ctx,
            &tx,
            &rsc,
            &vlm_dfn,
            &pool,
            None,
            None,
            VolumeFlags::empty(),
            InstanceMode::Create,
        )
        .unwrap()
        .unwrap();
        tx.commit().unwrap();

        let tx = fx.tx();
        assert_matches!(pool.delete(&fx.ctx, &tx), Err(Error::StillInUse { kind: KIND, .. }));
        volume.delete(&fx.ctx, &tx).unwrap();
        pool.delete(&fx.ctx, &tx).unwrap();
        tx.commit().unwrap();

        assert!(node.stor_pools(&fx.ctx).unwrap().is_empty());
        assert_matches!(pool.provider_kind(&fx.ctx), Err(Error::AccessToDeleted { .. }));
        assert_matches!(pool.definition(), Err(Error::AccessToDeleted { .. }));
    }

    #[test]
    fn test_diskless_pool_lookup() {
        let fx = Fixture::new();
        let tx = fx.tx();
        let node = fx.node(&tx, "alpha");
        assert!(node.diskless_stor_pool(&fx.ctx).unwrap().is_none());
        fx.stor_pool(&tx, &node, "pool1", DeviceProviderKind::Zfs);
        let diskless = fx.stor_pool(&tx, &node, "DfltDisklessStorPool", DeviceProviderKind::Diskless);
        let found = node.diskless_stor_pool(&fx.ctx).unwrap().unwrap();
        assert!(Arc::ptr_eq(&found, &diskless));
    }
}
