//! Volume
//!
//! One volume definition deployed as part of a resource, placed in a
//! storage pool of the resource's node.

use super::api::VolumeApi;
use super::common::{entity_accessors, upgrade, EntityCore, InstanceMode};
use super::{Resource, StorPool, VolumeConnection, VolumeDefinition};
use crate::domain::{NodeName, ResourceName, StorPoolName, VolumeNumber};
use crate::error::{Error, Result};
use crate::persistence::{columns, db_key, ColumnDriver, ExistenceDriver, VolumeRow};
use crate::security::{paths, AccessContext, AccessType, ObjectProtection};
use crate::stateflags::StateFlags;
use crate::transaction::{TransactionMap, TransactionMgr, TransactionSimpleObject};
use bitflags::bitflags;
use std::sync::{Arc, Weak};
use tracing::debug;
use uuid::Uuid;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct VolumeFlags: u64 {
        const DELETE = 2;
        const RESIZE = 4;
        const DRBD_RESIZE = 8;
    }
}

const KIND: &str = "volume";

pub struct Volume {
    core: EntityCore,
    resource: Weak<Resource>,
    volume_definition: Weak<VolumeDefinition>,
    stor_pool: Weak<StorPool>,
    node_name: NodeName,
    resource_name: ResourceName,
    vlm_nr: VolumeNumber,
    stor_pool_name: StorPoolName,
    block_device_path: TransactionSimpleObject<Option<String>>,
    meta_disk_path: TransactionSimpleObject<Option<String>>,
    flags: StateFlags<VolumeFlags>,
    pub(crate) volume_connections: TransactionMap<NodeName, Arc<VolumeConnection>>,
}

entity_accessors!(Volume);

impl Volume {
    #[allow(clippy::too_many_arguments)]
    fn build(
        resource: &Arc<Resource>,
        vlm_dfn: &Arc<VolumeDefinition>,
        stor_pool: &Arc<StorPool>,
        uuid: Uuid,
        block_device: Option<String>,
        meta_disk: Option<String>,
        flags: VolumeFlags,
        obj_prot: Arc<ObjectProtection>,
        persisted: bool,
    ) -> Arc<Self> {
        let drivers = resource.core().drivers().clone();
        let node_name = resource.node_name().clone();
        let resource_name = resource.resource_name().clone();
        let vlm_nr = vlm_dfn.raw_volume_number();
        let key = db_key(&[node_name.value(), resource_name.value(), &vlm_nr.to_string()]);
        let table = drivers.volumes.clone();
        Arc::new_cyclic(|weak| {
            let core = EntityCore::new(
                KIND,
                format!("{}/{}/{}", node_name, resource_name, vlm_nr),
                uuid,
                obj_prot.clone(),
                &drivers,
                ExistenceDriver::new(weak.clone(), table.clone(), key.clone(), Self::row),
                persisted,
            );
            let scope_lock = core.scope_lock().clone();
            Self {
                core,
                resource: Arc::downgrade(resource),
                volume_definition: Arc::downgrade(vlm_dfn),
                stor_pool: Arc::downgrade(stor_pool),
                stor_pool_name: stor_pool.pool_name().clone(),
                block_device_path: TransactionSimpleObject::new(
                    block_device,
                    Some(ColumnDriver::new(table.clone(), key.clone(), columns::BLOCK_DEVICE_PATH)),
                ),
                meta_disk_path: TransactionSimpleObject::new(
                    meta_disk,
                    Some(ColumnDriver::new(table.clone(), key.clone(), columns::META_DISK_PATH)),
                ),
                flags: StateFlags::new(obj_prot, flags, Some(ColumnDriver::new(table, key, columns::FLAGS)))
                    .with_scope_lock(scope_lock),
                node_name,
                resource_name,
                vlm_nr,
                volume_connections: TransactionMap::new(None),
            }
        })
    }

    fn check_placement(resource: &Resource, vlm_dfn: &VolumeDefinition, stor_pool: &StorPool) -> Result<()> {
        if vlm_dfn.resource_name() != resource.resource_name() {
            return Err(Error::implementation(format!(
                "volume definition {}/{} does not belong to resource {}",
                vlm_dfn.resource_name(),
                vlm_dfn.raw_volume_number(),
                resource.resource_name()
            )));
        }
        if stor_pool.node_name() != resource.node_name() {
            return Err(Error::implementation(format!(
                "storage pool {}/{} is not on node {}",
                stor_pool.node_name(),
                stor_pool.pool_name(),
                resource.node_name()
            )));
        }
        Ok(())
    }

    /// Looks up or creates the volume of `vlm_dfn` within `resource`.
    /// Creation requires CHANGE on the resource and USE on the storage pool.
    #[allow(clippy::too_many_arguments)]
    pub fn get_instance(
        ctx: &AccessContext,
        tx: &TransactionMgr,
        resource: &Arc<Resource>,
        vlm_dfn: &Arc<VolumeDefinition>,
        stor_pool: &Arc<StorPool>,
        block_device: Option<String>,
        meta_disk: Option<String>,
        flags: VolumeFlags,
        mode: InstanceMode,
    ) -> Result<Option<Arc<Self>>> {
        resource.core().require_in(ctx, tx, AccessType::View)?;
        vlm_dfn.core().require_in(ctx, tx, AccessType::View)?;
        stor_pool.core().require_in(ctx, tx, AccessType::View)?;
        Self::check_placement(resource, vlm_dfn, stor_pool)?;

        let vlm_nr = vlm_dfn.raw_volume_number();
        let _guard = resource.core().lock();
        let existing = resource.volumes.get(&vlm_nr);
        mode.resolve_in(
            tx,
            existing,
            KIND,
            || format!("{}/{}/{}", resource.node_name(), resource.resource_name(), vlm_nr),
            || {
                resource.core().require_in(ctx, tx, AccessType::Change)?;
                stor_pool.core().require_in(ctx, tx, AccessType::Use)?;
                let obj_prot = ObjectProtection::create(
                    ctx,
                    tx,
                    paths::volume(resource.node_name(), resource.resource_name(), vlm_nr),
                    resource.core().drivers(),
                )?;
                let volume = Self::build(
                    resource,
                    vlm_dfn,
                    stor_pool,
                    Uuid::new_v4(),
                    block_device,
                    meta_disk,
                    flags,
                    obj_prot,
                    false,
                );
                volume.core.persist(tx)?;
                resource.volumes.insert(tx, vlm_nr, volume.clone())?;
                vlm_dfn
                    .volumes
                    .insert(tx, resource.node_name().clone(), volume.clone())?;
                stor_pool
                    .volumes
                    .insert(tx, (resource.resource_name().clone(), vlm_nr), volume.clone())?;
                debug!(
                    "Created volume {}/{}/{} in storage pool {}",
                    resource.node_name(),
                    resource.resource_name(),
                    vlm_nr,
                    stor_pool.pool_name()
                );
                Ok(volume)
            },
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn restore(
        resource: &Arc<Resource>,
        vlm_dfn: &Arc<VolumeDefinition>,
        stor_pool: &Arc<StorPool>,
        uuid: Uuid,
        block_device: Option<String>,
        meta_disk: Option<String>,
        flags: VolumeFlags,
        obj_prot: Arc<ObjectProtection>,
    ) -> Result<Arc<Self>> {
        Self::check_placement(resource, vlm_dfn, stor_pool)?;
        let volume = Self::build(
            resource,
            vlm_dfn,
            stor_pool,
            uuid,
            block_device,
            meta_disk,
            flags,
            obj_prot,
            true,
        );
        let vlm_nr = volume.vlm_nr;
        resource.volumes.restore(vlm_nr, volume.clone());
        vlm_dfn.volumes.restore(resource.node_name().clone(), volume.clone());
        stor_pool
            .volumes
            .restore((resource.resource_name().clone(), vlm_nr), volume.clone());
        Ok(volume)
    }

    fn row(&self) -> VolumeRow {
        VolumeRow {
            uuid: self.core.raw_uuid().to_string(),
            node_name: self.node_name.display_name().to_string(),
            resource_name: self.resource_name.display_name().to_string(),
            volume_number: i64::from(self.vlm_nr.value()),
            stor_pool_name: self.stor_pool_name.display_name().to_string(),
            block_device_path: self.block_device_path.get(),
            meta_disk_path: self.meta_disk_path.get(),
            flags: self.flags.raw_bits(),
        }
    }

    pub(crate) fn node_name(&self) -> &NodeName {
        &self.node_name
    }

    pub(crate) fn resource_name(&self) -> &ResourceName {
        &self.resource_name
    }

    pub(crate) fn raw_volume_number(&self) -> VolumeNumber {
        self.vlm_nr
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn resource(&self) -> Result<Arc<Resource>> {
        self.core.check_deleted()?;
        upgrade(&self.resource, "resource", self.core.key())
    }

    pub fn volume_definition(&self) -> Result<Arc<VolumeDefinition>> {
        self.core.check_deleted()?;
        upgrade(&self.volume_definition, "volume definition", self.core.key())
    }

    pub fn volume_number(&self) -> Result<VolumeNumber> {
        self.core.check_deleted()?;
        Ok(self.vlm_nr)
    }

    pub fn stor_pool(&self, ctx: &AccessContext) -> Result<Arc<StorPool>> {
        self.core.require(ctx, AccessType::View)?;
        upgrade(&self.stor_pool, "storage pool", self.core.key())
    }

    pub fn block_device_path(&self, ctx: &AccessContext) -> Result<Option<String>> {
        self.core.require(ctx, AccessType::View)?;
        Ok(self.block_device_path.get())
    }

    pub fn set_block_device_path(
        &self,
        ctx: &AccessContext,
        tx: &TransactionMgr,
        path: Option<String>,
    ) -> Result<Option<String>> {
        self.core.require_in(ctx, tx, AccessType::Use)?;
        self.block_device_path.set(tx, path)
    }

    pub fn meta_disk_path(&self, ctx: &AccessContext) -> Result<Option<String>> {
        self.core.require(ctx, AccessType::View)?;
        Ok(self.meta_disk_path.get())
    }

    pub fn set_meta_disk_path(
        &self,
        ctx: &AccessContext,
        tx: &TransactionMgr,
        path: Option<String>,
    ) -> Result<Option<String>> {
        self.core.require_in(ctx, tx, AccessType::Use)?;
        self.meta_disk_path.set(tx, path)
    }

    pub fn flags(&self) -> Result<&StateFlags<VolumeFlags>> {
        self.core.check_deleted()?;
        Ok(&self.flags)
    }

    pub fn volume_connection(&self, ctx: &AccessContext, peer: &NodeName) -> Result<Option<Arc<VolumeConnection>>> {
        self.core.require(ctx, AccessType::View)?;
        Ok(self.volume_connections.get(peer))
    }

    pub fn volume_connections(&self, ctx: &AccessContext) -> Result<Vec<Arc<VolumeConnection>>> {
        self.core.require(ctx, AccessType::View)?;
        Ok(self.volume_connections.values())
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    pub fn mark_deleted(&self, ctx: &AccessContext, tx: &TransactionMgr) -> Result<()> {
        self.core.require_in(ctx, tx, AccessType::Control)?;
        self.flags.enable_flags(ctx, tx, VolumeFlags::DELETE)
    }

    pub fn delete(&self, ctx: &AccessContext, tx: &TransactionMgr) -> Result<()> {
        self.core.require_in(ctx, tx, AccessType::Control)?;
        for conn in self.volume_connections.values() {
            conn.delete(ctx, tx)?;
        }

        let resource = upgrade(&self.resource, "resource", self.core.key())?;
        let vlm_dfn = upgrade(&self.volume_definition, "volume definition", self.core.key())?;
        let stor_pool = upgrade(&self.stor_pool, "storage pool", self.core.key())?;
        {
            let _guard = resource.core().lock();
            resource.volumes.remove(tx, &self.vlm_nr)?;
            vlm_dfn.volumes.remove(tx, &self.node_name)?;
            stor_pool
                .volumes
                .remove(tx, &(self.resource_name.clone(), self.vlm_nr))?;
        }
        self.core.destroy(tx)?;
        debug!(
            "Deleted volume {}/{}/{}",
            self.node_name, self.resource_name, self.vlm_nr
        );
        Ok(())
    }

    pub fn api_data(&self, ctx: &AccessContext) -> Result<VolumeApi> {
        self.core.require(ctx, AccessType::View)?;
        Ok(VolumeApi {
            uuid: self.core.raw_uuid(),
            volume_number: self.vlm_nr.value(),
            stor_pool_name: self.stor_pool_name.display_name().to_string(),
            block_device_path: self.block_device_path.get(),
            meta_disk_path: self.meta_disk_path.get(),
            flags: self.flags.raw_bits(),
            props: self.core.raw_props().map(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::DeviceProviderKind;
    use crate::objects::test_support::Fixture;
    use crate::persistence::{Database, PersistedRow};
    use assert_matches::assert_matches;

    #[test]
    fn test_placement_is_validated() {
        let fx = Fixture::new();
        let tx = fx.tx();
        let n1 = fx.node(&tx, "n1");
        let n2 = fx.node(&tx, "n2");
        let foreign_pool = fx.stor_pool(&tx, &n2, "pool1", DeviceProviderKind::Lvm);
        let r1 = fx.rsc_dfn(&tx, "r1", 7000);
        let r2 = fx.rsc_dfn(&tx, "r2", 7001);
        let vlm_dfn_r2 = fx.vlm_dfn(&tx, &r2, 0, 1001);
        let vlm_dfn_r1 = fx.vlm_dfn(&tx, &r1, 0, 1000);
        let rsc = fx.resource(&tx, &n1, &r1, 0);
        let local_pool = fx.stor_pool(&tx, &n1, "pool1", DeviceProviderKind::Lvm);

        let create = |vlm_dfn: &Arc<VolumeDefinition>, pool: &Arc<StorPool>| {
            Volume::get_instance(
                &fx.ctx,
                &tx,
                &rsc,
                vlm_dfn,
                pool,
                Some("/dev/drbd1000".into()),
                None,
                VolumeFlags::empty(),
                InstanceMode::Create,
            )
        };
        assert_matches!(create(&vlm_dfn_r2, &local_pool), Err(Error::Implementation(_)));
        assert_matches!(create(&vlm_dfn_r1, &foreign_pool), Err(Error::Implementation(_)));

        let volume = create(&vlm_dfn_r1, &local_pool).unwrap().unwrap();
        assert!(Arc::ptr_eq(&volume.stor_pool(&fx.ctx).unwrap(), &local_pool));
        assert_eq!(local_pool.volumes(&fx.ctx).unwrap().len(), 1);
        assert!(vlm_dfn_r1.volume(&fx.ctx, &NodeName::new("n1").unwrap()).unwrap().is_some());
        assert_matches!(create(&vlm_dfn_r1, &local_pool), Err(Error::DataAlreadyExists { .. }));
    }

    #[test]
    fn test_device_paths_and_delete() {
        let fx = Fixture::new();
        let tx = fx.tx();
        let node = fx.node(&tx, "n1");
        let pool = fx.stor_pool(&tx, &node, "pool1", DeviceProviderKind::Lvm);
        let rsc_dfn = fx.rsc_dfn(&tx, "r1", 7000);
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
        volume
            .set_block_device_path(&fx.ctx, &tx, Some("/dev/vg/r1_00000".into()))
            .unwrap();
        tx.commit().unwrap();
        let row = fx.db.select(VolumeRow::TABLE, "N1/R1/0").unwrap().unwrap();
        assert_eq!(row["block_device_path"], serde_json::json!("/dev/vg/r1_00000"));

        let tx = fx.tx();
        volume.delete(&fx.ctx, &tx).unwrap();
        tx.commit().unwrap();
        assert_matches!(volume.resource(), Err(Error::AccessToDeleted { .. }));
        assert_matches!(volume.volume_number(), Err(Error::AccessToDeleted { .. }));
        assert_matches!(volume.block_device_path(&fx.ctx), Err(Error::AccessToDeleted { .. }));
        assert_matches!(volume.stor_pool(&fx.ctx), Err(Error::AccessToDeleted { .. }));
        assert!(pool.volumes(&fx.ctx).unwrap().is_empty());
        assert!(rsc.volumes(&fx.ctx).unwrap().is_empty());
        assert_eq!(fx.db.row_count(VolumeRow::TABLE), 0);
    }
}
