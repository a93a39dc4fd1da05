//! Snapshot volume
//!
//! One snapshot volume definition captured within a node snapshot, held in
//! a storage pool of that node.

use super::api::SnapshotVolumeApi;
use super::common::{entity_accessors, upgrade, EntityCore, InstanceMode};
use super::{Snapshot, SnapshotVolumeDefinition, StorPool};
use crate::domain::{NodeName, ResourceName, SnapshotName, StorPoolName, VolumeNumber};
use crate::error::{Error, Result};
use crate::persistence::{db_key, ExistenceDriver, SnapshotVolumeRow};
use crate::security::{paths, AccessContext, AccessType, ObjectProtection};
use crate::transaction::TransactionMgr;
use std::sync::{Arc, Weak};
use tracing::debug;
use uuid::Uuid;

const KIND: &str = "snapshot volume";

pub struct SnapshotVolume {
    core: EntityCore,
    snapshot: Weak<Snapshot>,
    snapshot_volume_definition: Weak<SnapshotVolumeDefinition>,
    stor_pool: Weak<StorPool>,
    node_name: NodeName,
    resource_name: ResourceName,
    snapshot_name: SnapshotName,
    vlm_nr: VolumeNumber,
    stor_pool_name: StorPoolName,
}

entity_accessors!(SnapshotVolume);

impl SnapshotVolume {
    fn build(
        snapshot: &Arc<Snapshot>,
        snap_vlm_dfn: &Arc<SnapshotVolumeDefinition>,
        stor_pool: &Arc<StorPool>,
        uuid: Uuid,
        obj_prot: Arc<ObjectProtection>,
        persisted: bool,
    ) -> Arc<Self> {
        let drivers = snapshot.core().drivers().clone();
        let node_name = snapshot.node_name().clone();
        let resource_name = snapshot.resource_name().clone();
        let snapshot_name = snapshot.snapshot_name().clone();
        let vlm_nr = snap_vlm_dfn.raw_volume_number();
        Arc::new_cyclic(|weak| Self {
            core: EntityCore::new(
                KIND,
                format!("{}/{}/{}/{}", node_name, resource_name, snapshot_name, vlm_nr),
                uuid,
                obj_prot,
                &drivers,
                ExistenceDriver::new(
                    weak.clone(),
                    drivers.snapshot_volumes.clone(),
                    db_key(&[
                        node_name.value(),
                        resource_name.value(),
                        snapshot_name.value(),
                        &vlm_nr.to_string(),
                    ]),
                    Self::row,
                ),
                persisted,
            ),
            snapshot: Arc::downgrade(snapshot),
            snapshot_volume_definition: Arc::downgrade(snap_vlm_dfn),
            stor_pool: Arc::downgrade(stor_pool),
            stor_pool_name: stor_pool.pool_name().clone(),
            node_name,
            resource_name,
            snapshot_name,
            vlm_nr,
        })
    }

    fn check_placement(
        snapshot: &Snapshot,
        snap_vlm_dfn: &SnapshotVolumeDefinition,
        stor_pool: &StorPool,
    ) -> Result<()> {
        let snap_dfn = snap_vlm_dfn.snapshot_definition()?;
        if snap_dfn.resource_name() != snapshot.resource_name() || snap_dfn.snapshot_name() != snapshot.snapshot_name() {
            return Err(Error::implementation(format!(
                "snapshot volume definition {}/{} does not belong to snapshot {}/{}",
                snap_dfn.snapshot_name(),
                snap_vlm_dfn.raw_volume_number(),
                snapshot.resource_name(),
                snapshot.snapshot_name()
            )));
        }
        if stor_pool.node_name() != snapshot.node_name() {
            return Err(Error::implementation(format!(
                "storage pool {}/{} is not on node {}",
                stor_pool.node_name(),
                stor_pool.pool_name(),
                snapshot.node_name()
            )));
        }
        Ok(())
    }

    /// Looks up or creates the volume of `snap_vlm_dfn` within `snapshot`.
    /// Creation requires CHANGE on the snapshot and USE on the storage pool.
    pub fn get_instance(
        ctx: &AccessContext,
        tx: &TransactionMgr,
        snapshot: &Arc<Snapshot>,
        snap_vlm_dfn: &Arc<SnapshotVolumeDefinition>,
        stor_pool: &Arc<StorPool>,
        mode: InstanceMode,
    ) -> Result<Option<Arc<Self>>> {
        snapshot.core().require_in(ctx, tx, AccessType::View)?;
        Self::check_placement(snapshot, snap_vlm_dfn, stor_pool)?;
        let vlm_nr = snap_vlm_dfn.raw_volume_number();
        let _guard = snapshot.core().lock();
        let existing = snapshot.snapshot_volumes.get(&vlm_nr);
        mode.resolve_in(
            tx,
            existing,
            KIND,
            || {
                format!(
                    "{}/{}/{}/{}",
                    snapshot.node_name(),
                    snapshot.resource_name(),
                    snapshot.snapshot_name(),
                    vlm_nr
                )
            },
            || {
                snapshot.core().require_in(ctx, tx, AccessType::Change)?;
                stor_pool.core().require_in(ctx, tx, AccessType::Use)?;
                let obj_prot = ObjectProtection::create(
                    ctx,
                    tx,
                    paths::snapshot_volume(
                        snapshot.node_name(),
                        snapshot.resource_name(),
                        snapshot.snapshot_name(),
                        vlm_nr,
                    ),
                    snapshot.core().drivers(),
                )?;
                let snap_vlm = Self::build(snapshot, snap_vlm_dfn, stor_pool, Uuid::new_v4(), obj_prot, false);
                snap_vlm.core.persist(tx)?;
                Self::register(tx, snapshot, snap_vlm_dfn, stor_pool, &snap_vlm)?;
                debug!(
                    "Created snapshot volume {}/{}/{} on node {} in pool {}",
                    snapshot.resource_name(),
                    snapshot.snapshot_name(),
                    vlm_nr,
                    snapshot.node_name(),
                    stor_pool.pool_name()
                );
                Ok(snap_vlm)
            },
        )
    }

    fn register(
        tx: &TransactionMgr,
        snapshot: &Snapshot,
        snap_vlm_dfn: &SnapshotVolumeDefinition,
        stor_pool: &StorPool,
        snap_vlm: &Arc<Self>,
    ) -> Result<()> {
        snapshot.snapshot_volumes.insert(tx, snap_vlm.vlm_nr, snap_vlm.clone())?;
        snap_vlm_dfn
            .snapshot_volumes
            .insert(tx, snap_vlm.node_name.clone(), snap_vlm.clone())?;
        stor_pool.snapshot_volumes.insert(tx, snap_vlm.pool_key(), snap_vlm.clone())?;
        Ok(())
    }

    pub(crate) fn restore(
        snapshot: &Arc<Snapshot>,
        snap_vlm_dfn: &Arc<SnapshotVolumeDefinition>,
        stor_pool: &Arc<StorPool>,
        uuid: Uuid,
        obj_prot: Arc<ObjectProtection>,
    ) -> Result<Arc<Self>> {
        Self::check_placement(snapshot, snap_vlm_dfn, stor_pool)?;
        let snap_vlm = Self::build(snapshot, snap_vlm_dfn, stor_pool, uuid, obj_prot, true);
        snapshot.snapshot_volumes.restore(snap_vlm.vlm_nr, snap_vlm.clone());
        snap_vlm_dfn
            .snapshot_volumes
            .restore(snap_vlm.node_name.clone(), snap_vlm.clone());
        stor_pool.snapshot_volumes.restore(snap_vlm.pool_key(), snap_vlm.clone());
        Ok(snap_vlm)
    }

    fn pool_key(&self) -> (ResourceName, SnapshotName, VolumeNumber) {
        (self.resource_name.clone(), self.snapshot_name.clone(), self.vlm_nr)
    }

    fn row(&self) -> SnapshotVolumeRow {
        SnapshotVolumeRow {
            uuid: self.core.raw_uuid().to_string(),
            node_name: self.node_name.display_name().to_string(),
            resource_name: self.resource_name.display_name().to_string(),
            snapshot_name: self.snapshot_name.display_name().to_string(),
            volume_number: i64::from(self.vlm_nr.value()),
            stor_pool_name: self.stor_pool_name.display_name().to_string(),
        }
    }

    pub fn snapshot(&self) -> Result<Arc<Snapshot>> {
        self.core.check_deleted()?;
        upgrade(&self.snapshot, "snapshot", self.core.key())
    }

    pub fn snapshot_volume_definition(&self) -> Result<Arc<SnapshotVolumeDefinition>> {
        self.core.check_deleted()?;
        upgrade(&self.snapshot_volume_definition, "snapshot volume definition", self.core.key())
    }

    pub fn volume_number(&self) -> Result<VolumeNumber> {
        self.core.check_deleted()?;
        Ok(self.vlm_nr)
    }

    pub fn stor_pool(&self, ctx: &AccessContext) -> Result<Arc<StorPool>> {
        self.core.require(ctx, AccessType::View)?;
        upgrade(&self.stor_pool, "storage pool", self.core.key())
    }

    pub fn delete(&self, ctx: &AccessContext, tx: &TransactionMgr) -> Result<()> {
        self.core.require_in(ctx, tx, AccessType::Control)?;
        let snapshot = upgrade(&self.snapshot, "snapshot", self.core.key())?;
        let snap_vlm_dfn = upgrade(&self.snapshot_volume_definition, "snapshot volume definition", self.core.key())?;
        let stor_pool = upgrade(&self.stor_pool, "storage pool", self.core.key())?;
        {
            let _guard = snapshot.core().lock();
            snapshot.snapshot_volumes.remove(tx, &self.vlm_nr)?;
            snap_vlm_dfn.snapshot_volumes.remove(tx, &self.node_name)?;
            stor_pool.snapshot_volumes.remove(tx, &self.pool_key())?;
        }
        self.core.destroy(tx)?;
        debug!(
            "Deleted snapshot volume {}/{}/{} on node {}",
            self.resource_name, self.snapshot_name, self.vlm_nr, self.node_name
        );
        Ok(())
    }

    pub fn api_data(&self, ctx: &AccessContext) -> Result<SnapshotVolumeApi> {
        self.core.require(ctx, AccessType::View)?;
        Ok(SnapshotVolumeApi {
            uuid: self.core.raw_uuid(),
            volume_number: self.vlm_nr.value(),
            stor_pool_name: self.stor_pool_name.display_name().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DeviceProviderKind, DrbdNodeId};
    use crate::objects::test_support::Fixture;
    use crate::objects::{
        SnapshotDefinition, SnapshotDefinitionFlags, SnapshotFlags, SnapshotVolumeDefinitionFlags,
    };
    use assert_matches::assert_matches;

    #[test]
    fn test_snapshot_volume_blocks_pool_deletion() {
        let fx = Fixture::new();
        let tx = fx.tx();
        let node = fx.node(&tx, "n1");
        let other = fx.node(&tx, "n2");
        let pool = fx.stor_pool(&tx, &node, "pool1", DeviceProviderKind::LvmThin);
        let foreign_pool = fx.stor_pool(&tx, &other, "pool1", DeviceProviderKind::LvmThin);
        let rsc_dfn = fx.rsc_dfn(&tx, "r1", 7000);
        let snap_dfn = SnapshotDefinition::get_instance(
            &fx.ctx,
            &tx,
            &rsc_dfn,
            SnapshotName::new("snap1").unwrap(),
            SnapshotDefinitionFlags::empty(),
            InstanceMode::Create,
        )
        .unwrap()
        .unwrap();
        let snap_vlm_dfn = SnapshotVolumeDefinition::get_instance(
            &fx.ctx,
            &tx,
            &snap_dfn,
            VolumeNumber::new(0).unwrap(),
            4096,
            SnapshotVolumeDefinitionFlags::empty(),
            InstanceMode::Create,
        )
        .unwrap()
        .unwrap();
        let snapshot = Snapshot::get_instance(
            &fx.ctx,
            &tx,
            &node,
            &snap_dfn,
            DrbdNodeId::new(0).unwrap(),
            SnapshotFlags::empty(),
            InstanceMode::Create,
        )
        .unwrap()
        .unwrap();

        assert_matches!(
            SnapshotVolume::get_instance(&fx.ctx, &tx, &snapshot, &snap_vlm_dfn, &foreign_pool, InstanceMode::Create),
            Err(Error::Implementation(_))
        );
        let snap_vlm = SnapshotVolume::get_instance(&fx.ctx, &tx, &snapshot, &snap_vlm_dfn, &pool, InstanceMode::Create)
            .unwrap()
            .unwrap();
        tx.commit().unwrap();

        assert_eq!(pool.snapshot_volumes(&fx.ctx).unwrap().len(), 1);
        assert_eq!(snapshot.api_data(&fx.ctx).unwrap().snapshot_volumes[0].stor_pool_name, "pool1");

        let tx = fx.tx();
        assert_matches!(pool.delete(&fx.ctx, &tx), Err(Error::StillInUse { .. }));
        snapshot.delete(&fx.ctx, &tx).unwrap();
        pool.delete(&fx.ctx, &tx).unwrap();
        tx.commit().unwrap();
        assert!(snap_vlm.is_deleted());
        assert!(snap_vlm_dfn.snapshot_volumes(&fx.ctx).unwrap().is_empty());
    }
}
