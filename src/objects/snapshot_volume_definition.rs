//! Snapshot volume definition

use super::api::SnapshotVolumeDefinitionApi;
use super::common::{entity_accessors, upgrade, EntityCore, InstanceMode};
use super::{SnapshotDefinition, SnapshotVolume};
use crate::domain::{check_volume_size, NodeName, ResourceName, SnapshotName, VolumeNumber};
use crate::error::Result;
use crate::persistence::{columns, db_key, ColumnDriver, ExistenceDriver, SnapshotVolumeDefinitionRow};
use crate::security::{paths, AccessContext, AccessType, ObjectProtection};
use crate::stateflags::StateFlags;
use crate::transaction::{TransactionMap, TransactionMgr, TransactionSimpleObject};
use bitflags::bitflags;
use std::sync::{Arc, Weak};
use tracing::debug;
use uuid::Uuid;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SnapshotVolumeDefinitionFlags: u64 {
        const ENCRYPTED = 1;
    }
}

const KIND: &str = "snapshot volume definition";

pub struct SnapshotVolumeDefinition {
    core: EntityCore,
    snapshot_definition: Weak<SnapshotDefinition>,
    resource_name: ResourceName,
    snapshot_name: SnapshotName,
    vlm_nr: VolumeNumber,
    size_kib: TransactionSimpleObject<u64>,
    flags: StateFlags<SnapshotVolumeDefinitionFlags>,
    pub(crate) snapshot_volumes: TransactionMap<NodeName, Arc<SnapshotVolume>>,
}

entity_accessors!(SnapshotVolumeDefinition);

impl SnapshotVolumeDefinition {
    #[allow(clippy::too_many_arguments)]
    fn build(
        snap_dfn: &Arc<SnapshotDefinition>,
        uuid: Uuid,
        vlm_nr: VolumeNumber,
        size_kib: u64,
        flags: SnapshotVolumeDefinitionFlags,
        obj_prot: Arc<ObjectProtection>,
        persisted: bool,
    ) -> Arc<Self> {
        let drivers = snap_dfn.core().drivers().clone();
        let resource_name = snap_dfn.resource_name().clone();
        let snapshot_name = snap_dfn.snapshot_name().clone();
        let key = db_key(&[resource_name.value(), snapshot_name.value(), &vlm_nr.to_string()]);
        let table = drivers.snapshot_volume_definitions.clone();
        Arc::new_cyclic(|weak| {
            let core = EntityCore::new(
                KIND,
                format!("{}/{}/{}", resource_name, snapshot_name, vlm_nr),
                uuid,
                obj_prot.clone(),
                &drivers,
                ExistenceDriver::new(weak.clone(), table.clone(), key.clone(), Self::row),
                persisted,
            );
            let scope_lock = core.scope_lock().clone();
            Self {
                core,
                snapshot_definition: Arc::downgrade(snap_dfn),
                size_kib: TransactionSimpleObject::new(
                    size_kib,
                    Some(ColumnDriver::new(table.clone(), key.clone(), columns::SIZE_KIB)),
                ),
                flags: StateFlags::new(obj_prot, flags, Some(ColumnDriver::new(table, key, columns::FLAGS)))
                    .with_scope_lock(scope_lock),
                resource_name,
                snapshot_name,
                vlm_nr,
                snapshot_volumes: TransactionMap::new(None),
            }
        })
    }

    /// Looks up or creates volume `vlm_nr` of a snapshot definition.
    /// Creation requires CHANGE on the snapshot definition.
    pub fn get_instance(
        ctx: &AccessContext,
        tx: &TransactionMgr,
        snap_dfn: &Arc<SnapshotDefinition>,
        vlm_nr: VolumeNumber,
        size_kib: u64,
        flags: SnapshotVolumeDefinitionFlags,
        mode: InstanceMode,
    ) -> Result<Option<Arc<Self>>> {
        snap_dfn.core().require_in(ctx, tx, AccessType::View)?;
        let _guard = snap_dfn.core().lock();
        let existing = snap_dfn.snapshot_volume_definitions.get(&vlm_nr);
        mode.resolve_in(
            tx,
            existing,
            KIND,
            || format!("{}/{}/{}", snap_dfn.resource_name(), snap_dfn.snapshot_name(), vlm_nr),
            || {
                snap_dfn.core().require_in(ctx, tx, AccessType::Change)?;
                let size_kib = check_volume_size(size_kib)?;
                let obj_prot = ObjectProtection::create(
                    ctx,
                    tx,
                    paths::snapshot_volume_definition(snap_dfn.resource_name(), snap_dfn.snapshot_name(), vlm_nr),
                    snap_dfn.core().drivers(),
                )?;
                let snap_vlm_dfn = Self::build(snap_dfn, Uuid::new_v4(), vlm_nr, size_kib, flags, obj_prot, false);
                snap_vlm_dfn.core.persist(tx)?;
                snap_dfn
                    .snapshot_volume_definitions
                    .insert(tx, vlm_nr, snap_vlm_dfn.clone())?;
                debug!(
                    "Created snapshot volume definition {}/{}/{}",
                    snap_dfn.resource_name(),
                    snap_dfn.snapshot_name(),
                    vlm_nr
                );
                Ok(snap_vlm_dfn)
            },
        )
    }

    pub(crate) fn restore(
        snap_dfn: &Arc<SnapshotDefinition>,
        uuid: Uuid,
        vlm_nr: VolumeNumber,
        size_kib: u64,
        flags: SnapshotVolumeDefinitionFlags,
        obj_prot: Arc<ObjectProtection>,
    ) -> Arc<Self> {
        let snap_vlm_dfn = Self::build(snap_dfn, uuid, vlm_nr, size_kib, flags, obj_prot, true);
        snap_dfn.snapshot_volume_definitions.restore(vlm_nr, snap_vlm_dfn.clone());
        snap_vlm_dfn
    }

    fn row(&self) -> SnapshotVolumeDefinitionRow {
        SnapshotVolumeDefinitionRow {
            uuid: self.core.raw_uuid().to_string(),
            resource_name: self.resource_name.display_name().to_string(),
            snapshot_name: self.snapshot_name.display_name().to_string(),
            volume_number: i64::from(self.vlm_nr.value()),
            size_kib: self.size_kib.get() as i64,
            flags: self.flags.raw_bits(),
        }
    }

    pub(crate) fn raw_volume_number(&self) -> VolumeNumber {
        self.vlm_nr
    }

    pub fn snapshot_definition(&self) -> Result<Arc<SnapshotDefinition>> {
        self.core.check_deleted()?;
        upgrade(&self.snapshot_definition, "snapshot definition", self.core.key())
    }

    pub fn volume_number(&self) -> Result<VolumeNumber> {
        self.core.check_deleted()?;
        Ok(self.vlm_nr)
    }

    pub fn volume_size(&self, ctx: &AccessContext) -> Result<u64> {
        self.core.require(ctx, AccessType::View)?;
        Ok(self.size_kib.get())
    }

    /// Returns the previous size
    pub fn set_volume_size(&self, ctx: &AccessContext, tx: &TransactionMgr, size_kib: u64) -> Result<u64> {
        self.core.require_in(ctx, tx, AccessType::Change)?;
        self.size_kib.set(tx, check_volume_size(size_kib)?)
    }

    pub fn flags(&self) -> Result<&StateFlags<SnapshotVolumeDefinitionFlags>> {
        self.core.check_deleted()?;
        Ok(&self.flags)
    }

    pub fn snapshot_volume(&self, ctx: &AccessContext, node_name: &NodeName) -> Result<Option<Arc<SnapshotVolume>>> {
        self.core.require(ctx, AccessType::View)?;
        Ok(self.snapshot_volumes.get(node_name))
    }

    pub fn snapshot_volumes(&self, ctx: &AccessContext) -> Result<Vec<Arc<SnapshotVolume>>> {
        self.core.require(ctx, AccessType::View)?;
        Ok(self.snapshot_volumes.values())
    }

    pub fn delete(&self, ctx: &AccessContext, tx: &TransactionMgr) -> Result<()> {
        self.core.require_in(ctx, tx, AccessType::Control)?;
        for snap_vlm in self.snapshot_volumes.values() {
            snap_vlm.delete(ctx, tx)?;
        }

        let snap_dfn = upgrade(&self.snapshot_definition, "snapshot definition", self.core.key())?;
        {
            let _guard = snap_dfn.core().lock();
            snap_dfn.snapshot_volume_definitions.remove(tx, &self.vlm_nr)?;
        }
        self.core.destroy(tx)?;
        debug!(
            "Deleted snapshot volume definition {}/{}/{}",
            self.resource_name, self.snapshot_name, self.vlm_nr
        );
        Ok(())
    }

    pub fn api_data(&self, ctx: &AccessContext) -> Result<SnapshotVolumeDefinitionApi> {
        self.core.require(ctx, AccessType::View)?;
        Ok(SnapshotVolumeDefinitionApi {
            uuid: self.core.raw_uuid(),
            volume_number: self.vlm_nr.value(),
            size_kib: self.size_kib.get(),
            flags: self.flags.raw_bits(),
        })
    }
}
