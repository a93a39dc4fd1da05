//! Snapshot definition
//!
//! A named point-in-time copy of a resource definition. Owns the snapshot
//! volume definitions (by volume number) and the per-node snapshots.

use super::api::SnapshotDefinitionApi;
use super::common::{entity_accessors, upgrade, EntityCore, InstanceMode};
use super::{ResourceDefinition, Snapshot, SnapshotVolumeDefinition};
use crate::domain::{NodeName, ResourceName, SnapshotName, VolumeNumber};
use crate::error::Result;
use crate::persistence::{columns, db_key, ColumnDriver, ExistenceDriver, SnapshotDefinitionRow};
use crate::security::{paths, AccessContext, AccessType, ObjectProtection};
use crate::stateflags::StateFlags;
use crate::transaction::{TransactionMap, TransactionMgr};
use bitflags::bitflags;
use std::sync::{Arc, Weak};
use tracing::debug;
use uuid::Uuid;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SnapshotDefinitionFlags: u64 {
        const SUCCESSFUL = 1;
        const FAILED_DEPLOYMENT = 2;
        const FAILED_DISCONNECT = 4;
        const DELETE = 8;
    }
}

const KIND: &str = "snapshot definition";

pub struct SnapshotDefinition {
    core: EntityCore,
    definition: Weak<ResourceDefinition>,
    resource_name: ResourceName,
    snapshot_name: SnapshotName,
    flags: StateFlags<SnapshotDefinitionFlags>,
    pub(crate) snapshot_volume_definitions: TransactionMap<VolumeNumber, Arc<SnapshotVolumeDefinition>>,
    pub(crate) snapshots: TransactionMap<NodeName, Arc<Snapshot>>,
}

entity_accessors!(SnapshotDefinition);

impl SnapshotDefinition {
    fn build(
        definition: &Arc<ResourceDefinition>,
        uuid: Uuid,
        snapshot_name: SnapshotName,
        flags: SnapshotDefinitionFlags,
        obj_prot: Arc<ObjectProtection>,
        persisted: bool,
    ) -> Arc<Self> {
        let drivers = definition.core().drivers().clone();
        let resource_name = definition.resource_name().clone();
        let key = db_key(&[resource_name.value(), snapshot_name.value()]);
        let table = drivers.snapshot_definitions.clone();
        Arc::new_cyclic(|weak| {
            let core = EntityCore::new(
                KIND,
                format!("{}/{}", resource_name, snapshot_name),
                uuid,
                obj_prot.clone(),
                &drivers,
                ExistenceDriver::new(weak.clone(), table.clone(), key.clone(), Self::row),
                persisted,
            );
            let scope_lock = core.scope_lock().clone();
            Self {
                core,
                definition: Arc::downgrade(definition),
                flags: StateFlags::new(obj_prot, flags, Some(ColumnDriver::new(table, key, columns::FLAGS)))
                    .with_scope_lock(scope_lock),
                resource_name,
                snapshot_name,
                snapshot_volume_definitions: TransactionMap::new(None),
                snapshots: TransactionMap::new(None),
            }
        })
    }

    /// Looks up or creates snapshot `snapshot_name` of `definition`.
    /// Creation requires CHANGE on the resource definition.
    pub fn get_instance(
        ctx: &AccessContext,
        tx: &TransactionMgr,
        definition: &Arc<ResourceDefinition>,
        snapshot_name: SnapshotName,
        flags: SnapshotDefinitionFlags,
        mode: InstanceMode,
    ) -> Result<Option<Arc<Self>>> {
        definition.core().require_in(ctx, tx, AccessType::View)?;
        let _guard = definition.core().lock();
        let existing = definition.snapshot_definitions.get(&snapshot_name);
        mode.resolve_in(
            tx,
            existing,
            KIND,
            || format!("{}/{}", definition.resource_name(), snapshot_name),
            || {
                definition.core().require_in(ctx, tx, AccessType::Change)?;
                let obj_prot = ObjectProtection::create(
                    ctx,
                    tx,
                    paths::snapshot_definition(definition.resource_name(), &snapshot_name),
                    definition.core().drivers(),
                )?;
                let snap_dfn = Self::build(definition, Uuid::new_v4(), snapshot_name.clone(), flags, obj_prot, false);
                snap_dfn.core.persist(tx)?;
                definition
                    .snapshot_definitions
                    .insert(tx, snapshot_name.clone(), snap_dfn.clone())?;
                debug!("Created snapshot definition {}/{}", definition.resource_name(), snapshot_name);
                Ok(snap_dfn)
            },
        )
    }

    pub(crate) fn restore(
        definition: &Arc<ResourceDefinition>,
        uuid: Uuid,
        snapshot_name: SnapshotName,
        flags: SnapshotDefinitionFlags,
        obj_prot: Arc<ObjectProtection>,
    ) -> Arc<Self> {
        let snap_dfn = Self::build(definition, uuid, snapshot_name.clone(), flags, obj_prot, true);
        definition.snapshot_definitions.restore(snapshot_name, snap_dfn.clone());
        snap_dfn
    }

    fn row(&self) -> SnapshotDefinitionRow {
        SnapshotDefinitionRow {
            uuid: self.core.raw_uuid().to_string(),
            resource_name: self.resource_name.display_name().to_string(),
            snapshot_name: self.snapshot_name.display_name().to_string(),
            flags: self.flags.raw_bits(),
        }
    }

    pub(crate) fn resource_name(&self) -> &ResourceName {
        &self.resource_name
    }

    pub(crate) fn snapshot_name(&self) -> &SnapshotName {
        &self.snapshot_name
    }

    pub fn name(&self) -> Result<SnapshotName> {
        self.core.check_deleted()?;
        Ok(self.snapshot_name.clone())
    }

    pub fn resource_definition(&self) -> Result<Arc<ResourceDefinition>> {
        self.core.check_deleted()?;
        upgrade(&self.definition, "resource definition", self.core.key())
    }

    pub fn flags(&self) -> Result<&StateFlags<SnapshotDefinitionFlags>> {
        self.core.check_deleted()?;
        Ok(&self.flags)
    }

    pub fn snapshot_volume_definition(
        &self,
        ctx: &AccessContext,
        vlm_nr: VolumeNumber,
    ) -> Result<Option<Arc<SnapshotVolumeDefinition>>> {
        self.core.require(ctx, AccessType::View)?;
        Ok(self.snapshot_volume_definitions.get(&vlm_nr))
    }

    pub fn snapshot_volume_definitions(&self, ctx: &AccessContext) -> Result<Vec<Arc<SnapshotVolumeDefinition>>> {
        self.core.require(ctx, AccessType::View)?;
        Ok(self.snapshot_volume_definitions.values())
    }

    pub fn snapshot(&self, ctx: &AccessContext, node_name: &NodeName) -> Result<Option<Arc<Snapshot>>> {
        self.core.require(ctx, AccessType::View)?;
        Ok(self.snapshots.get(node_name))
    }

    pub fn snapshots(&self, ctx: &AccessContext) -> Result<Vec<Arc<Snapshot>>> {
        self.core.require(ctx, AccessType::View)?;
        Ok(self.snapshots.values())
    }

    pub fn mark_deleted(&self, ctx: &AccessContext, tx: &TransactionMgr) -> Result<()> {
        self.core.require_in(ctx, tx, AccessType::Control)?;
        self.flags.enable_flags(ctx, tx, SnapshotDefinitionFlags::DELETE)
    }

    /// Deletes the definition with all node snapshots and volume definitions
    pub fn delete(&self, ctx: &AccessContext, tx: &TransactionMgr) -> Result<()> {
        self.core.require_in(ctx, tx, AccessType::Control)?;
        for snapshot in self.snapshots.values() {
            snapshot.delete(ctx, tx)?;
        }
        for snap_vlm_dfn in self.snapshot_volume_definitions.values() {
            snap_vlm_dfn.delete(ctx, tx)?;
        }

        let definition = upgrade(&self.definition, "resource definition", self.core.key())?;
        {
            let _guard = definition.core().lock();
            definition.snapshot_definitions.remove(tx, &self.snapshot_name)?;
        }
        self.core.destroy(tx)?;
        debug!("Deleted snapshot definition {}/{}", self.resource_name, self.snapshot_name);
        Ok(())
    }

    pub fn api_data(&self, ctx: &AccessContext) -> Result<SnapshotDefinitionApi> {
        self.core.require(ctx, AccessType::View)?;
        let snapshot_volume_definitions = self
            .snapshot_volume_definitions
            .values()
            .iter()
            .map(|snap_vlm_dfn| snap_vlm_dfn.api_data(ctx))
            .collect::<Result<Vec<_>>>()?;
        Ok(SnapshotDefinitionApi {
            uuid: self.core.raw_uuid(),
            resource_name: self.resource_name.display_name().to_string(),
            snapshot_name: self.snapshot_name.display_name().to_string(),
            flags: self.flags.raw_bits(),
            props: self.core.raw_props().map(),
            snapshot_volume_definitions,
            nodes: self
                .snapshots
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
    use crate::error::Error;
    use crate::objects::test_support::Fixture;
    use crate::objects::SnapshotVolumeDefinitionFlags;
    use assert_matches::assert_matches;

    #[test]
    fn test_create_and_flags() {
        let fx = Fixture::new();
        let tx = fx.tx();
        let rsc_dfn = fx.rsc_dfn(&tx, "r1", 7000);
        let name = SnapshotName::new("snap1").unwrap();
        let snap_dfn = SnapshotDefinition::get_instance(
            &fx.ctx,
            &tx,
            &rsc_dfn,
            name.clone(),
            SnapshotDefinitionFlags::empty(),
            InstanceMode::Create,
        )
        .unwrap()
        .unwrap();
        snap_dfn
            .flags()
            .unwrap()
            .enable_flags(&fx.ctx, &tx, SnapshotDefinitionFlags::SUCCESSFUL)
            .unwrap();
        tx.commit().unwrap();

        let found = rsc_dfn.snapshot_definition(&fx.ctx, &name).unwrap().unwrap();
        assert!(Arc::ptr_eq(&found, &snap_dfn));
        assert!(snap_dfn
            .flags()
            .unwrap()
            .is_set(&fx.ctx, SnapshotDefinitionFlags::SUCCESSFUL)
            .unwrap());

        let tx = fx.tx();
        assert_matches!(
            SnapshotDefinition::get_instance(
                &fx.ctx,
                &tx,
                &rsc_dfn,
                name,
                SnapshotDefinitionFlags::empty(),
                InstanceMode::Create,
            ),
            Err(Error::DataAlreadyExists { .. })
        );
    }

    #[test]
    fn test_resource_definition_delete_cascades() {
        let fx = Fixture::new();
        let tx = fx.tx();
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
        tx.commit().unwrap();

        let tx = fx.tx();
        rsc_dfn.delete(&fx.ctx, &tx).unwrap();
        tx.commit().unwrap();
        assert!(snap_dfn.is_deleted());
        assert!(snap_vlm_dfn.is_deleted());
        assert_matches!(snap_dfn.name(), Err(Error::AccessToDeleted { .. }));
    }
}
