//! Snapshot
//!
//! The part of a snapshot definition taken on one node. The
//! `suspend_resource` and `take_snapshot` bits drive the snapshot protocol
//! with the satellite and are never persisted.

use super::api::SnapshotApi;
use super::common::{entity_accessors, upgrade, EntityCore, InstanceMode};
use super::{Node, SnapshotDefinition, SnapshotVolume};
use crate::domain::{DrbdNodeId, NodeName, ResourceName, SnapshotName, VolumeNumber};
use crate::error::Result;
use crate::persistence::{columns, db_key, ColumnDriver, ExistenceDriver, SnapshotRow};
use crate::security::{paths, AccessContext, AccessType, ObjectProtection};
use crate::stateflags::StateFlags;
use crate::transaction::{TransactionMap, TransactionMgr, TransactionSimpleObject};
use bitflags::bitflags;
use std::sync::{Arc, Weak};
use tracing::debug;
use uuid::Uuid;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SnapshotFlags: u64 {
        const DELETE = 1;
    }
}

const KIND: &str = "snapshot";

pub struct Snapshot {
    core: EntityCore,
    node: Weak<Node>,
    snapshot_definition: Weak<SnapshotDefinition>,
    node_name: NodeName,
    resource_name: ResourceName,
    snapshot_name: SnapshotName,
    node_id: DrbdNodeId,
    flags: StateFlags<SnapshotFlags>,
    suspend_resource: TransactionSimpleObject<bool>,
    take_snapshot: TransactionSimpleObject<bool>,
    pub(crate) snapshot_volumes: TransactionMap<VolumeNumber, Arc<SnapshotVolume>>,
}

entity_accessors!(Snapshot);

impl Snapshot {
    fn build(
        node: &Arc<Node>,
        snap_dfn: &Arc<SnapshotDefinition>,
        uuid: Uuid,
        node_id: DrbdNodeId,
        flags: SnapshotFlags,
        obj_prot: Arc<ObjectProtection>,
        persisted: bool,
    ) -> Arc<Self> {
        let drivers = node.core().drivers().clone();
        let node_name = node.node_name().clone();
        let resource_name = snap_dfn.resource_name().clone();
        let snapshot_name = snap_dfn.snapshot_name().clone();
        let key = db_key(&[node_name.value(), resource_name.value(), snapshot_name.value()]);
        let table = drivers.snapshots.clone();
        Arc::new_cyclic(|weak| {
            let core = EntityCore::new(
                KIND,
                format!("{}/{}/{}", node_name, resource_name, snapshot_name),
                uuid,
                obj_prot.clone(),
                &drivers,
                ExistenceDriver::new(weak.clone(), table.clone(), key.clone(), Self::row),
                persisted,
            );
            let scope_lock = core.scope_lock().clone();
            Self {
                core,
                node: Arc::downgrade(node),
                snapshot_definition: Arc::downgrade(snap_dfn),
                flags: StateFlags::new(obj_prot, flags, Some(ColumnDriver::new(table, key, columns::FLAGS)))
                    .with_scope_lock(scope_lock),
                suspend_resource: TransactionSimpleObject::new(false, None),
                take_snapshot: TransactionSimpleObject::new(false, None),
                node_name,
                resource_name,
                snapshot_name,
                node_id,
                snapshot_volumes: TransactionMap::new(None),
            }
        })
    }

    /// Looks up or creates the snapshot of `snap_dfn` on `node`. Creation
    /// requires USE on the node and CHANGE on the snapshot definition.
    pub fn get_instance(
        ctx: &AccessContext,
        tx: &TransactionMgr,
        node: &Arc<Node>,
        snap_dfn: &Arc<SnapshotDefinition>,
        node_id: DrbdNodeId,
        flags: SnapshotFlags,
        mode: InstanceMode,
    ) -> Result<Option<Arc<Self>>> {
        node.core().require_in(ctx, tx, AccessType::View)?;
        snap_dfn.core().require_in(ctx, tx, AccessType::View)?;
        let _node_guard = node.core().lock();
        let _dfn_guard = snap_dfn.core().lock();
        let existing = snap_dfn.snapshots.get(node.node_name());
        mode.resolve_in(
            tx,
            existing,
            KIND,
            || format!("{}/{}/{}", node.node_name(), snap_dfn.resource_name(), snap_dfn.snapshot_name()),
            || {
                node.core().require_in(ctx, tx, AccessType::Use)?;
                snap_dfn.core().require_in(ctx, tx, AccessType::Change)?;
                let obj_prot = ObjectProtection::create(
                    ctx,
                    tx,
                    paths::snapshot(node.node_name(), snap_dfn.resource_name(), snap_dfn.snapshot_name()),
                    node.core().drivers(),
                )?;
                let snapshot = Self::build(node, snap_dfn, Uuid::new_v4(), node_id, flags, obj_prot, false);
                snapshot.core.persist(tx)?;
                node.snapshots.insert(
                    tx,
                    (snap_dfn.resource_name().clone(), snap_dfn.snapshot_name().clone()),
                    snapshot.clone(),
                )?;
                snap_dfn
                    .snapshots
                    .insert(tx, node.node_name().clone(), snapshot.clone())?;
                debug!(
                    "Created snapshot {}/{} on node {}",
                    snap_dfn.resource_name(),
                    snap_dfn.snapshot_name(),
                    node.node_name()
                );
                Ok(snapshot)
            },
        )
    }

    pub(crate) fn restore(
        node: &Arc<Node>,
        snap_dfn: &Arc<SnapshotDefinition>,
        uuid: Uuid,
        node_id: DrbdNodeId,
        flags: SnapshotFlags,
        obj_prot: Arc<ObjectProtection>,
    ) -> Arc<Self> {
        let snapshot = Self::build(node, snap_dfn, uuid, node_id, flags, obj_prot, true);
        node.snapshots.restore(
            (snap_dfn.resource_name().clone(), snap_dfn.snapshot_name().clone()),
            snapshot.clone(),
        );
        snap_dfn.snapshots.restore(node.node_name().clone(), snapshot.clone());
        snapshot
    }

    fn row(&self) -> SnapshotRow {
        SnapshotRow {
            uuid: self.core.raw_uuid().to_string(),
            node_name: self.node_name.display_name().to_string(),
            resource_name: self.resource_name.display_name().to_string(),
            snapshot_name: self.snapshot_name.display_name().to_string(),
            node_id: i64::from(self.node_id.value()),
            flags: self.flags.raw_bits(),
        }
    }

    pub(crate) fn node_name(&self) -> &NodeName {
        &self.node_name
    }

    pub(crate) fn resource_name(&self) -> &ResourceName {
        &self.resource_name
    }

    pub(crate) fn snapshot_name(&self) -> &SnapshotName {
        &self.snapshot_name
    }

    pub fn node(&self) -> Result<Arc<Node>> {
        self.core.check_deleted()?;
        upgrade(&self.node, "node", self.core.key())
    }

    pub fn snapshot_definition(&self) -> Result<Arc<SnapshotDefinition>> {
        self.core.check_deleted()?;
        upgrade(&self.snapshot_definition, "snapshot definition", self.core.key())
    }

    pub fn node_id(&self, ctx: &AccessContext) -> Result<DrbdNodeId> {
        self.core.require(ctx, AccessType::View)?;
        Ok(self.node_id)
    }

    pub fn flags(&self) -> Result<&StateFlags<SnapshotFlags>> {
        self.core.check_deleted()?;
        Ok(&self.flags)
    }

    pub fn suspend_resource(&self, ctx: &AccessContext) -> Result<bool> {
        self.core.require(ctx, AccessType::View)?;
        Ok(self.suspend_resource.get())
    }

    pub fn set_suspend_resource(&self, ctx: &AccessContext, tx: &TransactionMgr, suspend: bool) -> Result<bool> {
        self.core.require_in(ctx, tx, AccessType::Use)?;
        self.suspend_resource.set(tx, suspend)
    }

    pub fn take_snapshot(&self, ctx: &AccessContext) -> Result<bool> {
        self.core.require(ctx, AccessType::View)?;
        Ok(self.take_snapshot.get())
    }

    pub fn set_take_snapshot(&self, ctx: &AccessContext, tx: &TransactionMgr, take: bool) -> Result<bool> {
        self.core.require_in(ctx, tx, AccessType::Use)?;
        self.take_snapshot.set(tx, take)
    }

    pub fn snapshot_volume(&self, ctx: &AccessContext, vlm_nr: VolumeNumber) -> Result<Option<Arc<SnapshotVolume>>> {
        self.core.require(ctx, AccessType::View)?;
        Ok(self.snapshot_volumes.get(&vlm_nr))
    }

    pub fn snapshot_volumes(&self, ctx: &AccessContext) -> Result<Vec<Arc<SnapshotVolume>>> {
        self.core.require(ctx, AccessType::View)?;
        Ok(self.snapshot_volumes.values())
    }

    pub fn mark_deleted(&self, ctx: &AccessContext, tx: &TransactionMgr) -> Result<()> {
        self.core.require_in(ctx, tx, AccessType::Control)?;
        self.flags.enable_flags(ctx, tx, SnapshotFlags::DELETE)
    }

    pub fn delete(&self, ctx: &AccessContext, tx: &TransactionMgr) -> Result<()> {
        self.core.require_in(ctx, tx, AccessType::Control)?;
        for snap_vlm in self.snapshot_volumes.values() {
            snap_vlm.delete(ctx, tx)?;
        }

        let node = upgrade(&self.node, "node", self.core.key())?;
        let snap_dfn = upgrade(&self.snapshot_definition, "snapshot definition", self.core.key())?;
        {
            let _node_guard = node.core().lock();
            let _dfn_guard = snap_dfn.core().lock();
            node.snapshots
                .remove(tx, &(self.resource_name.clone(), self.snapshot_name.clone()))?;
            snap_dfn.snapshots.remove(tx, &self.node_name)?;
        }
        self.core.destroy(tx)?;
        debug!(
            "Deleted snapshot {}/{} on node {}",
            self.resource_name, self.snapshot_name, self.node_name
        );
        Ok(())
    }

    pub fn api_data(&self, ctx: &AccessContext) -> Result<SnapshotApi> {
        self.core.require(ctx, AccessType::View)?;
        let snapshot_volumes = self
            .snapshot_volumes
            .values()
            .iter()
            .map(|snap_vlm| snap_vlm.api_data(ctx))
            .collect::<Result<Vec<_>>>()?;
        Ok(SnapshotApi {
            uuid: self.core.raw_uuid(),
            node_name: self.node_name.display_name().to_string(),
            resource_name: self.resource_name.display_name().to_string(),
            snapshot_name: self.snapshot_name.display_name().to_string(),
            node_id: self.node_id.value(),
            flags: self.flags.raw_bits(),
            suspend_resource: self.suspend_resource.get(),
            take_snapshot: self.take_snapshot.get(),
            snapshot_volumes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::objects::test_support::Fixture;
    use crate::objects::SnapshotDefinitionFlags;
    use crate::persistence::{PersistedRow, WriteKind};
    use assert_matches::assert_matches;

    fn snap_dfn(fx: &Fixture, tx: &TransactionMgr) -> Arc<SnapshotDefinition> {
        let rsc_dfn = fx.rsc_dfn(tx, "r1", 7000);
        SnapshotDefinition::get_instance(
            &fx.ctx,
            tx,
            &rsc_dfn,
            SnapshotName::new("snap1").unwrap(),
            SnapshotDefinitionFlags::empty(),
            InstanceMode::Create,
        )
        .unwrap()
        .unwrap()
    }

    #[test]
    fn test_snapshot_registered_on_node_and_definition() {
        let fx = Fixture::new();
        let tx = fx.tx();
        let node = fx.node(&tx, "n1");
        let snap_dfn = snap_dfn(&fx, &tx);
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
        tx.commit().unwrap();

        let rsc_name = ResourceName::new("r1").unwrap();
        let snap_name = SnapshotName::new("SNAP1").unwrap();
        let on_node = node.snapshot(&fx.ctx, &rsc_name, &snap_name).unwrap().unwrap();
        assert!(Arc::ptr_eq(&on_node, &snapshot));
        assert_eq!(snap_dfn.api_data(&fx.ctx).unwrap().nodes, vec!["n1".to_string()]);
    }

    #[test]
    fn test_control_bits_are_not_persisted() {
        let fx = Fixture::new();
        let tx = fx.tx();
        let node = fx.node(&tx, "n1");
        let snap_dfn = snap_dfn(&fx, &tx);
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
        tx.commit().unwrap();
        fx.db.clear_journal();

        let tx = fx.tx();
        snapshot.set_suspend_resource(&fx.ctx, &tx, true).unwrap();
        snapshot.set_take_snapshot(&fx.ctx, &tx, true).unwrap();
        assert_eq!(tx.commit().unwrap().writes, 0);
        assert!(snapshot.suspend_resource(&fx.ctx).unwrap());
        assert!(snapshot.take_snapshot(&fx.ctx).unwrap());

        let tx = fx.tx();
        snapshot.mark_deleted(&fx.ctx, &tx).unwrap();
        tx.commit().unwrap();
        let journal = fx.db.journal();
        let writes: Vec<_> = journal[0].writes_for(SnapshotRow::TABLE).collect();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].kind(), WriteKind::Update);
    }

    #[test]
    fn test_node_delete_removes_snapshot() {
        let fx = Fixture::new();
        let tx = fx.tx();
        let node = fx.node(&tx, "n1");
        let snap_dfn = snap_dfn(&fx, &tx);
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
        tx.commit().unwrap();

        let tx = fx.tx();
        node.delete(&fx.ctx, &tx).unwrap();
        tx.commit().unwrap();
        assert!(snapshot.is_deleted());
        assert!(snap_dfn.snapshots(&fx.ctx).unwrap().is_empty());
        assert_matches!(snapshot.node(), Err(Error::AccessToDeleted { .. }));
    }
}
