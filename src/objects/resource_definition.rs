//! Resource definition
//!
//! Cluster-wide description of a replicated resource: its replication
//! port, transport and shared secret, its volume definitions, and the
//! resources that deploy it on individual nodes.

use super::api::ResourceDefinitionApi;
use super::common::{entity_accessors, upgrade, EntityCore, InstanceMode};
use super::{CoreObjects, Resource, ResourceFlags, SnapshotDefinition, VolumeDefinition};
use crate::domain::{DrbdNodeId, NodeName, ResourceName, SnapshotName, TcpPortNumber, TransportType, VolumeNumber};
use crate::domain::{NODE_ID_MAX, NODE_ID_MIN};
use crate::error::Result;
use crate::numberpool;
use crate::persistence::{columns, db_key, ColumnDriver, ExistenceDriver, ResourceDefinitionRow};
use crate::security::{paths, AccessContext, AccessType, ObjectProtection};
use crate::stateflags::StateFlags;
use crate::transaction::{TransactionMap, TransactionMgr, TransactionSimpleObject};
use bitflags::bitflags;
use std::sync::{Arc, Weak};
use tracing::debug;
use uuid::Uuid;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ResourceDefinitionFlags: u64 {
        const DELETE = 1;
    }
}

const KIND: &str = "resource definition";

pub struct ResourceDefinition {
    core: EntityCore,
    objects: Weak<CoreObjects>,
    name: ResourceName,
    port: TransactionSimpleObject<TcpPortNumber>,
    transport_type: TransactionSimpleObject<TransportType>,
    secret: TransactionSimpleObject<String>,
    flags: StateFlags<ResourceDefinitionFlags>,
    pub(crate) volume_definitions: TransactionMap<VolumeNumber, Arc<VolumeDefinition>>,
    pub(crate) resources: TransactionMap<NodeName, Arc<Resource>>,
    pub(crate) snapshot_definitions: TransactionMap<SnapshotName, Arc<SnapshotDefinition>>,
}

entity_accessors!(ResourceDefinition);

impl ResourceDefinition {
    #[allow(clippy::too_many_arguments)]
    fn build(
        objects: &Arc<CoreObjects>,
        uuid: Uuid,
        name: ResourceName,
        port: TcpPortNumber,
        secret: String,
        transport_type: TransportType,
        flags: ResourceDefinitionFlags,
        obj_prot: Arc<ObjectProtection>,
        persisted: bool,
    ) -> Arc<Self> {
        let drivers = objects.drivers.clone();
        let key = db_key(&[name.value()]);
        let table = drivers.resource_definitions.clone();
        Arc::new_cyclic(|weak| {
            let core = EntityCore::new(
                KIND,
                name.display_name().to_string(),
                uuid,
                obj_prot.clone(),
                &drivers,
                ExistenceDriver::new(weak.clone(), table.clone(), key.clone(), Self::row),
                persisted,
            );
            let scope_lock = core.scope_lock().clone();
            Self {
                core,
                objects: Arc::downgrade(objects),
                port: TransactionSimpleObject::new(
                    port,
                    Some(ColumnDriver::new(table.clone(), key.clone(), columns::TCP_PORT)),
                ),
                transport_type: TransactionSimpleObject::new(
                    transport_type,
                    Some(ColumnDriver::new(table.clone(), key.clone(), columns::TRANSPORT_TYPE)),
                ),
                secret: TransactionSimpleObject::new(
                    secret,
                    Some(ColumnDriver::new(table.clone(), key.clone(), columns::SECRET)),
                ),
                flags: StateFlags::new(
                    obj_prot,
                    flags,
                    Some(ColumnDriver::new(table, key, columns::FLAGS)),
                )
                .with_scope_lock(scope_lock),
                name,
                volume_definitions: TransactionMap::new(None),
                resources: TransactionMap::new(None),
                snapshot_definitions: TransactionMap::new(None),
            }
        })
    }

    /// Looks up or creates a resource definition. Creation requires CHANGE
    /// access to the resource definition map.
    #[allow(clippy::too_many_arguments)]
    pub fn get_instance(
        ctx: &AccessContext,
        tx: &TransactionMgr,
        objects: &Arc<CoreObjects>,
        name: ResourceName,
        port: TcpPortNumber,
        secret: String,
        transport_type: TransportType,
        flags: ResourceDefinitionFlags,
        mode: InstanceMode,
    ) -> Result<Option<Arc<Self>>> {
        objects.resource_definitions_prot().require_access(ctx, AccessType::View)?;
        let _guard = objects.lock();
        let existing = objects.resource_definitions.get(&name);
        mode.resolve_in(
            tx,
            existing,
            KIND,
            || name.display_name().to_string(),
            || {
                objects
                    .resource_definitions_prot()
                    .require_access(ctx, AccessType::Change)?;
                objects.check_port_unused(port, &name)?;
                let obj_prot =
                    ObjectProtection::create(ctx, tx, paths::resource_definition(&name), &objects.drivers)?;
                let rsc_dfn = Self::build(
                    objects,
                    Uuid::new_v4(),
                    name.clone(),
                    port,
                    secret,
                    transport_type,
                    flags,
                    obj_prot,
                    false,
                );
                rsc_dfn.core.persist(tx)?;
                objects
                    .resource_definitions
                    .insert(tx, name.clone(), rsc_dfn.clone())?;
                debug!("Created resource definition {} on port {}", name, port);
                Ok(rsc_dfn)
            },
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn restore(
        objects: &Arc<CoreObjects>,
        uuid: Uuid,
        name: ResourceName,
        port: TcpPortNumber,
        secret: String,
        transport_type: TransportType,
        flags: ResourceDefinitionFlags,
        obj_prot: Arc<ObjectProtection>,
    ) -> Arc<Self> {
        let rsc_dfn = Self::build(
            objects,
            uuid,
            name.clone(),
            port,
            secret,
            transport_type,
            flags,
            obj_prot,
            true,
        );
        objects.resource_definitions.restore(name, rsc_dfn.clone());
        rsc_dfn
    }

    fn row(&self) -> ResourceDefinitionRow {
        ResourceDefinitionRow {
            uuid: self.core.raw_uuid().to_string(),
            resource_name: self.name.display_name().to_string(),
            tcp_port: i64::from(self.port.get().value()),
            transport_type: self.transport_type.get().as_str().to_string(),
            secret: self.secret.get(),
            flags: self.flags.raw_bits(),
        }
    }

    pub(crate) fn resource_name(&self) -> &ResourceName {
        &self.name
    }

    pub(crate) fn raw_port(&self) -> TcpPortNumber {
        self.port.get()
    }

    pub(crate) fn objects(&self) -> Result<Arc<CoreObjects>> {
        upgrade(&self.objects, "controller objects", self.core.key())
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn name(&self) -> Result<ResourceName> {
        self.core.check_deleted()?;
        Ok(self.name.clone())
    }

    pub fn port(&self, ctx: &AccessContext) -> Result<TcpPortNumber> {
        self.core.require(ctx, AccessType::View)?;
        Ok(self.port.get())
    }

    /// Fails with [`Error::DataAlreadyExists`](crate::Error::DataAlreadyExists)
    /// when another resource definition uses `port`
    pub fn set_port(&self, ctx: &AccessContext, tx: &TransactionMgr, port: TcpPortNumber) -> Result<TcpPortNumber> {
        self.core.require_in(ctx, tx, AccessType::Change)?;
        let objects = self.objects()?;
        let _guard = objects.lock();
        objects.check_port_unused(port, &self.name)?;
        self.port.set(tx, port)
    }

    pub fn transport_type(&self, ctx: &AccessContext) -> Result<TransportType> {
        self.core.require(ctx, AccessType::View)?;
        Ok(self.transport_type.get())
    }

    pub fn set_transport_type(
        &self,
        ctx: &AccessContext,
        tx: &TransactionMgr,
        transport_type: TransportType,
    ) -> Result<TransportType> {
        self.core.require_in(ctx, tx, AccessType::Change)?;
        self.transport_type.set(tx, transport_type)
    }

    pub fn secret(&self, ctx: &AccessContext) -> Result<String> {
        self.core.require(ctx, AccessType::View)?;
        Ok(self.secret.get())
    }

    pub fn set_secret(&self, ctx: &AccessContext, tx: &TransactionMgr, secret: String) -> Result<String> {
        self.core.require_in(ctx, tx, AccessType::Change)?;
        self.secret.set(tx, secret)
    }

    pub fn flags(&self) -> Result<&StateFlags<ResourceDefinitionFlags>> {
        self.core.check_deleted()?;
        Ok(&self.flags)
    }

    // =========================================================================
    // Collections
    // =========================================================================

    pub fn volume_definition(&self, ctx: &AccessContext, vlm_nr: VolumeNumber) -> Result<Option<Arc<VolumeDefinition>>> {
        self.core.require(ctx, AccessType::View)?;
        Ok(self.volume_definitions.get(&vlm_nr))
    }

    pub fn volume_definitions(&self, ctx: &AccessContext) -> Result<Vec<Arc<VolumeDefinition>>> {
        self.core.require(ctx, AccessType::View)?;
        Ok(self.volume_definitions.values())
    }

    pub fn resource(&self, ctx: &AccessContext, node_name: &NodeName) -> Result<Option<Arc<Resource>>> {
        self.core.require(ctx, AccessType::View)?;
        Ok(self.resources.get(node_name))
    }

    pub fn resources(&self, ctx: &AccessContext) -> Result<Vec<Arc<Resource>>> {
        self.core.require(ctx, AccessType::View)?;
        Ok(self.resources.values())
    }

    pub fn resource_count(&self, ctx: &AccessContext) -> Result<usize> {
        self.core.require(ctx, AccessType::View)?;
        Ok(self.resources.len())
    }

    pub fn snapshot_definition(
        &self,
        ctx: &AccessContext,
        snapshot_name: &SnapshotName,
    ) -> Result<Option<Arc<SnapshotDefinition>>> {
        self.core.require(ctx, AccessType::View)?;
        Ok(self.snapshot_definitions.get(snapshot_name))
    }

    pub fn snapshot_definitions(&self, ctx: &AccessContext) -> Result<Vec<Arc<SnapshotDefinition>>> {
        self.core.require(ctx, AccessType::View)?;
        Ok(self.snapshot_definitions.values())
    }

    /// Whether any resource of this definition is deployed without disk
    pub fn has_diskless(&self, ctx: &AccessContext) -> Result<bool> {
        self.core.require(ctx, AccessType::View)?;
        Ok(self
            .resources
            .values()
            .iter()
            .any(|rsc| rsc.raw_flags().contains(ResourceFlags::DISKLESS)))
    }

    /// Smallest DRBD node id not used by any resource of this definition
    pub fn next_free_node_id(&self, ctx: &AccessContext) -> Result<DrbdNodeId> {
        self.core.require(ctx, AccessType::View)?;
        let occupied = numberpool::sorted_numbers(
            self.resources
                .values()
                .iter()
                .map(|rsc| i64::from(rsc.raw_node_id().value())),
        );
        DrbdNodeId::new(numberpool::get_free_number(&occupied, NODE_ID_MIN, NODE_ID_MAX)?)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    pub fn mark_deleted(&self, ctx: &AccessContext, tx: &TransactionMgr) -> Result<()> {
        self.core.require_in(ctx, tx, AccessType::Control)?;
        self.flags.enable_flags(ctx, tx, ResourceDefinitionFlags::DELETE)
    }

    /// Deletes the definition with its snapshots, resources and volume
    /// definitions
    pub fn delete(&self, ctx: &AccessContext, tx: &TransactionMgr) -> Result<()> {
        self.core.require_in(ctx, tx, AccessType::Control)?;

        for snap_dfn in self.snapshot_definitions.values() {
            snap_dfn.delete(ctx, tx)?;
        }
        for rsc in self.resources.values() {
            rsc.delete(ctx, tx)?;
        }
        for vlm_dfn in self.volume_definitions.values() {
            vlm_dfn.delete(ctx, tx)?;
        }

        let objects = self.objects()?;
        {
            let _guard = objects.lock();
            objects.resource_definitions.remove(tx, &self.name)?;
        }
        self.core.destroy(tx)?;
        debug!("Deleted resource definition {}", self.name);
        Ok(())
    }

    pub fn api_data(&self, ctx: &AccessContext) -> Result<ResourceDefinitionApi> {
        self.core.require(ctx, AccessType::View)?;
        let volume_definitions = self
            .volume_definitions
            .values()
            .iter()
            .map(|vlm_dfn| vlm_dfn.api_data(ctx))
            .collect::<Result<Vec<_>>>()?;
        Ok(ResourceDefinitionApi {
            uuid: self.core.raw_uuid(),
            name: self.name.display_name().to_string(),
            port: self.port.get().value(),
            transport_type: self.transport_type.get(),
            secret: self.secret.get(),
            flags: self.flags.raw_bits(),
            props: self.core.raw_props().map(),
            volume_definitions,
            nodes: self
                .resources
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
    use crate::persistence::{ResourceDefinitionRow, PersistedRow};
    use assert_matches::assert_matches;

    #[test]
    fn test_next_free_node_id_takes_smallest_gap() {
        let fx = Fixture::new();
        let tx = fx.tx();
        let rsc_dfn = fx.rsc_dfn(&tx, "r1", 7000);
        assert_eq!(rsc_dfn.next_free_node_id(&fx.ctx).unwrap().value(), 0);
        for (idx, name) in ["n1", "n2", "n3"].iter().enumerate() {
            let node = fx.node(&tx, name);
            fx.resource(&tx, &node, &rsc_dfn, idx as i64);
        }
        assert_eq!(rsc_dfn.next_free_node_id(&fx.ctx).unwrap().value(), 3);
        tx.commit().unwrap();
    }

    #[test]
    fn test_setters_persist_columns() {
        let fx = Fixture::new();
        let tx = fx.tx();
        let rsc_dfn = fx.rsc_dfn(&tx, "r1", 7000);
        tx.commit().unwrap();
        fx.db.clear_journal();

        let tx = fx.tx();
        rsc_dfn.set_port(&fx.ctx, &tx, TcpPortNumber::new(7001).unwrap()).unwrap();
        rsc_dfn.set_secret(&fx.ctx, &tx, "other".into()).unwrap();
        rsc_dfn.set_transport_type(&fx.ctx, &tx, TransportType::Rdma).unwrap();
        assert_eq!(tx.commit().unwrap().writes, 3);

        let journal = fx.db.journal();
        assert_eq!(journal[0].writes_for(ResourceDefinitionRow::TABLE).count(), 3);
        assert_eq!(rsc_dfn.port(&fx.ctx).unwrap().value(), 7001);
    }

    #[test]
    fn test_port_in_use_is_rejected() {
        let fx = Fixture::new();
        let tx = fx.tx();
        let r1 = fx.rsc_dfn(&tx, "r1", 7000);
        let r2 = fx.rsc_dfn(&tx, "r2", 7001);
        tx.commit().unwrap();

        let tx = fx.tx();
        assert_matches!(
            ResourceDefinition::get_instance(
                &fx.ctx,
                &tx,
                &fx.objects,
                ResourceName::new("r3").unwrap(),
                TcpPortNumber::new(7000).unwrap(),
                "secret".into(),
                TransportType::Ip,
                ResourceDefinitionFlags::empty(),
                InstanceMode::Create,
            ),
            Err(Error::DataAlreadyExists { kind: "TCP port", .. })
        );
        assert_matches!(
            r2.set_port(&fx.ctx, &tx, TcpPortNumber::new(7000).unwrap()),
            Err(Error::DataAlreadyExists { kind: "TCP port", .. })
        );
        // keeping its own port is not a collision
        r1.set_port(&fx.ctx, &tx, TcpPortNumber::new(7000).unwrap()).unwrap();
        tx.commit().unwrap();

        assert_eq!(fx.objects.resource_definition_count(), 2);
        assert_eq!(r2.port(&fx.ctx).unwrap().value(), 7001);
    }

    #[test]
    fn test_delete_cascades_to_children() {
        let fx = Fixture::new();
        let tx = fx.tx();
        let node = fx.node(&tx, "n1");
        let rsc_dfn = fx.rsc_dfn(&tx, "r1", 7000);
        let vlm_dfn = fx.vlm_dfn(&tx, &rsc_dfn, 0, 1000);
        let rsc = fx.resource(&tx, &node, &rsc_dfn, 0);
        tx.commit().unwrap();

        let tx = fx.tx();
        rsc_dfn.delete(&fx.ctx, &tx).unwrap();
        tx.commit().unwrap();

        assert!(rsc.is_deleted());
        assert!(vlm_dfn.is_deleted());
        assert!(node.resources(&fx.ctx).unwrap().is_empty());
        assert_eq!(fx.objects.resource_definition_count(), 0);
        assert_matches!(rsc_dfn.port(&fx.ctx), Err(Error::AccessToDeleted { .. }));
        assert_matches!(rsc_dfn.next_free_node_id(&fx.ctx), Err(Error::AccessToDeleted { .. }));
        assert_matches!(rsc_dfn.api_data(&fx.ctx), Err(Error::AccessToDeleted { .. }));
        assert_eq!(fx.db.row_count(ResourceDefinitionRow::TABLE), 0);
    }

    #[test]
    fn test_mark_deleted_requires_control() {
        let fx = Fixture::new();
        let tx = fx.tx();
        let rsc_dfn = fx.rsc_dfn(&tx, "r1", 7000);
        tx.commit().unwrap();

        let changer = crate::security::AccessContext::new(
            crate::security::Identity::new("ops").unwrap(),
            crate::security::Role::new("ops").unwrap(),
            crate::security::SecurityType::public(),
            crate::security::Privilege::OBJ_CHANGE,
        );
        let tx = fx.tx();
        assert_matches!(
            rsc_dfn.mark_deleted(&changer, &tx),
            Err(Error::AccessDenied { requested: AccessType::Control, .. })
        );
        rsc_dfn.mark_deleted(&fx.ctx, &tx).unwrap();
        assert!(rsc_dfn
            .flags()
            .unwrap()
            .is_set(&fx.ctx, ResourceDefinitionFlags::DELETE)
            .unwrap());
    }
}
