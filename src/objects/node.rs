//! Node
//!
//! A machine of the storage cluster. Owns its network interfaces, storage
//! pools, deployed resources, snapshots and the connections to its peers.

use super::api::NodeApi;
use super::common::{entity_accessors, upgrade, EntityCore, InstanceMode};
use super::{CoreObjects, NetInterface, NodeConnection, Resource, Snapshot, StorPool};
use crate::domain::{NetInterfaceName, NodeName, NodeType, ResourceName, SnapshotName, StorPoolName};
use crate::error::{Error, Result};
use crate::persistence::{columns, db_key, ColumnDriver, ExistenceDriver, NodeRow};
use crate::security::{paths, AccessContext, AccessType, ObjectProtection};
use crate::stateflags::StateFlags;
use crate::transaction::{TransactionMap, TransactionMgr, TransactionSimpleObject};
use bitflags::bitflags;
use std::sync::{Arc, Weak};
use tracing::debug;
use uuid::Uuid;

bitflags! {
    /// State flags of a node
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct NodeFlags: u64 {
        const DELETE = 1;
        const EVICTED = Self::DELETE.bits() | 2;
        const EVACUATE = 4;
        const QIGNORE = 0x10000;
    }
}

const KIND: &str = "node";

pub struct Node {
    core: EntityCore,
    objects: Weak<CoreObjects>,
    name: NodeName,
    node_type: TransactionSimpleObject<NodeType>,
    flags: StateFlags<NodeFlags>,
    satellite_connection: TransactionSimpleObject<Option<NetInterfaceName>>,
    pub(crate) resources: TransactionMap<ResourceName, Arc<Resource>>,
    pub(crate) net_interfaces: TransactionMap<NetInterfaceName, Arc<NetInterface>>,
    pub(crate) stor_pools: TransactionMap<StorPoolName, Arc<StorPool>>,
    pub(crate) node_connections: TransactionMap<NodeName, Arc<NodeConnection>>,
    pub(crate) snapshots: TransactionMap<(ResourceName, SnapshotName), Arc<Snapshot>>,
}

entity_accessors!(Node);

impl Node {
    #[allow(clippy::too_many_arguments)]
    fn build(
        objects: &Arc<CoreObjects>,
        uuid: Uuid,
        name: NodeName,
        node_type: NodeType,
        flags: NodeFlags,
        satellite_connection: Option<NetInterfaceName>,
        obj_prot: Arc<ObjectProtection>,
        persisted: bool,
    ) -> Arc<Self> {
        let drivers = objects.drivers.clone();
        let key = db_key(&[name.value()]);
        Arc::new_cyclic(|weak| {
            let core = EntityCore::new(
                KIND,
                name.display_name().to_string(),
                uuid,
                obj_prot.clone(),
                &drivers,
                ExistenceDriver::new(weak.clone(), drivers.nodes.clone(), key.clone(), Self::row),
                persisted,
            );
            let scope_lock = core.scope_lock().clone();
            Self {
                core,
                objects: Arc::downgrade(objects),
                node_type: TransactionSimpleObject::new(
                    node_type,
                    Some(ColumnDriver::new(drivers.nodes.clone(), key.clone(), columns::NODE_TYPE)),
                ),
                flags: StateFlags::new(
                    obj_prot,
                    flags,
                    Some(ColumnDriver::new(drivers.nodes.clone(), key.clone(), columns::FLAGS)),
                )
                .with_scope_lock(scope_lock),
                satellite_connection: TransactionSimpleObject::new(
                    satellite_connection,
                    Some(ColumnDriver::new(drivers.nodes.clone(), key, columns::SATELLITE_CONNECTION)),
                ),
                name,
                resources: TransactionMap::new(None),
                net_interfaces: TransactionMap::new(None),
                stor_pools: TransactionMap::new(None),
                node_connections: TransactionMap::new(None),
                snapshots: TransactionMap::new(None),
            }
        })
    }

    /// Looks up or creates a node. Creation requires CHANGE access to the
    /// node map.
    pub fn get_instance(
        ctx: &AccessContext,
        tx: &TransactionMgr,
        objects: &Arc<CoreObjects>,
        name: NodeName,
        node_type: NodeType,
        flags: NodeFlags,
        mode: InstanceMode,
    ) -> Result<Option<Arc<Self>>> {
        objects.nodes_prot().require_access(ctx, AccessType::View)?;
        let _guard = objects.lock();
        let existing = objects.nodes.get(&name);
        mode.resolve_in(
            tx,
            existing,
            KIND,
            || name.display_name().to_string(),
            || {
                objects.nodes_prot().require_access(ctx, AccessType::Change)?;
                let obj_prot = ObjectProtection::create(ctx, tx, paths::node(&name), &objects.drivers)?;
                let node = Self::build(objects, Uuid::new_v4(), name.clone(), node_type, flags, None, obj_prot, false);
                node.core.persist(tx)?;
                objects.nodes.insert(tx, name.clone(), node.clone())?;
                debug!("Created node {}", name);
                Ok(node)
            },
        )
    }

    /// Rebuilds a stored node and registers it in the node map
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn restore(
        objects: &Arc<CoreObjects>,
        uuid: Uuid,
        name: NodeName,
        node_type: NodeType,
        flags: NodeFlags,
        satellite_connection: Option<NetInterfaceName>,
        obj_prot: Arc<ObjectProtection>,
    ) -> Arc<Self> {
        let node = Self::build(objects, uuid, name.clone(), node_type, flags, satellite_connection, obj_prot, true);
        objects.nodes.restore(name, node.clone());
        node
    }

    fn row(&self) -> NodeRow {
        NodeRow {
            uuid: self.core.raw_uuid().to_string(),
            node_name: self.name.display_name().to_string(),
            node_type: self.node_type.get().flag_value(),
            flags: self.flags.raw_bits(),
            satellite_connection: self
                .satellite_connection
                .get()
                .map(|name| name.display_name().to_string()),
        }
    }

    pub(crate) fn node_name(&self) -> &NodeName {
        &self.name
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn name(&self) -> Result<NodeName> {
        self.core.check_deleted()?;
        Ok(self.name.clone())
    }

    pub fn node_type(&self, ctx: &AccessContext) -> Result<NodeType> {
        self.core.require(ctx, AccessType::View)?;
        Ok(self.node_type.get())
    }

    pub fn set_node_type(&self, ctx: &AccessContext, tx: &TransactionMgr, node_type: NodeType) -> Result<NodeType> {
        self.core.require_in(ctx, tx, AccessType::Change)?;
        self.node_type.set(tx, node_type)
    }

    /// Whether the node acts in the role of `node_type`
    pub fn has_node_type(&self, ctx: &AccessContext, node_type: NodeType) -> Result<bool> {
        self.core.require(ctx, AccessType::View)?;
        Ok(self.node_type.get().includes(node_type))
    }

    pub fn flags(&self) -> Result<&StateFlags<NodeFlags>> {
        self.core.check_deleted()?;
        Ok(&self.flags)
    }

    /// Network interface used to reach the satellite of this node
    pub fn satellite_connection(&self, ctx: &AccessContext) -> Result<Option<Arc<NetInterface>>> {
        self.core.require(ctx, AccessType::View)?;
        Ok(self
            .satellite_connection
            .get()
            .and_then(|name| self.net_interfaces.get(&name)))
    }

    /// Selects one of the node's own interfaces, or none
    pub fn set_satellite_connection(
        &self,
        ctx: &AccessContext,
        tx: &TransactionMgr,
        net_if: Option<&NetInterfaceName>,
    ) -> Result<()> {
        self.core.require_in(ctx, tx, AccessType::Change)?;
        if let Some(name) = net_if {
            if !self.net_interfaces.contains_key(name) {
                return Err(Error::NotFound {
                    kind: "net interface",
                    key: format!("{}/{}", self.name, name),
                });
            }
        }
        self.satellite_connection.set(tx, net_if.cloned())?;
        Ok(())
    }

    /// Clears the satellite connection if it points to `net_if`
    pub(crate) fn release_satellite_connection(&self, tx: &TransactionMgr, net_if: &NetInterfaceName) -> Result<()> {
        if self.satellite_connection.with(|current| current.as_ref() == Some(net_if)) {
            self.satellite_connection.set(tx, None)?;
        }
        Ok(())
    }

    // =========================================================================
    // Collections
    // =========================================================================

    pub fn resource(&self, ctx: &AccessContext, rsc_name: &ResourceName) -> Result<Option<Arc<Resource>>> {
        self.core.require(ctx, AccessType::View)?;
        Ok(self.resources.get(rsc_name))
    }

    pub fn resources(&self, ctx: &AccessContext) -> Result<Vec<Arc<Resource>>> {
        self.core.require(ctx, AccessType::View)?;
        Ok(self.resources.values())
    }

    pub fn resource_count(&self, ctx: &AccessContext) -> Result<usize> {
        self.core.require(ctx, AccessType::View)?;
        Ok(self.resources.len())
    }

    pub fn net_interface(&self, ctx: &AccessContext, name: &NetInterfaceName) -> Result<Option<Arc<NetInterface>>> {
        self.core.require(ctx, AccessType::View)?;
        Ok(self.net_interfaces.get(name))
    }

    pub fn net_interfaces(&self, ctx: &AccessContext) -> Result<Vec<Arc<NetInterface>>> {
        self.core.require(ctx, AccessType::View)?;
        Ok(self.net_interfaces.values())
    }

    pub fn stor_pool(&self, ctx: &AccessContext, pool: &StorPoolName) -> Result<Option<Arc<StorPool>>> {
        self.core.require(ctx, AccessType::View)?;
        Ok(self.stor_pools.get(pool))
    }

    pub fn stor_pools(&self, ctx: &AccessContext) -> Result<Vec<Arc<StorPool>>> {
        self.core.require(ctx, AccessType::View)?;
        Ok(self.stor_pools.values())
    }

    /// First storage pool of this node backed by the diskless provider
    pub fn diskless_stor_pool(&self, ctx: &AccessContext) -> Result<Option<Arc<StorPool>>> {
        self.core.require(ctx, AccessType::View)?;
        Ok(self
            .stor_pools
            .values()
            .into_iter()
            .find(|pool| pool.raw_provider_kind().is_diskless()))
    }

    pub fn node_connection(&self, ctx: &AccessContext, peer: &NodeName) -> Result<Option<Arc<NodeConnection>>> {
        self.core.require(ctx, AccessType::View)?;
        Ok(self.node_connections.get(peer))
    }

    pub fn node_connections(&self, ctx: &AccessContext) -> Result<Vec<Arc<NodeConnection>>> {
        self.core.require(ctx, AccessType::View)?;
        Ok(self.node_connections.values())
    }

    pub fn snapshot(
        &self,
        ctx: &AccessContext,
        rsc_name: &ResourceName,
        snapshot_name: &SnapshotName,
    ) -> Result<Option<Arc<Snapshot>>> {
        self.core.require(ctx, AccessType::View)?;
        Ok(self.snapshots.get(&(rsc_name.clone(), snapshot_name.clone())))
    }

    pub fn snapshots(&self, ctx: &AccessContext) -> Result<Vec<Arc<Snapshot>>> {
        self.core.require(ctx, AccessType::View)?;
        Ok(self.snapshots.values())
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    pub fn mark_deleted(&self, ctx: &AccessContext, tx: &TransactionMgr) -> Result<()> {
        self.core.require_in(ctx, tx, AccessType::Control)?;
        self.flags.enable_flags(ctx, tx, NodeFlags::DELETE)
    }

    pub fn mark_evicted(&self, ctx: &AccessContext, tx: &TransactionMgr) -> Result<()> {
        self.core.require_in(ctx, tx, AccessType::Control)?;
        self.flags.enable_flags(ctx, tx, NodeFlags::EVICTED)
    }

    /// Clears the eviction marker, keeping a pending deletion
    pub fn unset_evicted(&self, ctx: &AccessContext, tx: &TransactionMgr) -> Result<()> {
        self.core.require_in(ctx, tx, AccessType::Control)?;
        let evicted_only = NodeFlags::from_bits_retain(NodeFlags::EVICTED.bits() & !NodeFlags::DELETE.bits());
        self.flags.disable_flags(ctx, tx, evicted_only)
    }

    pub fn is_evicted(&self, ctx: &AccessContext) -> Result<bool> {
        self.core.check_deleted()?;
        self.flags.is_set(ctx, NodeFlags::EVICTED)
    }

    /// Deletes the node together with everything deployed on it
    pub fn delete(&self, ctx: &AccessContext, tx: &TransactionMgr) -> Result<()> {
        self.core.require_in(ctx, tx, AccessType::Control)?;

        for conn in self.node_connections.values() {
            conn.delete(ctx, tx)?;
        }
        for snapshot in self.snapshots.values() {
            snapshot.delete(ctx, tx)?;
        }
        for rsc in self.resources.values() {
            rsc.delete(ctx, tx)?;
        }
        for pool in self.stor_pools.values() {
            pool.delete(ctx, tx)?;
        }
        for net_if in self.net_interfaces.values() {
            net_if.delete(ctx, tx)?;
        }

        let objects = upgrade(&self.objects, "controller objects", self.core.key())?;
        {
            let _guard = objects.lock();
            objects.nodes.remove(tx, &self.name)?;
        }
        self.core.destroy(tx)?;
        debug!("Deleted node {}", self.name);
        Ok(())
    }

    pub fn api_data(&self, ctx: &AccessContext) -> Result<NodeApi> {
        self.core.require(ctx, AccessType::View)?;
        let net_interfaces = self
            .net_interfaces
            .values()
            .iter()
            .map(|net_if| net_if.api_data(ctx))
            .collect::<Result<Vec<_>>>()?;
        Ok(NodeApi {
            uuid: self.core.raw_uuid(),
            name: self.name.display_name().to_string(),
            node_type: self.node_type.get(),
            flags: self.flags.raw_bits(),
            props: self.core.raw_props().map(),
            net_interfaces,
            satellite_connection: self
                .satellite_connection
                .get()
                .map(|name| name.display_name().to_string()),
            stor_pools: self
                .stor_pools
                .keys()
                .iter()
                .map(|name| name.display_name().to_string())
                .collect(),
            resources: self
                .resources
                .keys()
                .iter()
                .map(|name| name.display_name().to_string())
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DeviceProviderKind, NetInterfaceType};
    use crate::objects::test_support::Fixture;
    use crate::persistence::{Database, PersistedRow, WriteKind};
    use assert_matches::assert_matches;

    #[test]
    fn test_create_and_lookup() {
        let fx = Fixture::new();
        let tx = fx.tx();
        let node = fx.node(&tx, "alpha");
        tx.commit().unwrap();

        let name = NodeName::new("ALPHA").unwrap();
        let found = fx.objects.node(&fx.ctx, &name).unwrap().unwrap();
        assert!(Arc::ptr_eq(&node, &found));
        assert_eq!(node.name().unwrap().display_name(), "alpha");

        let tx = fx.tx();
        assert_matches!(
            Node::get_instance(
                &fx.ctx,
                &tx,
                &fx.objects,
                name.clone(),
                NodeType::Satellite,
                NodeFlags::empty(),
                InstanceMode::Create
            ),
            Err(Error::DataAlreadyExists { kind: "node", .. })
        );
        let loaded = Node::get_instance(
            &fx.ctx,
            &tx,
            &fx.objects,
            name,
            NodeType::Controller,
            NodeFlags::empty(),
            InstanceMode::LoadOrCreate,
        )
        .unwrap()
        .unwrap();
        assert!(Arc::ptr_eq(&node, &loaded));
        assert_eq!(loaded.node_type(&fx.ctx).unwrap(), NodeType::Satellite);
    }

    #[test]
    fn test_creation_is_persisted_in_order() {
        let fx = Fixture::new();
        let tx = fx.tx();
        fx.node(&tx, "alpha");
        tx.commit().unwrap();

        let journal = fx.db.journal();
        let writes: Vec<_> = journal[0].writes.iter().map(|w| (w.table(), w.kind())).collect();
        assert_eq!(writes.last(), Some(&(NodeRow::TABLE, WriteKind::Insert)));
        let row = fx.db.select(NodeRow::TABLE, "ALPHA").unwrap().unwrap();
        assert_eq!(row["node_type"], serde_json::json!(2));
    }

    #[test]
    fn test_debug_names_kind_and_key() {
        let fx = Fixture::new();
        let tx = fx.tx();
        let node = fx.node(&tx, "alpha");
        let debug = format!("{:?}", node);
        assert!(debug.starts_with("Node { kind: \"node\", key: \"alpha\""));
    }

    #[test]
    fn test_creation_requires_change_on_node_map() {
        let fx = Fixture::new();
        let tx = fx.tx();
        let viewer = fx.ctx.with_privileges(crate::security::Privilege::OBJ_VIEW);
        assert_matches!(
            Node::get_instance(
                &viewer,
                &tx,
                &fx.objects,
                NodeName::new("alpha").unwrap(),
                NodeType::Satellite,
                NodeFlags::empty(),
                InstanceMode::Create
            ),
            Err(Error::AccessDenied { requested: AccessType::Change, .. })
        );
        assert_eq!(tx.touched_count(), 0);
    }

    #[test]
    fn test_satellite_connection_follows_interfaces() {
        let fx = Fixture::new();
        let tx = fx.tx();
        let node = fx.node(&tx, "alpha");
        let eth0 = NetInterfaceName::new("eth0").unwrap();

        assert_matches!(
            node.set_satellite_connection(&fx.ctx, &tx, Some(&eth0)),
            Err(Error::NotFound { .. })
        );
        NetInterface::get_instance(
            &fx.ctx,
            &tx,
            &node,
            eth0.clone(),
            "10.0.0.1".parse().unwrap(),
            None,
            NetInterfaceType::Ip,
            InstanceMode::Create,
        )
        .unwrap();
        node.set_satellite_connection(&fx.ctx, &tx, Some(&eth0)).unwrap();
        assert!(node.satellite_connection(&fx.ctx).unwrap().is_some());

        node.net_interface(&fx.ctx, &eth0).unwrap().unwrap().delete(&fx.ctx, &tx).unwrap();
        assert!(node.satellite_connection(&fx.ctx).unwrap().is_none());
        tx.commit().unwrap();
    }

    #[test]
    fn test_eviction_flags() {
        let fx = Fixture::new();
        let tx = fx.tx();
        let node = fx.node(&tx, "alpha");

        node.mark_evicted(&fx.ctx, &tx).unwrap();
        assert!(node.is_evicted(&fx.ctx).unwrap());
        assert!(node.flags().unwrap().is_set(&fx.ctx, NodeFlags::DELETE).unwrap());
        node.unset_evicted(&fx.ctx, &tx).unwrap();
        assert!(!node.is_evicted(&fx.ctx).unwrap());
        assert!(node.flags().unwrap().is_set(&fx.ctx, NodeFlags::DELETE).unwrap());
        tx.commit().unwrap();
    }

    #[test]
    fn test_delete_cascades_and_blocks_access() {
        let fx = Fixture::new();
        let tx = fx.tx();
        let node = fx.node(&tx, "alpha");
        let peer = fx.node(&tx, "beta");
        fx.stor_pool(&tx, &node, "pool1", DeviceProviderKind::Lvm);
        let rsc_dfn = fx.rsc_dfn(&tx, "data1", 7000);
        fx.resource(&tx, &node, &rsc_dfn, 0);
        NodeConnection::get_instance(&fx.ctx, &tx, &node, &peer, InstanceMode::Create).unwrap();
        tx.commit().unwrap();

        let tx = fx.tx();
        node.delete(&fx.ctx, &tx).unwrap();
        tx.commit().unwrap();

        assert!(node.is_deleted());
        assert_matches!(node.name(), Err(Error::AccessToDeleted { kind: "node", .. }));
        assert_matches!(node.node_type(&fx.ctx), Err(Error::AccessToDeleted { .. }));
        assert_matches!(node.resources(&fx.ctx), Err(Error::AccessToDeleted { .. }));
        assert_matches!(node.props(&fx.ctx), Err(Error::AccessToDeleted { .. }));
        assert!(rsc_dfn.resources(&fx.ctx).unwrap().is_empty());
        assert!(peer.node_connections(&fx.ctx).unwrap().is_empty());
        assert_eq!(fx.objects.node_count(), 1);
        assert_eq!(fx.db.row_count(NodeRow::TABLE), 1);
    }

    #[test]
    fn test_failed_delete_restores_graph() {
        let fx = Fixture::new();
        let tx = fx.tx();
        let node = fx.node(&tx, "alpha");
        let rsc_dfn = fx.rsc_dfn(&tx, "data1", 7000);
        fx.resource(&tx, &node, &rsc_dfn, 0);
        tx.commit().unwrap();

        fx.db.reject_next(Some(NodeRow::TABLE), Some(WriteKind::Delete));
        let tx = fx.tx();
        node.delete(&fx.ctx, &tx).unwrap();
        assert_matches!(tx.commit(), Err(Error::Persistence(_)));

        assert!(!node.is_deleted());
        assert_eq!(node.resource_count(&fx.ctx).unwrap(), 1);
        assert_eq!(rsc_dfn.resources(&fx.ctx).unwrap().len(), 1);
        assert_eq!(fx.objects.node_count(), 1);
    }
}
