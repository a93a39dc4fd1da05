//! Cycle-Breaking Loader
//!
//! Rebuilds the entity graph from stored rows. The graph is cyclic
//! (resource definition → resource → node → other resource → resource
//! definition), so every load follows the same discipline:
//!
//! 1. Reuse an instance from the load cache or the live graph when one
//!    exists for the natural key.
//! 2. Restore the instance and register it (cache and parent maps) before
//!    touching any related entity, so a cycle back to the same key finds
//!    the partially built instance.
//! 3. Populate relationships in a fixed order: definition-level
//!    collections, then instance-level collections, connections last.
//!    Dependencies of an instance (its volume definition, its storage pool)
//!    are resolved on demand by natural key.
//!
//! Stored values that violate a domain invariant are reported as
//! [`Error::CorruptPersistedState`] and never defaulted.

use super::{
    db_key, AclRow, DatabaseDrivers, NetInterfaceRow, NodeConnectionRow, NodeRow, ObjectProtectionRow,
    PersistedRow, PropsRow, ResourceConnectionRow, ResourceDefinitionRow, ResourceRow, SnapshotDefinitionRow,
    SnapshotRow, SnapshotVolumeDefinitionRow, SnapshotVolumeRow, StorPoolDefinitionRow, StorPoolRow,
    VolumeConnectionRow, VolumeDefinitionRow, VolumeRow,
};
use crate::domain::{
    check_volume_size, DeviceProviderKind, DrbdNodeId, MinorNumber, NetInterfaceName, NetInterfaceType, NodeName,
    NodeType, ResourceName, SnapshotName, StorPoolName, TcpPortNumber, TransportType, VolumeNumber,
};
use crate::error::{Error, Result};
use crate::objects::common::EntityCore;
use crate::objects::{
    CoreObjects, NetInterface, Node, NodeConnection, Resource, ResourceConnection, ResourceDefinition, Snapshot,
    SnapshotDefinition, SnapshotVolume, SnapshotVolumeDefinition, StorPool, StorPoolDefinition, Volume,
    VolumeConnection, VolumeDefinition,
};
use crate::security::{paths, ObjectProtection};
use bitflags::Flags;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

// =============================================================================
// Load Cache and Summary
// =============================================================================

/// Instances reconstructed during one load scope, keyed by natural key
#[derive(Default)]
pub struct LoadCache {
    nodes: HashMap<NodeName, Arc<Node>>,
    resource_definitions: HashMap<ResourceName, Arc<ResourceDefinition>>,
    stor_pool_definitions: HashMap<StorPoolName, Arc<StorPoolDefinition>>,
    resources: HashMap<(NodeName, ResourceName), Arc<Resource>>,
    snapshot_definitions: HashMap<(ResourceName, SnapshotName), Arc<SnapshotDefinition>>,
}

impl LoadCache {
    pub fn len(&self) -> usize {
        self.nodes.len()
            + self.resource_definitions.len()
            + self.stor_pool_definitions.len()
            + self.resources.len()
            + self.snapshot_definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn clear(&mut self) {
        self.nodes.clear();
        self.resource_definitions.clear();
        self.stor_pool_definitions.clear();
        self.resources.clear();
        self.snapshot_definitions.clear();
    }
}

impl fmt::Debug for LoadCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadCache")
            .field("nodes", &self.nodes.len())
            .field("resource_definitions", &self.resource_definitions.len())
            .field("stor_pool_definitions", &self.stor_pool_definitions.len())
            .field("resources", &self.resources.len())
            .field("snapshot_definitions", &self.snapshot_definitions.len())
            .finish()
    }
}

/// Number of entities restored, per type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadSummary {
    pub nodes: usize,
    pub net_interfaces: usize,
    pub stor_pool_definitions: usize,
    pub stor_pools: usize,
    pub resource_definitions: usize,
    pub resources: usize,
    pub volume_definitions: usize,
    pub volumes: usize,
    pub connections: usize,
    pub snapshot_definitions: usize,
    pub snapshot_volume_definitions: usize,
    pub snapshots: usize,
    pub snapshot_volumes: usize,
}

impl LoadSummary {
    pub fn total(&self) -> usize {
        self.nodes
            + self.net_interfaces
            + self.stor_pool_definitions
            + self.stor_pools
            + self.resource_definitions
            + self.resources
            + self.volume_definitions
            + self.volumes
            + self.connections
            + self.snapshot_definitions
            + self.snapshot_volume_definitions
            + self.snapshots
            + self.snapshot_volumes
    }
}

// =============================================================================
// Conversion Helpers
// =============================================================================

fn checked<T, E: fmt::Display>(result: std::result::Result<T, E>, table: &'static str, key: &str) -> Result<T> {
    result.map_err(|err| Error::corrupt(table, key, err))
}

fn present<T>(value: Option<T>, table: &'static str, key: &str, reason: impl fmt::Display) -> Result<T> {
    value.ok_or_else(|| Error::corrupt(table, key, reason))
}

fn parse_uuid(text: &str, table: &'static str, key: &str) -> Result<Uuid> {
    checked(Uuid::parse_str(text), table, key)
}

fn parse_flags<F: Flags<Bits = u64>>(bits: u64, table: &'static str, key: &str) -> Result<F> {
    present(F::from_bits(bits), table, key, format_args!("unknown flag bits {:#x}", bits))
}

/// Compares a stored name with the upper-case value of a checked name
fn same(stored: &str, value: &str) -> bool {
    stored.to_uppercase() == value
}

/// The endpoint of a stored connection that is not `local`
fn peer_of<'a>(source: &'a str, target: &'a str, local: &NodeName) -> &'a str {
    if same(source, local.value()) {
        target
    } else {
        source
    }
}

// =============================================================================
// Loader
// =============================================================================

/// Restores entities into a [`CoreObjects`] graph
pub struct DatabaseLoader {
    objects: Arc<CoreObjects>,
    drivers: Arc<DatabaseDrivers>,
    cache: LoadCache,
    summary: LoadSummary,
}

impl DatabaseLoader {
    pub fn new(objects: Arc<CoreObjects>) -> Self {
        let drivers = objects.drivers().clone();
        Self {
            objects,
            drivers,
            cache: LoadCache::default(),
            summary: LoadSummary::default(),
        }
    }

    /// Entities restored by this loader so far
    pub fn summary(&self) -> LoadSummary {
        self.summary
    }

    pub fn cache(&self) -> &LoadCache {
        &self.cache
    }

    /// Forgets the instances of the current load scope. Entities already
    /// attached to the live graph stay where they are.
    pub fn clear_cache(&mut self) {
        debug!("Clearing load cache ({} entries)", self.cache.len());
        self.cache.clear();
    }

    /// Restores a stored protection object with its ACL
    pub fn load_protection(drivers: &DatabaseDrivers, path: &str) -> Result<Arc<ObjectProtection>> {
        let row = drivers
            .object_protection
            .load(path)?
            .ok_or_else(|| Error::corrupt(ObjectProtectionRow::TABLE, path, "object protection is missing"))?;
        let acl_rows = drivers.acl.load_matching(&|acl: &AclRow| acl.object_path == row.object_path)?;
        ObjectProtection::restore(&row, &acl_rows, drivers)
    }

    fn protection(&self, path: String) -> Result<Arc<ObjectProtection>> {
        Self::load_protection(&self.drivers, &path)
    }

    fn restore_props(&self, core: &EntityCore) -> Result<()> {
        let instance = core.raw_obj_prot().path();
        for row in self.drivers.props.load_matching(&|row: &PropsRow| row.instance == instance)? {
            core.raw_props().restore_entry(&row)?;
        }
        Ok(())
    }

    /// Restores every stored entity
    pub fn load_all(&mut self) -> Result<LoadSummary> {
        for row in self.drivers.stor_pool_definitions.load_all()? {
            let name = checked(StorPoolName::new(&row.pool_name), StorPoolDefinitionRow::TABLE, &row.primary_key())?;
            self.load_stor_pool_definition(&name)?;
        }
        for row in self.drivers.nodes.load_all()? {
            let name = checked(NodeName::new(&row.node_name), NodeRow::TABLE, &row.primary_key())?;
            self.load_node(&name)?;
        }
        for row in self.drivers.resource_definitions.load_all()? {
            let name = checked(ResourceName::new(&row.resource_name), ResourceDefinitionRow::TABLE, &row.primary_key())?;
            self.load_resource_definition(&name)?;
        }
        info!(
            "Loaded {} nodes, {} resource definitions, {} storage pool definitions ({} objects)",
            self.objects.node_count(),
            self.objects.resource_definition_count(),
            self.objects.stor_pool_definition_count(),
            self.summary.total()
        );
        Ok(self.summary)
    }

    // =========================================================================
    // Storage Pool Definitions
    // =========================================================================

    /// Storage pools are attached from the node side, so loading a
    /// definition restores only the definition itself.
    pub fn load_stor_pool_definition(&mut self, name: &StorPoolName) -> Result<Option<Arc<StorPoolDefinition>>> {
        if let Some(spdfn) = self
            .cache
            .stor_pool_definitions
            .get(name)
            .cloned()
            .or_else(|| self.objects.stor_pool_definitions.get(name))
        {
            return Ok(Some(spdfn));
        }
        let Some(row) = self.drivers.stor_pool_definitions.load(&db_key(&[name.value()]))? else {
            return Ok(None);
        };
        let key = row.primary_key();
        let uuid = parse_uuid(&row.uuid, StorPoolDefinitionRow::TABLE, &key)?;
        let obj_prot = self.protection(paths::stor_pool_definition(name))?;
        let spdfn = StorPoolDefinition::restore(&self.objects, uuid, name.clone(), obj_prot);
        self.restore_props(spdfn.core())?;
        self.cache.stor_pool_definitions.insert(name.clone(), spdfn.clone());
        self.summary.stor_pool_definitions += 1;
        debug!("Loaded storage pool definition {}", name);
        Ok(Some(spdfn))
    }

    fn require_stor_pool_definition(
        &mut self,
        name: &StorPoolName,
        table: &'static str,
        key: &str,
    ) -> Result<Arc<StorPoolDefinition>> {
        let spdfn = self.load_stor_pool_definition(name)?;
        present(spdfn, table, key, format_args!("storage pool definition {} does not exist", name))
    }

    // =========================================================================
    // Nodes
    // =========================================================================

    pub fn load_node(&mut self, name: &NodeName) -> Result<Option<Arc<Node>>> {
        if let Some(node) = self.known_node(name) {
            return Ok(Some(node));
        }
        match self.drivers.nodes.load(&db_key(&[name.value()]))? {
            Some(row) => self.restore_node(row).map(Some),
            None => Ok(None),
        }
    }

    fn known_node(&self, name: &NodeName) -> Option<Arc<Node>> {
        self.cache
            .nodes
            .get(name)
            .cloned()
            .or_else(|| self.objects.nodes.get(name))
    }

    fn require_node(&mut self, stored_name: &str, table: &'static str, key: &str) -> Result<Arc<Node>> {
        let name = checked(NodeName::new(stored_name), table, key)?;
        let node = self.load_node(&name)?;
        present(node, table, key, format_args!("node {} does not exist", name))
    }

    fn restore_node(&mut self, row: NodeRow) -> Result<Arc<Node>> {
        let table = NodeRow::TABLE;
        let key = row.primary_key();
        let name = checked(NodeName::new(&row.node_name), table, &key)?;
        if let Some(node) = self.known_node(&name) {
            return Ok(node);
        }
        let uuid = parse_uuid(&row.uuid, table, &key)?;
        let node_type = present(
            NodeType::from_flag_value(row.node_type),
            table,
            &key,
            format_args!("invalid node type {}", row.node_type),
        )?;
        let flags = parse_flags(row.flags, table, &key)?;
        let satellite_connection = checked(
            row.satellite_connection.as_deref().map(NetInterfaceName::new).transpose(),
            table,
            &key,
        )?;
        let obj_prot = self.protection(paths::node(&name))?;

        let node = Node::restore(&self.objects, uuid, name.clone(), node_type, flags, satellite_connection, obj_prot);
        self.restore_props(node.core())?;
        self.cache.nodes.insert(name.clone(), node.clone());
        self.summary.nodes += 1;
        debug!("Loaded node {}", name);

        let drivers = self.drivers.clone();
        for row in drivers
            .net_interfaces
            .load_matching(&|row: &NetInterfaceRow| same(&row.node_name, name.value()))?
        {
            self.restore_net_interface(&node, row)?;
        }
        for row in drivers
            .stor_pools
            .load_matching(&|row: &StorPoolRow| same(&row.node_name, name.value()))?
        {
            self.restore_stor_pool(&node, row)?;
        }
        for row in drivers
            .resources
            .load_matching(&|row: &ResourceRow| same(&row.node_name, name.value()))?
        {
            let rsc_dfn = self.require_resource_definition(&row.resource_name, ResourceRow::TABLE, &row.primary_key())?;
            self.restore_resource(&node, &rsc_dfn, row)?;
        }
        for row in drivers
            .snapshots
            .load_matching(&|row: &SnapshotRow| same(&row.node_name, name.value()))?
        {
            let row_key = row.primary_key();
            let rsc_dfn = self.require_resource_definition(&row.resource_name, SnapshotRow::TABLE, &row_key)?;
            let snap_dfn = self.require_snapshot_definition(&rsc_dfn, &row.snapshot_name, SnapshotRow::TABLE, &row_key)?;
            self.restore_snapshot(&node, &snap_dfn, row)?;
        }
        for row in drivers.node_connections.load_matching(&|row: &NodeConnectionRow| {
            same(&row.source_node, name.value()) || same(&row.target_node, name.value())
        })? {
            self.restore_node_connection(&node, row)?;
        }
        Ok(node)
    }

    fn restore_net_interface(&mut self, node: &Arc<Node>, row: NetInterfaceRow) -> Result<()> {
        let table = NetInterfaceRow::TABLE;
        let key = row.primary_key();
        let name = checked(NetInterfaceName::new(&row.net_if_name), table, &key)?;
        if node.net_interfaces.get(&name).is_some() {
            return Ok(());
        }
        let uuid = parse_uuid(&row.uuid, table, &key)?;
        let address = checked(row.address.parse::<IpAddr>(), table, &key)?;
        let port = checked(row.port.map(TcpPortNumber::new).transpose(), table, &key)?;
        let net_if_type = present(
            NetInterfaceType::parse(&row.net_if_type),
            table,
            &key,
            format_args!("invalid interface type {}", row.net_if_type),
        )?;
        let obj_prot = self.protection(paths::net_interface(node.node_name(), &name))?;
        let net_if = NetInterface::restore(node, uuid, name, address, port, net_if_type, obj_prot);
        self.restore_props(net_if.core())?;
        self.summary.net_interfaces += 1;
        Ok(())
    }

    fn restore_node_connection(&mut self, node: &Arc<Node>, row: NodeConnectionRow) -> Result<()> {
        let table = NodeConnectionRow::TABLE;
        let key = row.primary_key();
        let peer = self.require_node(peer_of(&row.source_node, &row.target_node, node.node_name()), table, &key)?;
        if node.node_connections.get(peer.node_name()).is_some() {
            return Ok(());
        }
        let uuid = parse_uuid(&row.uuid, table, &key)?;
        let (source, target) = crate::objects::canonical_pair(node, node.node_name(), &peer, peer.node_name());
        let obj_prot = self.protection(paths::node_connection(source.node_name(), target.node_name()))?;
        let conn = checked(NodeConnection::restore(node, &peer, uuid, obj_prot), table, &key)?;
        self.restore_props(conn.core())?;
        self.summary.connections += 1;
        Ok(())
    }

    // =========================================================================
    // Storage Pools
    // =========================================================================

    fn restore_stor_pool(&mut self, node: &Arc<Node>, row: StorPoolRow) -> Result<Arc<StorPool>> {
        let table = StorPoolRow::TABLE;
        let key = row.primary_key();
        let pool_name = checked(StorPoolName::new(&row.pool_name), table, &key)?;
        if let Some(pool) = node.stor_pools.get(&pool_name) {
            return Ok(pool);
        }
        let uuid = parse_uuid(&row.uuid, table, &key)?;
        let provider_kind = present(
            DeviceProviderKind::parse(&row.provider_kind),
            table,
            &key,
            format_args!("invalid provider kind {}", row.provider_kind),
        )?;
        let spdfn = self.require_stor_pool_definition(&pool_name, table, &key)?;
        let obj_prot = self.protection(paths::stor_pool(node.node_name(), &pool_name))?;
        let pool = StorPool::restore(node, &spdfn, uuid, provider_kind, obj_prot);
        self.restore_props(pool.core())?;
        self.summary.stor_pools += 1;
        Ok(pool)
    }

    fn require_stor_pool(
        &mut self,
        node: &Arc<Node>,
        stored_name: &str,
        table: &'static str,
        key: &str,
    ) -> Result<Arc<StorPool>> {
        let pool_name = checked(StorPoolName::new(stored_name), table, key)?;
        if let Some(pool) = node.stor_pools.get(&pool_name) {
            return Ok(pool);
        }
        match self
            .drivers
            .stor_pools
            .load(&db_key(&[node.node_name().value(), pool_name.value()]))?
        {
            Some(row) => self.restore_stor_pool(node, row),
            None => Err(Error::corrupt(
                table,
                key,
                format!("storage pool {} does not exist on node {}", pool_name, node.node_name()),
            )),
        }
    }

    // =========================================================================
    // Resource Definitions
    // =========================================================================

    pub fn load_resource_definition(&mut self, name: &ResourceName) -> Result<Option<Arc<ResourceDefinition>>> {
        if let Some(rsc_dfn) = self.known_resource_definition(name) {
            return Ok(Some(rsc_dfn));
        }
        match self.drivers.resource_definitions.load(&db_key(&[name.value()]))? {
            Some(row) => self.restore_resource_definition(row).map(Some),
            None => Ok(None),
        }
    }

    fn known_resource_definition(&self, name: &ResourceName) -> Option<Arc<ResourceDefinition>> {
        self.cache
            .resource_definitions
            .get(name)
            .cloned()
            .or_else(|| self.objects.resource_definitions.get(name))
    }

    fn require_resource_definition(
        &mut self,
        stored_name: &str,
        table: &'static str,
        key: &str,
    ) -> Result<Arc<ResourceDefinition>> {
        let name = checked(ResourceName::new(stored_name), table, key)?;
        let rsc_dfn = self.load_resource_definition(&name)?;
        present(rsc_dfn, table, key, format_args!("resource definition {} does not exist", name))
    }

    fn restore_resource_definition(&mut self, row: ResourceDefinitionRow) -> Result<Arc<ResourceDefinition>> {
        let table = ResourceDefinitionRow::TABLE;
        let key = row.primary_key();
        let name = checked(ResourceName::new(&row.resource_name), table, &key)?;
        if let Some(rsc_dfn) = self.known_resource_definition(&name) {
            return Ok(rsc_dfn);
        }
        let uuid = parse_uuid(&row.uuid, table, &key)?;
        let port = checked(TcpPortNumber::new(row.tcp_port), table, &key)?;
        let transport_type = present(
            TransportType::parse(&row.transport_type),
            table,
            &key,
            format_args!("invalid transport type {}", row.transport_type),
        )?;
        let flags = parse_flags(row.flags, table, &key)?;
        let obj_prot = self.protection(paths::resource_definition(&name))?;

        let rsc_dfn = ResourceDefinition::restore(
            &self.objects,
            uuid,
            name.clone(),
            port,
            row.secret,
            transport_type,
            flags,
            obj_prot,
        );
        self.restore_props(rsc_dfn.core())?;
        self.cache.resource_definitions.insert(name.clone(), rsc_dfn.clone());
        self.summary.resource_definitions += 1;
        debug!("Loaded resource definition {}", name);

        let drivers = self.drivers.clone();
        for row in drivers
            .volume_definitions
            .load_matching(&|row: &VolumeDefinitionRow| same(&row.resource_name, name.value()))?
        {
            self.restore_volume_definition(&rsc_dfn, row)?;
        }
        for row in drivers
            .resources
            .load_matching(&|row: &ResourceRow| same(&row.resource_name, name.value()))?
        {
            let node = self.require_node(&row.node_name, ResourceRow::TABLE, &row.primary_key())?;
            self.restore_resource(&node, &rsc_dfn, row)?;
        }
        for row in drivers
            .snapshot_definitions
            .load_matching(&|row: &SnapshotDefinitionRow| same(&row.resource_name, name.value()))?
        {
            self.restore_snapshot_definition(&rsc_dfn, row)?;
        }
        Ok(rsc_dfn)
    }

    fn restore_volume_definition(
        &mut self,
        rsc_dfn: &Arc<ResourceDefinition>,
        row: VolumeDefinitionRow,
    ) -> Result<Arc<VolumeDefinition>> {
        let table = VolumeDefinitionRow::TABLE;
        let key = row.primary_key();
        let vlm_nr = checked(VolumeNumber::new(row.volume_number), table, &key)?;
        if let Some(vlm_dfn) = rsc_dfn.volume_definitions.get(&vlm_nr) {
            return Ok(vlm_dfn);
        }
        let uuid = parse_uuid(&row.uuid, table, &key)?;
        let minor = checked(MinorNumber::new(row.minor_number), table, &key)?;
        let size_kib = checked(u64::try_from(row.size_kib), table, &key)?;
        let size_kib = checked(check_volume_size(size_kib), table, &key)?;
        let flags = parse_flags(row.flags, table, &key)?;
        let obj_prot = self.protection(paths::volume_definition(rsc_dfn.resource_name(), vlm_nr))?;
        let vlm_dfn = VolumeDefinition::restore(rsc_dfn, uuid, vlm_nr, minor, size_kib, flags, obj_prot);
        self.restore_props(vlm_dfn.core())?;
        self.summary.volume_definitions += 1;
        Ok(vlm_dfn)
    }

    fn require_volume_definition(
        &mut self,
        rsc_dfn: &Arc<ResourceDefinition>,
        vlm_nr: VolumeNumber,
        table: &'static str,
        key: &str,
    ) -> Result<Arc<VolumeDefinition>> {
        if let Some(vlm_dfn) = rsc_dfn.volume_definitions.get(&vlm_nr) {
            return Ok(vlm_dfn);
        }
        match self
            .drivers
            .volume_definitions
            .load(&db_key(&[rsc_dfn.resource_name().value(), &vlm_nr.to_string()]))?
        {
            Some(row) => self.restore_volume_definition(rsc_dfn, row),
            None => Err(Error::corrupt(
                table,
                key,
                format!("volume definition {}/{} does not exist", rsc_dfn.resource_name(), vlm_nr),
            )),
        }
    }

    // =========================================================================
    // Resources and Volumes
    // =========================================================================

    /// Loads the resource of `rsc_name` on `node_name`, restoring both
    /// parents first
    pub fn load_resource(&mut self, node_name: &NodeName, rsc_name: &ResourceName) -> Result<Option<Arc<Resource>>> {
        let Some(node) = self.load_node(node_name)? else {
            return Ok(None);
        };
        let Some(rsc_dfn) = self.load_resource_definition(rsc_name)? else {
            return Ok(None);
        };
        if let Some(rsc) = self.known_resource(&node, &rsc_dfn) {
            return Ok(Some(rsc));
        }
        match self
            .drivers
            .resources
            .load(&db_key(&[node_name.value(), rsc_name.value()]))?
        {
            Some(row) => self.restore_resource(&node, &rsc_dfn, row).map(Some),
            None => Ok(None),
        }
    }

    fn known_resource(&self, node: &Arc<Node>, rsc_dfn: &Arc<ResourceDefinition>) -> Option<Arc<Resource>> {
        self.cache
            .resources
            .get(&(node.node_name().clone(), rsc_dfn.resource_name().clone()))
            .cloned()
            .or_else(|| rsc_dfn.resources.get(node.node_name()))
    }

    fn require_resource(
        &mut self,
        node: &Arc<Node>,
        rsc_dfn: &Arc<ResourceDefinition>,
        table: &'static str,
        key: &str,
    ) -> Result<Arc<Resource>> {
        if let Some(rsc) = self.known_resource(node, rsc_dfn) {
            return Ok(rsc);
        }
        match self
            .drivers
            .resources
            .load(&db_key(&[node.node_name().value(), rsc_dfn.resource_name().value()]))?
        {
            Some(row) => self.restore_resource(node, rsc_dfn, row),
            None => Err(Error::corrupt(
                table,
                key,
                format!(
                    "resource {} does not exist on node {}",
                    rsc_dfn.resource_name(),
                    node.node_name()
                ),
            )),
        }
    }

    fn restore_resource(
        &mut self,
        node: &Arc<Node>,
        rsc_dfn: &Arc<ResourceDefinition>,
        row: ResourceRow,
    ) -> Result<Arc<Resource>> {
        if let Some(rsc) = self.known_resource(node, rsc_dfn) {
            return Ok(rsc);
        }
        let table = ResourceRow::TABLE;
        let key = row.primary_key();
        let uuid = parse_uuid(&row.uuid, table, &key)?;
        let node_id = checked(DrbdNodeId::new(row.node_id), table, &key)?;
        let flags = parse_flags(row.flags, table, &key)?;
        let node_name = node.node_name().clone();
        let rsc_name = rsc_dfn.resource_name().clone();
        let obj_prot = self.protection(paths::resource(&node_name, &rsc_name))?;

        let rsc = Resource::restore(node, rsc_dfn, uuid, node_id, flags, obj_prot);
        self.restore_props(rsc.core())?;
        self.cache
            .resources
            .insert((node_name.clone(), rsc_name.clone()), rsc.clone());
        self.summary.resources += 1;
        debug!("Loaded resource {} on node {}", rsc_name, node_name);

        let drivers = self.drivers.clone();
        for row in drivers.volumes.load_matching(&|row: &VolumeRow| {
            same(&row.node_name, node_name.value()) && same(&row.resource_name, rsc_name.value())
        })? {
            self.restore_volume(&rsc, rsc_dfn, node, row)?;
        }
        for row in drivers.resource_connections.load_matching(&|row: &ResourceConnectionRow| {
            same(&row.resource_name, rsc_name.value())
                && (same(&row.source_node, node_name.value()) || same(&row.target_node, node_name.value()))
        })? {
            self.restore_resource_connection(&rsc, rsc_dfn, row)?;
        }
        Ok(rsc)
    }

    fn restore_resource_connection(
        &mut self,
        rsc: &Arc<Resource>,
        rsc_dfn: &Arc<ResourceDefinition>,
        row: ResourceConnectionRow,
    ) -> Result<()> {
        let table = ResourceConnectionRow::TABLE;
        let key = row.primary_key();
        let peer_node = self.require_node(peer_of(&row.source_node, &row.target_node, rsc.node_name()), table, &key)?;
        let peer = self.require_resource(&peer_node, rsc_dfn, table, &key)?;
        if rsc.resource_connections.get(peer.node_name()).is_some() {
            return Ok(());
        }
        let uuid = parse_uuid(&row.uuid, table, &key)?;
        let (source, target) = crate::objects::canonical_pair(rsc, rsc.node_name(), &peer, peer.node_name());
        let obj_prot = self.protection(paths::resource_connection(
            source.node_name(),
            target.node_name(),
            rsc.resource_name(),
        ))?;
        let conn = checked(ResourceConnection::restore(rsc, &peer, uuid, obj_prot), table, &key)?;
        self.restore_props(conn.core())?;
        self.summary.connections += 1;
        Ok(())
    }

    fn restore_volume(
        &mut self,
        rsc: &Arc<Resource>,
        rsc_dfn: &Arc<ResourceDefinition>,
        node: &Arc<Node>,
        row: VolumeRow,
    ) -> Result<Arc<Volume>> {
        let table = VolumeRow::TABLE;
        let key = row.primary_key();
        let vlm_nr = checked(VolumeNumber::new(row.volume_number), table, &key)?;
        if let Some(volume) = rsc.volumes.get(&vlm_nr) {
            return Ok(volume);
        }
        let uuid = parse_uuid(&row.uuid, table, &key)?;
        let flags = parse_flags(row.flags, table, &key)?;
        let vlm_dfn = self.require_volume_definition(rsc_dfn, vlm_nr, table, &key)?;
        let pool = self.require_stor_pool(node, &row.stor_pool_name, table, &key)?;
        let obj_prot = self.protection(paths::volume(rsc.node_name(), rsc.resource_name(), vlm_nr))?;

        let volume = checked(
            Volume::restore(
                rsc,
                &vlm_dfn,
                &pool,
                uuid,
                row.block_device_path,
                row.meta_disk_path,
                flags,
                obj_prot,
            ),
            table,
            &key,
        )?;
        self.restore_props(volume.core())?;
        self.summary.volumes += 1;

        let node_name = rsc.node_name().clone();
        let rsc_name = rsc.resource_name().clone();
        let stored_nr = i64::from(vlm_nr.value());
        let drivers = self.drivers.clone();
        for row in drivers.volume_connections.load_matching(&|row: &VolumeConnectionRow| {
            row.volume_number == stored_nr
                && same(&row.resource_name, rsc_name.value())
                && (same(&row.source_node, node_name.value()) || same(&row.target_node, node_name.value()))
        })? {
            self.restore_volume_connection(&volume, rsc_dfn, row)?;
        }
        Ok(volume)
    }

    fn restore_volume_connection(
        &mut self,
        volume: &Arc<Volume>,
        rsc_dfn: &Arc<ResourceDefinition>,
        row: VolumeConnectionRow,
    ) -> Result<()> {
        let table = VolumeConnectionRow::TABLE;
        let key = row.primary_key();
        let vlm_nr = volume.raw_volume_number();
        let peer_node = self.require_node(peer_of(&row.source_node, &row.target_node, volume.node_name()), table, &key)?;
        let peer_rsc = self.require_resource(&peer_node, rsc_dfn, table, &key)?;
        let peer = match peer_rsc.volumes.get(&vlm_nr) {
            Some(peer) => peer,
            None => {
                let stored = self
                    .drivers
                    .volumes
                    .load(&db_key(&[
                        peer_node.node_name().value(),
                        rsc_dfn.resource_name().value(),
                        &vlm_nr.to_string(),
                    ]))?;
                let stored = present(stored, table, &key, "peer volume does not exist")?;
                self.restore_volume(&peer_rsc, rsc_dfn, &peer_node, stored)?
            }
        };
        if volume.volume_connections.get(peer.node_name()).is_some() {
            return Ok(());
        }
        let uuid = parse_uuid(&row.uuid, table, &key)?;
        let (source, target) = crate::objects::canonical_pair(volume, volume.node_name(), &peer, peer.node_name());
        let obj_prot = self.protection(paths::volume_connection(
            source.node_name(),
            target.node_name(),
            volume.resource_name(),
            vlm_nr,
        ))?;
        let conn = checked(VolumeConnection::restore(volume, &peer, uuid, obj_prot), table, &key)?;
        self.restore_props(conn.core())?;
        self.summary.connections += 1;
        Ok(())
    }

    // =========================================================================
    // Snapshots
    // =========================================================================

    fn require_snapshot_definition(
        &mut self,
        rsc_dfn: &Arc<ResourceDefinition>,
        stored_name: &str,
        table: &'static str,
        key: &str,
    ) -> Result<Arc<SnapshotDefinition>> {
        let snap_name = checked(SnapshotName::new(stored_name), table, key)?;
        if let Some(snap_dfn) = self.known_snapshot_definition(rsc_dfn, &snap_name) {
            return Ok(snap_dfn);
        }
        match self
            .drivers
            .snapshot_definitions
            .load(&db_key(&[rsc_dfn.resource_name().value(), snap_name.value()]))?
        {
            Some(row) => self.restore_snapshot_definition(rsc_dfn, row),
            None => Err(Error::corrupt(
                table,
                key,
                format!(
                    "snapshot definition {}/{} does not exist",
                    rsc_dfn.resource_name(),
                    snap_name
                ),
            )),
        }
    }

    fn known_snapshot_definition(
        &self,
        rsc_dfn: &Arc<ResourceDefinition>,
        snap_name: &SnapshotName,
    ) -> Option<Arc<SnapshotDefinition>> {
        self.cache
            .snapshot_definitions
            .get(&(rsc_dfn.resource_name().clone(), snap_name.clone()))
            .cloned()
            .or_else(|| rsc_dfn.snapshot_definitions.get(snap_name))
    }

    fn restore_snapshot_definition(
        &mut self,
        rsc_dfn: &Arc<ResourceDefinition>,
        row: SnapshotDefinitionRow,
    ) -> Result<Arc<SnapshotDefinition>> {
        let table = SnapshotDefinitionRow::TABLE;
        let key = row.primary_key();
        let snap_name = checked(SnapshotName::new(&row.snapshot_name), table, &key)?;
        if let Some(snap_dfn) = self.known_snapshot_definition(rsc_dfn, &snap_name) {
            return Ok(snap_dfn);
        }
        let uuid = parse_uuid(&row.uuid, table, &key)?;
        let flags = parse_flags(row.flags, table, &key)?;
        let rsc_name = rsc_dfn.resource_name().clone();
        let obj_prot = self.protection(paths::snapshot_definition(&rsc_name, &snap_name))?;

        let snap_dfn = SnapshotDefinition::restore(rsc_dfn, uuid, snap_name.clone(), flags, obj_prot);
        self.restore_props(snap_dfn.core())?;
        self.cache
            .snapshot_definitions
            .insert((rsc_name.clone(), snap_name.clone()), snap_dfn.clone());
        self.summary.snapshot_definitions += 1;
        debug!("Loaded snapshot definition {}/{}", rsc_name, snap_name);

        let drivers = self.drivers.clone();
        for row in drivers
            .snapshot_volume_definitions
            .load_matching(&|row: &SnapshotVolumeDefinitionRow| {
                same(&row.resource_name, rsc_name.value()) && same(&row.snapshot_name, snap_name.value())
            })?
        {
            self.restore_snapshot_volume_definition(&snap_dfn, row)?;
        }
        for row in drivers.snapshots.load_matching(&|row: &SnapshotRow| {
            same(&row.resource_name, rsc_name.value()) && same(&row.snapshot_name, snap_name.value())
        })? {
            let node = self.require_node(&row.node_name, SnapshotRow::TABLE, &row.primary_key())?;
            self.restore_snapshot(&node, &snap_dfn, row)?;
        }
        Ok(snap_dfn)
    }

    fn restore_snapshot_volume_definition(
        &mut self,
        snap_dfn: &Arc<SnapshotDefinition>,
        row: SnapshotVolumeDefinitionRow,
    ) -> Result<Arc<SnapshotVolumeDefinition>> {
        let table = SnapshotVolumeDefinitionRow::TABLE;
        let key = row.primary_key();
        let vlm_nr = checked(VolumeNumber::new(row.volume_number), table, &key)?;
        if let Some(snap_vlm_dfn) = snap_dfn.snapshot_volume_definitions.get(&vlm_nr) {
            return Ok(snap_vlm_dfn);
        }
        let uuid = parse_uuid(&row.uuid, table, &key)?;
        let size_kib = checked(u64::try_from(row.size_kib), table, &key)?;
        let size_kib = checked(check_volume_size(size_kib), table, &key)?;
        let flags = parse_flags(row.flags, table, &key)?;
        let obj_prot = self.protection(paths::snapshot_volume_definition(
            snap_dfn.resource_name(),
            snap_dfn.snapshot_name(),
            vlm_nr,
        ))?;
        let snap_vlm_dfn = SnapshotVolumeDefinition::restore(snap_dfn, uuid, vlm_nr, size_kib, flags, obj_prot);
        self.restore_props(snap_vlm_dfn.core())?;
        self.summary.snapshot_volume_definitions += 1;
        Ok(snap_vlm_dfn)
    }

    fn restore_snapshot(
        &mut self,
        node: &Arc<Node>,
        snap_dfn: &Arc<SnapshotDefinition>,
        row: SnapshotRow,
    ) -> Result<Arc<Snapshot>> {
        if let Some(snapshot) = snap_dfn.snapshots.get(node.node_name()) {
            return Ok(snapshot);
        }
        let table = SnapshotRow::TABLE;
        let key = row.primary_key();
        let uuid = parse_uuid(&row.uuid, table, &key)?;
        let node_id = checked(DrbdNodeId::new(row.node_id), table, &key)?;
        let flags = parse_flags(row.flags, table, &key)?;
        let obj_prot = self.protection(paths::snapshot(
            node.node_name(),
            snap_dfn.resource_name(),
            snap_dfn.snapshot_name(),
        ))?;

        let snapshot = Snapshot::restore(node, snap_dfn, uuid, node_id, flags, obj_prot);
        self.restore_props(snapshot.core())?;
        self.summary.snapshots += 1;

        let node_name = node.node_name().clone();
        let rsc_name = snap_dfn.resource_name().clone();
        let snap_name = snap_dfn.snapshot_name().clone();
        let drivers = self.drivers.clone();
        for row in drivers.snapshot_volumes.load_matching(&|row: &SnapshotVolumeRow| {
            same(&row.node_name, node_name.value())
                && same(&row.resource_name, rsc_name.value())
                && same(&row.snapshot_name, snap_name.value())
        })? {
            self.restore_snapshot_volume(&snapshot, snap_dfn, node, row)?;
        }
        Ok(snapshot)
    }

    fn restore_snapshot_volume(
        &mut self,
        snapshot: &Arc<Snapshot>,
        snap_dfn: &Arc<SnapshotDefinition>,
        node: &Arc<Node>,
        row: SnapshotVolumeRow,
    ) -> Result<()> {
        let table = SnapshotVolumeRow::TABLE;
        let key = row.primary_key();
        let vlm_nr = checked(VolumeNumber::new(row.volume_number), table, &key)?;
        if snapshot.snapshot_volumes.get(&vlm_nr).is_some() {
            return Ok(());
        }
        let uuid = parse_uuid(&row.uuid, table, &key)?;
        let snap_vlm_dfn = match snap_dfn.snapshot_volume_definitions.get(&vlm_nr) {
            Some(snap_vlm_dfn) => snap_vlm_dfn,
            None => {
                let stored = self.drivers.snapshot_volume_definitions.load(&db_key(&[
                    snap_dfn.resource_name().value(),
                    snap_dfn.snapshot_name().value(),
                    &vlm_nr.to_string(),
                ]))?;
                let stored = present(stored, table, &key, "snapshot volume definition does not exist")?;
                self.restore_snapshot_volume_definition(snap_dfn, stored)?
            }
        };
        let pool = self.require_stor_pool(node, &row.stor_pool_name, table, &key)?;
        let obj_prot = self.protection(paths::snapshot_volume(
            node.node_name(),
            snap_dfn.resource_name(),
            snap_dfn.snapshot_name(),
            vlm_nr,
        ))?;
        let snap_vlm = checked(
            SnapshotVolume::restore(snapshot, &snap_vlm_dfn, &pool, uuid, obj_prot),
            table,
            &key,
        )?;
        self.restore_props(snap_vlm.core())?;
        self.summary.snapshot_volumes += 1;
        Ok(())
    }
}

impl fmt::Debug for DatabaseLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseLoader")
            .field("cache", &self.cache)
            .field("summary", &self.summary)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::test_support::Fixture;
    use crate::objects::{
        InstanceMode, NodeFlags, ResourceFlags, SnapshotDefinitionFlags, SnapshotFlags,
        SnapshotVolumeDefinitionFlags, VolumeFlags,
    };
    use crate::persistence::{Database, MemoryDatabase};
    use crate::security::AccessContext;
    use assert_matches::assert_matches;
    use serde_json::json;

    /// Fresh root maps over the stored state of `db`
    fn reopen(db: &Arc<MemoryDatabase>) -> DatabaseLoader {
        let drivers = DatabaseDrivers::generic(db.clone());
        let prot = |path: &str| DatabaseLoader::load_protection(&drivers, path).unwrap();
        let objects = CoreObjects::new(
            drivers.clone(),
            prot(paths::NODES_MAP),
            prot(paths::RESOURCE_DEFINITIONS_MAP),
            prot(paths::STOR_POOL_DEFINITIONS_MAP),
        );
        DatabaseLoader::new(objects)
    }

    /// Three nodes sharing one resource, fully meshed with resource and
    /// volume connections
    fn build_cluster(fx: &Fixture) {
        let tx = fx.tx();
        let rsc_dfn = fx.rsc_dfn(&tx, "r1", 7000);
        let vlm_dfn = fx.vlm_dfn(&tx, &rsc_dfn, 0, 1000);
        let mut volumes = Vec::new();
        for (idx, name) in ["n1", "n2", "n3"].iter().enumerate() {
            let node = fx.node(&tx, name);
            let pool = fx.stor_pool(&tx, &node, "pool1", DeviceProviderKind::Lvm);
            let rsc = fx.resource(&tx, &node, &rsc_dfn, idx as i64);
            let volume = Volume::get_instance(
                &fx.ctx,
                &tx,
                &rsc,
                &vlm_dfn,
                &pool,
                Some("/dev/drbd1000".into()),
                None,
                VolumeFlags::empty(),
                InstanceMode::Create,
            )
            .unwrap()
            .unwrap();
            volumes.push((node, rsc, volume));
        }
        for i in 0..volumes.len() {
            for j in (i + 1)..volumes.len() {
                NodeConnection::get_instance(&fx.ctx, &tx, &volumes[i].0, &volumes[j].0, InstanceMode::Create).unwrap();
                ResourceConnection::get_instance(&fx.ctx, &tx, &volumes[i].1, &volumes[j].1, InstanceMode::Create)
                    .unwrap();
                VolumeConnection::get_instance(&fx.ctx, &tx, &volumes[i].2, &volumes[j].2, InstanceMode::Create)
                    .unwrap();
            }
        }
        rsc_dfn.props(&fx.ctx).unwrap().set(&tx, "Aux/site", "east", None).unwrap();
        tx.commit().unwrap();
    }

    #[test]
    fn test_round_trip_preserves_identity() {
        let fx = Fixture::new();
        let tx = fx.tx();
        let node = fx.node(&tx, "alpha");
        node.flags()
            .unwrap()
            .enable_flags(&fx.ctx, &tx, NodeFlags::EVACUATE)
            .unwrap();
        let rsc_dfn = fx.rsc_dfn(&tx, "r1", 7001);
        let rsc = fx.resource(&tx, &node, &rsc_dfn, 4);
        rsc.flags()
            .unwrap()
            .enable_flags(&fx.ctx, &tx, ResourceFlags::DISKLESS)
            .unwrap();
        tx.commit().unwrap();

        let mut loader = reopen(&fx.db);
        let name = NodeName::new("alpha").unwrap();
        let loaded = loader.load_node(&name).unwrap().unwrap();
        assert!(!Arc::ptr_eq(&loaded, &node));
        assert_eq!(loaded.uuid().unwrap(), node.uuid().unwrap());
        assert_eq!(loaded.name().unwrap().display_name(), "alpha");
        assert_eq!(
            loaded.flags().unwrap().flags_bits(&fx.ctx).unwrap(),
            node.flags().unwrap().flags_bits(&fx.ctx).unwrap()
        );

        let loaded_rsc = loaded.resource(&fx.ctx, &ResourceName::new("r1").unwrap()).unwrap().unwrap();
        assert_eq!(loaded_rsc.uuid().unwrap(), rsc.uuid().unwrap());
        assert_eq!(loaded_rsc.node_id(&fx.ctx).unwrap().value(), 4);
        assert!(loaded_rsc.is_diskless(&fx.ctx).unwrap());
        assert_eq!(loaded_rsc.definition().unwrap().port(&fx.ctx).unwrap().value(), 7001);
    }

    #[test]
    fn test_cyclic_graph_loads_each_entity_once() {
        let fx = Fixture::new();
        build_cluster(&fx);

        let mut loader = reopen(&fx.db);
        let rsc_dfn = loader
            .load_resource_definition(&ResourceName::new("r1").unwrap())
            .unwrap()
            .unwrap();
        let summary = loader.summary();
        assert_eq!(summary.nodes, 3);
        assert_eq!(summary.resources, 3);
        assert_eq!(summary.volumes, 3);
        assert_eq!(summary.stor_pools, 3);
        assert_eq!(summary.stor_pool_definitions, 1);
        assert_eq!(summary.connections, 9);

        let ctx = AccessContext::system();
        for rsc in rsc_dfn.resources(&ctx).unwrap() {
            let node = rsc.node().unwrap();
            let via_node = node.resource(&ctx, &ResourceName::new("R1").unwrap()).unwrap().unwrap();
            assert!(Arc::ptr_eq(&via_node, &rsc));
            assert!(Arc::ptr_eq(&via_node.definition().unwrap(), &rsc_dfn));
            assert_eq!(rsc.resource_connections(&ctx).unwrap().len(), 2);
            assert_eq!(node.node_connections(&ctx).unwrap().len(), 2);

            let volume = rsc.volume(&ctx, VolumeNumber::new(0).unwrap()).unwrap().unwrap();
            assert_eq!(volume.volume_connections(&ctx).unwrap().len(), 2);
            let pool = volume.stor_pool(&ctx).unwrap();
            assert!(Arc::ptr_eq(&pool.node().unwrap(), &node));
        }
        for conn in rsc_dfn.resources(&ctx).unwrap()[0].resource_connections(&ctx).unwrap() {
            let source = conn.source_resource().unwrap();
            let target = conn.target_resource().unwrap();
            assert!(source.node().unwrap().name().unwrap() < target.node().unwrap().name().unwrap());
        }
        assert_eq!(
            rsc_dfn.props(&ctx).unwrap().get("Aux/site", None).unwrap(),
            Some("east".to_string())
        );

        // a second pass over everything finds the graph complete
        let before = loader.summary();
        loader.load_all().unwrap();
        assert_eq!(loader.summary(), before);
    }

    #[test]
    fn test_snapshots_round_trip() {
        let fx = Fixture::new();
        let tx = fx.tx();
        let node = fx.node(&tx, "n1");
        let pool = fx.stor_pool(&tx, &node, "pool1", DeviceProviderKind::ZfsThin);
        let rsc_dfn = fx.rsc_dfn(&tx, "r1", 7000);
        let snap_dfn = SnapshotDefinition::get_instance(
            &fx.ctx,
            &tx,
            &rsc_dfn,
            SnapshotName::new("snap1").unwrap(),
            SnapshotDefinitionFlags::SUCCESSFUL,
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
        SnapshotVolume::get_instance(&fx.ctx, &tx, &snapshot, &snap_vlm_dfn, &pool, InstanceMode::Create).unwrap();
        tx.commit().unwrap();

        let mut loader = reopen(&fx.db);
        let summary = loader.load_all().unwrap();
        assert_eq!(summary.snapshot_definitions, 1);
        assert_eq!(summary.snapshot_volume_definitions, 1);
        assert_eq!(summary.snapshots, 1);
        assert_eq!(summary.snapshot_volumes, 1);

        let ctx = AccessContext::system();
        let node = loader.load_node(&NodeName::new("n1").unwrap()).unwrap().unwrap();
        let pool = node.stor_pool(&ctx, &StorPoolName::new("pool1").unwrap()).unwrap().unwrap();
        assert_eq!(pool.snapshot_volumes(&ctx).unwrap().len(), 1);
        assert_eq!(node.snapshots(&ctx).unwrap().len(), 1);
    }

    #[test]
    fn test_corrupt_rows_are_reported() {
        let fx = Fixture::new();
        fx.db.write_raw(
            ResourceDefinitionRow::TABLE,
            "R9",
            json!({
                "uuid": Uuid::new_v4().to_string(),
                "resource_name": "r9",
                "tcp_port": 70000,
                "transport_type": "IP",
                "secret": "s",
                "flags": 0
            }),
        );
        let mut loader = reopen(&fx.db);
        assert_matches!(
            loader.load_resource_definition(&ResourceName::new("r9").unwrap()),
            Err(Error::CorruptPersistedState { table: "resource_definitions", .. })
        );

        let fx = Fixture::new();
        fx.db.write_raw(
            NodeRow::TABLE,
            "BAD NAME",
            json!({
                "uuid": Uuid::new_v4().to_string(),
                "node_name": "bad name",
                "node_type": 2,
                "flags": 0,
                "satellite_connection": null
            }),
        );
        let mut loader = reopen(&fx.db);
        let err = loader.load_all().unwrap_err();
        assert!(err.is_defect());
        assert_matches!(err, Error::CorruptPersistedState { table: "nodes", .. });
    }

    #[test]
    fn test_missing_parent_is_corrupt() {
        let fx = Fixture::new();
        let tx = fx.tx();
        fx.node(&tx, "n1");
        tx.commit().unwrap();
        fx.db.write_raw(
            ResourceRow::TABLE,
            "N1/GHOST",
            json!({
                "uuid": Uuid::new_v4().to_string(),
                "node_name": "n1",
                "resource_name": "ghost",
                "node_id": 0,
                "flags": 0
            }),
        );

        let mut loader = reopen(&fx.db);
        assert_matches!(
            loader.load_node(&NodeName::new("n1").unwrap()),
            Err(Error::CorruptPersistedState { table: "resources", .. })
        );
    }

    #[test]
    fn test_clear_cache_keeps_live_graph() {
        let fx = Fixture::new();
        build_cluster(&fx);

        let mut loader = reopen(&fx.db);
        loader.load_all().unwrap();
        assert!(!loader.cache().is_empty());
        let n1 = NodeName::new("n1").unwrap();
        let node = loader.load_node(&n1).unwrap().unwrap();

        loader.clear_cache();
        assert!(loader.cache().is_empty());
        let again = loader.load_node(&n1).unwrap().unwrap();
        assert!(Arc::ptr_eq(&node, &again));
        assert_eq!(loader.summary().nodes, 3);
    }

    #[test]
    fn test_unknown_keys_load_nothing() {
        let fx = Fixture::new();
        let mut loader = reopen(&fx.db);
        assert!(loader.load_node(&NodeName::new("nobody").unwrap()).unwrap().is_none());
        assert!(loader
            .load_resource(&NodeName::new("nobody").unwrap(), &ResourceName::new("r1").unwrap())
            .unwrap()
            .is_none());
        assert_eq!(fx.db.row_count(NodeRow::TABLE), 0);
        assert!(fx.db.select_all(NodeRow::TABLE).unwrap().is_empty());
    }
}
