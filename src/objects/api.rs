//! API data snapshots
//!
//! Flattened plain-data copies of entities, produced by the access-checked
//! `api_data` methods. They own no references into the graph and are what
//! gets serialized for remote agents and API clients.

use crate::domain::{DeviceProviderKind, NetInterfaceType, NodeType, TransportType};
use serde::Serialize;
use std::collections::BTreeMap;
use uuid::Uuid;

pub type PropsMap = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeApi {
    pub uuid: Uuid,
    pub name: String,
    pub node_type: NodeType,
    pub flags: u64,
    pub props: PropsMap,
    pub net_interfaces: Vec<NetInterfaceApi>,
    pub satellite_connection: Option<String>,
    /// Names of the storage pools on this node
    pub stor_pools: Vec<String>,
    /// Names of the resources deployed on this node
    pub resources: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetInterfaceApi {
    pub uuid: Uuid,
    pub name: String,
    pub address: String,
    pub port: Option<u16>,
    pub net_if_type: NetInterfaceType,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorPoolDefinitionApi {
    pub uuid: Uuid,
    pub name: String,
    pub props: PropsMap,
    /// Nodes providing a pool of this definition
    pub nodes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorPoolApi {
    pub uuid: Uuid,
    pub node_name: String,
    pub pool_name: String,
    pub definition_uuid: Uuid,
    pub provider_kind: DeviceProviderKind,
    pub free_space_kib: Option<u64>,
    pub props: PropsMap,
    pub volume_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDefinitionApi {
    pub uuid: Uuid,
    pub name: String,
    pub port: u16,
    pub transport_type: TransportType,
    pub secret: String,
    pub flags: u64,
    pub props: PropsMap,
    pub volume_definitions: Vec<VolumeDefinitionApi>,
    /// Nodes the resource is deployed on
    pub nodes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeDefinitionApi {
    pub uuid: Uuid,
    pub volume_number: u16,
    pub minor_number: u32,
    pub size_kib: u64,
    pub flags: u64,
    pub props: PropsMap,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceApi {
    pub uuid: Uuid,
    pub node_name: String,
    pub resource_name: String,
    pub definition_uuid: Uuid,
    pub node_id: u8,
    pub flags: u64,
    pub props: PropsMap,
    pub volumes: Vec<VolumeApi>,
    /// Peers this resource holds an explicit connection to
    pub connections: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeApi {
    pub uuid: Uuid,
    pub volume_number: u16,
    pub stor_pool_name: String,
    pub block_device_path: Option<String>,
    pub meta_disk_path: Option<String>,
    pub flags: u64,
    pub props: PropsMap,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeConnectionApi {
    pub uuid: Uuid,
    pub source_node: String,
    pub target_node: String,
    pub props: PropsMap,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceConnectionApi {
    pub uuid: Uuid,
    pub source_node: String,
    pub target_node: String,
    pub resource_name: String,
    pub props: PropsMap,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeConnectionApi {
    pub uuid: Uuid,
    pub source_node: String,
    pub target_node: String,
    pub resource_name: String,
    pub volume_number: u16,
    pub props: PropsMap,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotDefinitionApi {
    pub uuid: Uuid,
    pub resource_name: String,
    pub snapshot_name: String,
    pub flags: u64,
    pub props: PropsMap,
    pub snapshot_volume_definitions: Vec<SnapshotVolumeDefinitionApi>,
    /// Nodes holding a snapshot of this definition
    pub nodes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotVolumeDefinitionApi {
    pub uuid: Uuid,
    pub volume_number: u16,
    pub size_kib: u64,
    pub flags: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotApi {
    pub uuid: Uuid,
    pub node_name: String,
    pub resource_name: String,
    pub snapshot_name: String,
    pub node_id: u8,
    pub flags: u64,
    pub suspend_resource: bool,
    pub take_snapshot: bool,
    pub snapshot_volumes: Vec<SnapshotVolumeApi>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotVolumeApi {
    pub uuid: Uuid,
    pub volume_number: u16,
    pub stor_pool_name: String,
}

/// Snapshot of the whole graph, as seen by one access context
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TopologyApi {
    pub nodes: Vec<NodeApi>,
    pub stor_pool_definitions: Vec<StorPoolDefinitionApi>,
    pub resource_definitions: Vec<ResourceDefinitionApi>,
}
