//! Stored Rows
//!
//! Rows hold raw primitives exactly as the backing store returns them.
//! Names are kept in their display spelling, numbers are wide signed
//! integers, and enumerations are strings; the loader converts them into
//! checked domain values and reports anything invalid as corrupt state.

use super::PersistedRow;
use serde::{Deserialize, Serialize};

/// Column names used by single-column updates
pub mod columns {
    pub const FLAGS: &str = "flags";
    pub const NODE_TYPE: &str = "node_type";
    pub const SATELLITE_CONNECTION: &str = "satellite_connection";
    pub const ADDRESS: &str = "address";
    pub const PORT: &str = "port";
    pub const NET_IF_TYPE: &str = "net_if_type";
    pub const TCP_PORT: &str = "tcp_port";
    pub const TRANSPORT_TYPE: &str = "transport_type";
    pub const SECRET: &str = "secret";
    pub const MINOR_NUMBER: &str = "minor_number";
    pub const SIZE_KIB: &str = "size_kib";
    pub const BLOCK_DEVICE_PATH: &str = "block_device_path";
    pub const META_DISK_PATH: &str = "meta_disk_path";
    pub const CREATOR_IDENTITY: &str = "creator_identity";
    pub const OWNER_ROLE: &str = "owner_role";
    pub const SECURITY_TYPE: &str = "security_type";
}

/// Builds a primary key from natural key parts, compared case-insensitively
pub fn db_key(parts: &[&str]) -> String {
    parts
        .iter()
        .map(|part| part.to_uppercase())
        .collect::<Vec<_>>()
        .join("/")
}

macro_rules! persisted_row {
    ($row:ident, $table:literal, |$this:ident| $key:expr) => {
        impl PersistedRow for $row {
            const TABLE: &'static str = $table;

            fn primary_key(&self) -> String {
                let $this = self;
                $key
            }
        }
    };
}

// =============================================================================
// Security and Properties
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectProtectionRow {
    pub object_path: String,
    pub creator_identity: String,
    pub owner_role: String,
    pub security_type: String,
}

persisted_row!(ObjectProtectionRow, "sec_object_protection", |row| row.object_path.clone());

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclRow {
    pub object_path: String,
    pub role: String,
    pub access: i64,
}

impl AclRow {
    pub fn key_of(object_path: &str, role: &str) -> String {
        format!("{}:{}", object_path, role.to_uppercase())
    }
}

persisted_row!(AclRow, "sec_acl_map", |row| AclRow::key_of(&row.object_path, &row.role));

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropsRow {
    pub instance: String,
    pub key: String,
    pub value: String,
}

impl PropsRow {
    pub fn key_of(instance: &str, key: &str) -> String {
        format!("{}:{}", instance, key)
    }
}

persisted_row!(PropsRow, "props_containers", |row| PropsRow::key_of(&row.instance, &row.key));

// =============================================================================
// Nodes
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRow {
    pub uuid: String,
    pub node_name: String,
    pub node_type: i64,
    pub flags: u64,
    pub satellite_connection: Option<String>,
}

persisted_row!(NodeRow, "nodes", |row| db_key(&[&row.node_name]));

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetInterfaceRow {
    pub uuid: String,
    pub node_name: String,
    pub net_if_name: String,
    pub address: String,
    pub port: Option<i64>,
    pub net_if_type: String,
}

persisted_row!(NetInterfaceRow, "node_net_interfaces", |row| db_key(&[
    &row.node_name,
    &row.net_if_name
]));

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConnectionRow {
    pub uuid: String,
    pub source_node: String,
    pub target_node: String,
}

persisted_row!(NodeConnectionRow, "node_connections", |row| db_key(&[
    &row.source_node,
    &row.target_node
]));

// =============================================================================
// Storage Pools
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorPoolDefinitionRow {
    pub uuid: String,
    pub pool_name: String,
}

persisted_row!(StorPoolDefinitionRow, "stor_pool_definitions", |row| db_key(&[&row.pool_name]));

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorPoolRow {
    pub uuid: String,
    pub node_name: String,
    pub pool_name: String,
    pub provider_kind: String,
}

persisted_row!(StorPoolRow, "node_stor_pool", |row| db_key(&[&row.node_name, &row.pool_name]));

// =============================================================================
// Resources and Volumes
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDefinitionRow {
    pub uuid: String,
    pub resource_name: String,
    pub tcp_port: i64,
    pub transport_type: String,
    pub secret: String,
    pub flags: u64,
}

persisted_row!(ResourceDefinitionRow, "resource_definitions", |row| db_key(&[&row.resource_name]));

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRow {
    pub uuid: String,
    pub node_name: String,
    pub resource_name: String,
    pub node_id: i64,
    pub flags: u64,
}

persisted_row!(ResourceRow, "resources", |row| db_key(&[&row.node_name, &row.resource_name]));

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceConnectionRow {
    pub uuid: String,
    pub source_node: String,
    pub target_node: String,
    pub resource_name: String,
}

persisted_row!(ResourceConnectionRow, "resource_connections", |row| db_key(&[
    &row.source_node,
    &row.target_node,
    &row.resource_name
]));

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeDefinitionRow {
    pub uuid: String,
    pub resource_name: String,
    pub volume_number: i64,
    pub minor_number: i64,
    pub size_kib: i64,
    pub flags: u64,
}

persisted_row!(VolumeDefinitionRow, "volume_definitions", |row| db_key(&[
    &row.resource_name,
    &row.volume_number.to_string()
]));

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeRow {
    pub uuid: String,
    pub node_name: String,
    pub resource_name: String,
    pub volume_number: i64,
    pub stor_pool_name: String,
    pub block_device_path: Option<String>,
    pub meta_disk_path: Option<String>,
    pub flags: u64,
}

persisted_row!(VolumeRow, "volumes", |row| db_key(&[
    &row.node_name,
    &row.resource_name,
    &row.volume_number.to_string()
]));

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeConnectionRow {
    pub uuid: String,
    pub source_node: String,
    pub target_node: String,
    pub resource_name: String,
    pub volume_number: i64,
}

persisted_row!(VolumeConnectionRow, "volume_connections", |row| db_key(&[
    &row.source_node,
    &row.target_node,
    &row.resource_name,
    &row.volume_number.to_string()
]));

// =============================================================================
// Snapshots
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotDefinitionRow {
    pub uuid: String,
    pub resource_name: String,
    pub snapshot_name: String,
    pub flags: u64,
}

persisted_row!(SnapshotDefinitionRow, "snapshot_definitions", |row| db_key(&[
    &row.resource_name,
    &row.snapshot_name
]));

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotVolumeDefinitionRow {
    pub uuid: String,
    pub resource_name: String,
    pub snapshot_name: String,
    pub volume_number: i64,
    pub size_kib: i64,
    pub flags: u64,
}

persisted_row!(SnapshotVolumeDefinitionRow, "snapshot_volume_definitions", |row| db_key(&[
    &row.resource_name,
    &row.snapshot_name,
    &row.volume_number.to_string()
]));

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRow {
    pub uuid: String,
    pub node_name: String,
    pub resource_name: String,
    pub snapshot_name: String,
    pub node_id: i64,
    pub flags: u64,
}

persisted_row!(SnapshotRow, "snapshots", |row| db_key(&[
    &row.node_name,
    &row.resource_name,
    &row.snapshot_name
]));

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotVolumeRow {
    pub uuid: String,
    pub node_name: String,
    pub resource_name: String,
    pub snapshot_name: String,
    pub volume_number: i64,
    pub stor_pool_name: String,
}

persisted_row!(SnapshotVolumeRow, "snapshot_volumes", |row| db_key(&[
    &row.node_name,
    &row.resource_name,
    &row.snapshot_name,
    &row.volume_number.to_string()
]));

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_are_case_insensitive() {
        let row = ResourceRow {
            uuid: "u".into(),
            node_name: "alpha".into(),
            resource_name: "Data1".into(),
            node_id: 0,
            flags: 0,
        };
        assert_eq!(row.primary_key(), "ALPHA/DATA1");
        assert_eq!(row.primary_key(), db_key(&["ALPHA", "data1"]));
    }

    #[test]
    fn test_rows_round_trip_through_json() {
        let row = NetInterfaceRow {
            uuid: "u".into(),
            node_name: "n1".into(),
            net_if_name: "eth0".into(),
            address: "10.0.0.1".into(),
            port: Some(3366),
            net_if_type: "IP".into(),
        };
        let value = serde_json::to_value(&row).unwrap();
        assert_eq!(value["port"], serde_json::json!(3366));
        let back: NetInterfaceRow = serde_json::from_value(value).unwrap();
        assert_eq!(back, row);
        assert_eq!(NetInterfaceRow::TABLE, "node_net_interfaces");
    }
}
