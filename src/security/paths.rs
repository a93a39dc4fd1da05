//! Object paths of protected objects
//!
//! Every protection object is stored under a path derived from the natural
//! key of the object it guards. Paths use the upper-case name values so that
//! differently spelled names resolve to the same protection object.

use crate::domain::{NetInterfaceName, NodeName, ResourceName, SnapshotName, StorPoolName, VolumeNumber};

pub const NODES_MAP: &str = "/sys/controller/nodesMap";
pub const RESOURCE_DEFINITIONS_MAP: &str = "/sys/controller/rscDfnMap";
pub const STOR_POOL_DEFINITIONS_MAP: &str = "/sys/controller/storPoolMap";

pub fn node(node: &NodeName) -> String {
    format!("/nodes/{}", node.value())
}

pub fn resource_definition(rsc: &ResourceName) -> String {
    format!("/resourcedefinitions/{}", rsc.value())
}

pub fn resource(node: &NodeName, rsc: &ResourceName) -> String {
    format!("/resources/{}/{}", node.value(), rsc.value())
}

pub fn stor_pool_definition(pool: &StorPoolName) -> String {
    format!("/storpooldefinitions/{}", pool.value())
}

pub fn stor_pool(node: &NodeName, pool: &StorPoolName) -> String {
    format!("/storpools/{}/{}", node.value(), pool.value())
}

pub fn net_interface(node: &NodeName, net_if: &NetInterfaceName) -> String {
    format!("/netinterfaces/{}/{}", node.value(), net_if.value())
}

pub fn volume_definition(rsc: &ResourceName, vlm_nr: VolumeNumber) -> String {
    format!("/volumedefinitions/{}/{}", rsc.value(), vlm_nr)
}

pub fn volume(node: &NodeName, rsc: &ResourceName, vlm_nr: VolumeNumber) -> String {
    format!("/volumes/{}/{}/{}", node.value(), rsc.value(), vlm_nr)
}

pub fn node_connection(source: &NodeName, target: &NodeName) -> String {
    format!("/conn/nodes/{}/{}", source.value(), target.value())
}

pub fn resource_connection(source: &NodeName, target: &NodeName, rsc: &ResourceName) -> String {
    format!(
        "/conn/resources/{}/{}/{}",
        source.value(),
        target.value(),
        rsc.value()
    )
}

pub fn volume_connection(
    source: &NodeName,
    target: &NodeName,
    rsc: &ResourceName,
    vlm_nr: VolumeNumber,
) -> String {
    format!(
        "/conn/volumes/{}/{}/{}/{}",
        source.value(),
        target.value(),
        rsc.value(),
        vlm_nr
    )
}

pub fn snapshot_definition(rsc: &ResourceName, snapshot: &SnapshotName) -> String {
    format!("/snapshotdefinitions/{}/{}", rsc.value(), snapshot.value())
}

pub fn snapshot(node: &NodeName, rsc: &ResourceName, snapshot: &SnapshotName) -> String {
    format!(
        "/snapshots/{}/{}/{}",
        node.value(),
        rsc.value(),
        snapshot.value()
    )
}

pub fn snapshot_volume_definition(rsc: &ResourceName, snapshot: &SnapshotName, vlm_nr: VolumeNumber) -> String {
    format!(
        "/snapshotvolumedefinitions/{}/{}/{}",
        rsc.value(),
        snapshot.value(),
        vlm_nr
    )
}

pub fn snapshot_volume(
    node: &NodeName,
    rsc: &ResourceName,
    snapshot: &SnapshotName,
    vlm_nr: VolumeNumber,
) -> String {
    format!(
        "/snapshotvolumes/{}/{}/{}/{}",
        node.value(),
        rsc.value(),
        snapshot.value(),
        vlm_nr
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_use_upper_case_values() {
        let node_a = NodeName::new("alpha").unwrap();
        let node_b = NodeName::new("beta").unwrap();
        let rsc = ResourceName::new("data1").unwrap();
        let vlm_nr = VolumeNumber::new(0).unwrap();

        assert_eq!(resource(&node_a, &rsc), "/resources/ALPHA/DATA1");
        assert_eq!(
            volume_connection(&node_a, &node_b, &rsc, vlm_nr),
            "/conn/volumes/ALPHA/BETA/DATA1/0"
        );
        assert_eq!(node(&NodeName::new("Alpha").unwrap()), node(&node_a));
    }
}
