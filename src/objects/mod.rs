//! Entity graph - Nodes, resources, volumes, storage pools and snapshots
//!
//! Entities reference each other cyclically. Collections own their members
//! through `Arc`, single-valued references to parents or related objects
//! are `Weak`, so the graph never forms a strong cycle. Top-level entities
//! are reachable from the root maps of [`CoreObjects`].
//!
//! ```text
//! CoreObjects ─┬─ nodes ──────────── Node ─┬─ net interfaces
//!              │                           ├─ storage pools ─── volumes (reverse index)
//!              │                           ├─ resources ─────── volumes ── volume connections
//!              │                           ├─ node connections
//!              │                           └─ snapshots ─────── snapshot volumes
//!              ├─ resource definitions ─── ResourceDefinition ─┬─ volume definitions
//!              │                                               ├─ resources (by node)
//!              │                                               └─ snapshot definitions
//!              └─ storage pool definitions ─ StorPoolDefinition ── storage pools (by node)
//! ```

pub mod api;
pub(crate) mod common;
pub mod net_interface;
pub mod node;
pub mod node_connection;
pub mod resource;
pub mod resource_connection;
pub mod resource_definition;
pub mod snapshot;
pub mod snapshot_definition;
pub mod snapshot_volume;
pub mod snapshot_volume_definition;
pub mod stor_pool;
pub mod stor_pool_definition;
pub mod volume;
pub mod volume_connection;
pub mod volume_definition;

pub use common::{canonical_pair, InstanceMode};
pub use net_interface::NetInterface;
pub use node::{Node, NodeFlags};
pub use node_connection::NodeConnection;
pub use resource::{Resource, ResourceFlags};
pub use resource_connection::ResourceConnection;
pub use resource_definition::{ResourceDefinition, ResourceDefinitionFlags};
pub use snapshot::{Snapshot, SnapshotFlags};
pub use snapshot_definition::{SnapshotDefinition, SnapshotDefinitionFlags};
pub use snapshot_volume::SnapshotVolume;
pub use snapshot_volume_definition::{SnapshotVolumeDefinition, SnapshotVolumeDefinitionFlags};
pub use stor_pool::StorPool;
pub use stor_pool_definition::StorPoolDefinition;
pub use volume::{Volume, VolumeFlags};
pub use volume_connection::VolumeConnection;
pub use volume_definition::{VolumeDefinition, VolumeDefinitionFlags};

use crate::domain::{MinorNumber, NodeName, ResourceName, StorPoolName, TcpPortNumber, VolumeNumber};
use crate::error::{Error, Result};
use crate::persistence::DatabaseDrivers;
use crate::security::{AccessContext, AccessType, ObjectProtection};
use crate::transaction::TransactionMap;
use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use std::sync::Arc;

/// Root maps of the entity graph plus the drivers every factory needs
pub struct CoreObjects {
    pub(crate) drivers: Arc<DatabaseDrivers>,
    pub(crate) nodes: TransactionMap<NodeName, Arc<Node>>,
    pub(crate) resource_definitions: TransactionMap<ResourceName, Arc<ResourceDefinition>>,
    pub(crate) stor_pool_definitions: TransactionMap<StorPoolName, Arc<StorPoolDefinition>>,
    nodes_prot: Arc<ObjectProtection>,
    resource_definitions_prot: Arc<ObjectProtection>,
    stor_pool_definitions_prot: Arc<ObjectProtection>,
    structure: ReentrantMutex<()>,
}

impl CoreObjects {
    pub fn new(
        drivers: Arc<DatabaseDrivers>,
        nodes_prot: Arc<ObjectProtection>,
        resource_definitions_prot: Arc<ObjectProtection>,
        stor_pool_definitions_prot: Arc<ObjectProtection>,
    ) -> Arc<Self> {
        Arc::new(Self {
            drivers,
            nodes: TransactionMap::new(None),
            resource_definitions: TransactionMap::new(None),
            stor_pool_definitions: TransactionMap::new(None),
            nodes_prot,
            resource_definitions_prot,
            stor_pool_definitions_prot,
            structure: ReentrantMutex::new(()),
        })
    }

    pub fn drivers(&self) -> &Arc<DatabaseDrivers> {
        &self.drivers
    }

    pub fn nodes_prot(&self) -> &Arc<ObjectProtection> {
        &self.nodes_prot
    }

    pub fn resource_definitions_prot(&self) -> &Arc<ObjectProtection> {
        &self.resource_definitions_prot
    }

    pub fn stor_pool_definitions_prot(&self) -> &Arc<ObjectProtection> {
        &self.stor_pool_definitions_prot
    }

    pub fn node(&self, ctx: &AccessContext, name: &NodeName) -> Result<Option<Arc<Node>>> {
        self.nodes_prot.require_access(ctx, AccessType::View)?;
        Ok(self.nodes.get(name))
    }

    pub fn nodes(&self, ctx: &AccessContext) -> Result<Vec<Arc<Node>>> {
        self.nodes_prot.require_access(ctx, AccessType::View)?;
        Ok(self.nodes.values())
    }

    pub fn resource_definition(&self, ctx: &AccessContext, name: &ResourceName) -> Result<Option<Arc<ResourceDefinition>>> {
        self.resource_definitions_prot.require_access(ctx, AccessType::View)?;
        Ok(self.resource_definitions.get(name))
    }

    pub fn resource_definitions(&self, ctx: &AccessContext) -> Result<Vec<Arc<ResourceDefinition>>> {
        self.resource_definitions_prot.require_access(ctx, AccessType::View)?;
        Ok(self.resource_definitions.values())
    }

    pub fn stor_pool_definition(&self, ctx: &AccessContext, name: &StorPoolName) -> Result<Option<Arc<StorPoolDefinition>>> {
        self.stor_pool_definitions_prot.require_access(ctx, AccessType::View)?;
        Ok(self.stor_pool_definitions.get(name))
    }

    pub fn stor_pool_definitions(&self, ctx: &AccessContext) -> Result<Vec<Arc<StorPoolDefinition>>> {
        self.stor_pool_definitions_prot.require_access(ctx, AccessType::View)?;
        Ok(self.stor_pool_definitions.values())
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn resource_definition_count(&self) -> usize {
        self.resource_definitions.len()
    }

    pub fn stor_pool_definition_count(&self) -> usize {
        self.stor_pool_definitions.len()
    }

    /// Serializes lookup and insert of top-level entities
    pub(crate) fn lock(&self) -> ReentrantMutexGuard<'_, ()> {
        self.structure.lock()
    }

    /// Fails when a resource definition other than `owner` uses `port`.
    /// Callers hold [`lock`](Self::lock) until the port is stored.
    pub(crate) fn check_port_unused(&self, port: TcpPortNumber, owner: &ResourceName) -> Result<()> {
        let taken = self
            .resource_definitions
            .values()
            .iter()
            .any(|rsc_dfn| rsc_dfn.resource_name() != owner && rsc_dfn.raw_port() == port);
        if taken {
            return Err(Error::DataAlreadyExists {
                kind: "TCP port",
                key: port.to_string(),
            });
        }
        Ok(())
    }

    /// Fails when a volume definition other than `owner`/`owner_vlm_nr`
    /// uses `minor`.
    /// Callers hold [`lock`](Self::lock) until the minor number is stored.
    pub(crate) fn check_minor_unused(
        &self,
        minor: MinorNumber,
        owner: &ResourceName,
        owner_vlm_nr: VolumeNumber,
    ) -> Result<()> {
        let taken = self.resource_definitions.values().iter().any(|rsc_dfn| {
            rsc_dfn.volume_definitions.values().iter().any(|vlm_dfn| {
                vlm_dfn.raw_minor() == minor
                    && !(rsc_dfn.resource_name() == owner && vlm_dfn.raw_volume_number() == owner_vlm_nr)
            })
        });
        if taken {
            return Err(Error::DataAlreadyExists {
                kind: "minor number",
                key: minor.to_string(),
            });
        }
        Ok(())
    }
}

impl std::fmt::Debug for CoreObjects {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreObjects")
            .field("nodes", &self.nodes.len())
            .field("resource_definitions", &self.resource_definitions.len())
            .field("stor_pool_definitions", &self.stor_pool_definitions.len())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Fixtures shared by the entity tests

    use super::*;
    use crate::domain::{DeviceProviderKind, DrbdNodeId, NodeType, TcpPortNumber, TransportType, VolumeNumber};
    use crate::persistence::MemoryDatabase;
    use crate::security::{Identity, Privilege, Role, SecurityType};
    use crate::transaction::TransactionMgr;

    pub struct Fixture {
        pub db: Arc<MemoryDatabase>,
        pub objects: Arc<CoreObjects>,
        pub ctx: AccessContext,
    }

    impl Fixture {
        pub fn new() -> Self {
            let db = MemoryDatabase::in_memory();
            let drivers = DatabaseDrivers::generic(db.clone());
            let sys = AccessContext::system();
            let tx = TransactionMgr::new(db.clone());
            let prot = |path: &str| ObjectProtection::create(&sys, &tx, path, &drivers).unwrap();
            let objects = CoreObjects::new(
                drivers.clone(),
                prot(crate::security::paths::NODES_MAP),
                prot(crate::security::paths::RESOURCE_DEFINITIONS_MAP),
                prot(crate::security::paths::STOR_POOL_DEFINITIONS_MAP),
            );
            tx.commit().unwrap();
            db.clear_journal();

            let ctx = AccessContext::new(
                Identity::new("admin").unwrap(),
                Role::new("admin").unwrap(),
                SecurityType::public(),
                Privilege::OBJ_VIEW | Privilege::OBJ_USE | Privilege::OBJ_CHANGE | Privilege::OBJ_CONTROL,
            );
            Self { db, objects, ctx }
        }

        pub fn tx(&self) -> TransactionMgr {
            TransactionMgr::new(self.db.clone())
        }

        pub fn node(&self, tx: &TransactionMgr, name: &str) -> Arc<Node> {
            Node::get_instance(
                &self.ctx,
                tx,
                &self.objects,
                NodeName::new(name).unwrap(),
                NodeType::Satellite,
                NodeFlags::empty(),
                InstanceMode::Create,
            )
            .unwrap()
            .unwrap()
        }

        pub fn rsc_dfn(&self, tx: &TransactionMgr, name: &str, port: i64) -> Arc<ResourceDefinition> {
            ResourceDefinition::get_instance(
                &self.ctx,
                tx,
                &self.objects,
                ResourceName::new(name).unwrap(),
                TcpPortNumber::new(port).unwrap(),
                "secret".into(),
                TransportType::Ip,
                ResourceDefinitionFlags::empty(),
                InstanceMode::Create,
            )
            .unwrap()
            .unwrap()
        }

        pub fn resource(&self, tx: &TransactionMgr, node: &Arc<Node>, rsc_dfn: &Arc<ResourceDefinition>, node_id: i64) -> Arc<Resource> {
            Resource::get_instance(
                &self.ctx,
                tx,
                node,
                rsc_dfn,
                DrbdNodeId::new(node_id).unwrap(),
                ResourceFlags::empty(),
                InstanceMode::Create,
            )
            .unwrap()
            .unwrap()
        }

        pub fn vlm_dfn(&self, tx: &TransactionMgr, rsc_dfn: &Arc<ResourceDefinition>, vlm_nr: i64, minor: i64) -> Arc<VolumeDefinition> {
            VolumeDefinition::get_instance(
                &self.ctx,
                tx,
                rsc_dfn,
                VolumeNumber::new(vlm_nr).unwrap(),
                crate::domain::MinorNumber::new(minor).unwrap(),
                1024 * 1024,
                VolumeDefinitionFlags::empty(),
                InstanceMode::Create,
            )
            .unwrap()
            .unwrap()
        }

        pub fn stor_pool(&self, tx: &TransactionMgr, node: &Arc<Node>, pool: &str, kind: DeviceProviderKind) -> Arc<StorPool> {
            let name = StorPoolName::new(pool).unwrap();
            let definition = StorPoolDefinition::get_instance(
                &self.ctx,
                tx,
                &self.objects,
                name,
                InstanceMode::LoadOrCreate,
            )
            .unwrap()
            .unwrap();
            StorPool::get_instance(&self.ctx, tx, node, &definition, kind, InstanceMode::Create)
                .unwrap()
                .unwrap()
        }
    }
}
