//! Resource
//!
//! Deployment of a resource definition on one node. Owns one volume per
//! volume definition it has been adjusted to, and the explicit connections
//! to its peers on other nodes.

use super::api::ResourceApi;
use super::common::{entity_accessors, upgrade, EntityCore, InstanceMode};
use super::{Node, ResourceConnection, ResourceDefinition, Volume, VolumeFlags};
use crate::domain::{DrbdNodeId, NodeName, ResourceName, StorPoolName, VolumeNumber};
use crate::error::{Error, Result};
use crate::persistence::{columns, db_key, ColumnDriver, ExistenceDriver, ResourceRow};
use crate::props::keys;
use crate::security::{paths, AccessContext, AccessType, ObjectProtection};
use crate::stateflags::StateFlags;
use crate::transaction::{TransactionMap, TransactionMgr};
use bitflags::bitflags;
use std::sync::{Arc, Weak};
use tracing::debug;
use uuid::Uuid;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ResourceFlags: u64 {
        const CLEAN = 1;
        const DELETE = 2;
        const DISKLESS = 4;
        const DISK_ADD_REQUESTED = 8;
        const DISK_ADDING = 16;
        const DISK_REMOVE_REQUESTED = 32;
        const DISK_REMOVING = 64;
        const TIE_BREAKER = Self::DISKLESS.bits() | 128;
    }
}

const KIND: &str = "resource";

pub struct Resource {
    core: EntityCore,
    node: Weak<Node>,
    definition: Weak<ResourceDefinition>,
    node_name: NodeName,
    resource_name: ResourceName,
    node_id: DrbdNodeId,
    flags: StateFlags<ResourceFlags>,
    pub(crate) volumes: TransactionMap<VolumeNumber, Arc<Volume>>,
    pub(crate) resource_connections: TransactionMap<NodeName, Arc<ResourceConnection>>,
}

entity_accessors!(Resource);

impl Resource {
    fn build(
        node: &Arc<Node>,
        definition: &Arc<ResourceDefinition>,
        uuid: Uuid,
        node_id: DrbdNodeId,
        flags: ResourceFlags,
        obj_prot: Arc<ObjectProtection>,
        persisted: bool,
    ) -> Arc<Self> {
        let drivers = node.core().drivers().clone();
        let node_name = node.node_name().clone();
        let resource_name = definition.resource_name().clone();
        let key = db_key(&[node_name.value(), resource_name.value()]);
        let table = drivers.resources.clone();
        Arc::new_cyclic(|weak| {
            let core = EntityCore::new(
                KIND,
                format!("{}/{}", node_name, resource_name),
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
                definition: Arc::downgrade(definition),
                flags: StateFlags::new(obj_prot, flags, Some(ColumnDriver::new(table, key, columns::FLAGS)))
                    .with_scope_lock(scope_lock),
                node_name,
                resource_name,
                node_id,
                volumes: TransactionMap::new(None),
                resource_connections: TransactionMap::new(None),
            }
        })
    }

    /// Looks up or deploys `definition` on `node`. Creation requires USE on
    /// both, and `node_id` must be unused within the definition.
    pub fn get_instance(
        ctx: &AccessContext,
        tx: &TransactionMgr,
        node: &Arc<Node>,
        definition: &Arc<ResourceDefinition>,
        node_id: DrbdNodeId,
        flags: ResourceFlags,
        mode: InstanceMode,
    ) -> Result<Option<Arc<Self>>> {
        node.core().require_in(ctx, tx, AccessType::View)?;
        definition.core().require_in(ctx, tx, AccessType::View)?;
        let _node_guard = node.core().lock();
        let _dfn_guard = definition.core().lock();
        let existing = node.resources.get(definition.resource_name());
        mode.resolve_in(
            tx,
            existing,
            KIND,
            || format!("{}/{}", node.node_name(), definition.resource_name()),
            || {
                node.core().require_in(ctx, tx, AccessType::Use)?;
                definition.core().require_in(ctx, tx, AccessType::Use)?;
                if definition
                    .resources
                    .values()
                    .iter()
                    .any(|rsc| rsc.node_id == node_id)
                {
                    return Err(Error::DataAlreadyExists {
                        kind: "DRBD node id",
                        key: format!("{}/{}", definition.resource_name(), node_id),
                    });
                }

                let obj_prot = ObjectProtection::create(
                    ctx,
                    tx,
                    paths::resource(node.node_name(), definition.resource_name()),
                    node.core().drivers(),
                )?;
                let rsc = Self::build(node, definition, Uuid::new_v4(), node_id, flags, obj_prot, false);
                rsc.core.persist(tx)?;
                node.resources
                    .insert(tx, definition.resource_name().clone(), rsc.clone())?;
                definition
                    .resources
                    .insert(tx, node.node_name().clone(), rsc.clone())?;
                debug!(
                    "Created resource {}/{} with node id {}",
                    node.node_name(),
                    definition.resource_name(),
                    node_id
                );
                Ok(rsc)
            },
        )
    }

    pub(crate) fn restore(
        node: &Arc<Node>,
        definition: &Arc<ResourceDefinition>,
        uuid: Uuid,
        node_id: DrbdNodeId,
        flags: ResourceFlags,
        obj_prot: Arc<ObjectProtection>,
    ) -> Arc<Self> {
        let rsc = Self::build(node, definition, uuid, node_id, flags, obj_prot, true);
        node.resources.restore(definition.resource_name().clone(), rsc.clone());
        definition.resources.restore(node.node_name().clone(), rsc.clone());
        rsc
    }

    fn row(&self) -> ResourceRow {
        ResourceRow {
            uuid: self.core.raw_uuid().to_string(),
            node_name: self.node_name.display_name().to_string(),
            resource_name: self.resource_name.display_name().to_string(),
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

    pub(crate) fn raw_node_id(&self) -> DrbdNodeId {
        self.node_id
    }

    pub(crate) fn raw_flags(&self) -> ResourceFlags {
        self.flags.raw_flags()
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn node(&self) -> Result<Arc<Node>> {
        self.core.check_deleted()?;
        upgrade(&self.node, "node", self.core.key())
    }

    pub fn definition(&self) -> Result<Arc<ResourceDefinition>> {
        self.core.check_deleted()?;
        upgrade(&self.definition, "resource definition", self.core.key())
    }

    pub fn node_id(&self, ctx: &AccessContext) -> Result<DrbdNodeId> {
        self.core.require(ctx, AccessType::View)?;
        Ok(self.node_id)
    }

    pub fn flags(&self) -> Result<&StateFlags<ResourceFlags>> {
        self.core.check_deleted()?;
        Ok(&self.flags)
    }

    pub fn is_diskless(&self, ctx: &AccessContext) -> Result<bool> {
        self.core.check_deleted()?;
        self.flags.is_set(ctx, ResourceFlags::DISKLESS)
    }

    pub fn volume(&self, ctx: &AccessContext, vlm_nr: VolumeNumber) -> Result<Option<Arc<Volume>>> {
        self.core.require(ctx, AccessType::View)?;
        Ok(self.volumes.get(&vlm_nr))
    }

    pub fn volumes(&self, ctx: &AccessContext) -> Result<Vec<Arc<Volume>>> {
        self.core.require(ctx, AccessType::View)?;
        Ok(self.volumes.values())
    }

    pub fn resource_connection(&self, ctx: &AccessContext, peer: &NodeName) -> Result<Option<Arc<ResourceConnection>>> {
        self.core.require(ctx, AccessType::View)?;
        Ok(self.resource_connections.get(peer))
    }

    pub fn resource_connections(&self, ctx: &AccessContext) -> Result<Vec<Arc<ResourceConnection>>> {
        self.core.require(ctx, AccessType::View)?;
        Ok(self.resource_connections.values())
    }

    // =========================================================================
    // Volume Placement
    // =========================================================================

    /// Storage pool a new volume of `vlm_nr` is placed in. The first of the
    /// resource, volume definition, resource definition and node that sets
    /// the pool property wins.
    fn select_stor_pool_name(
        &self,
        ctx: &AccessContext,
        node: &Node,
        definition: &ResourceDefinition,
        vlm_nr: VolumeNumber,
        default_pool: &StorPoolName,
    ) -> Result<StorPoolName> {
        let mut configured = self.props(ctx)?.get(keys::STOR_POOL_NAME, None)?;
        if configured.is_none() {
            if let Some(vlm_dfn) = definition.volume_definitions.get(&vlm_nr) {
                configured = vlm_dfn.props(ctx)?.get(keys::STOR_POOL_NAME, None)?;
            }
        }
        if configured.is_none() {
            configured = definition.props(ctx)?.get(keys::STOR_POOL_NAME, None)?;
        }
        if configured.is_none() {
            configured = node.props(ctx)?.get(keys::STOR_POOL_NAME, None)?;
        }
        match configured {
            Some(name) => StorPoolName::new(name),
            None => Ok(default_pool.clone()),
        }
    }

    /// Creates the missing volume of every volume definition and returns
    /// the created volumes. Diskless resources always use `diskless_pool`.
    pub fn adjust_volumes(
        self: &Arc<Self>,
        ctx: &AccessContext,
        tx: &TransactionMgr,
        default_pool: &StorPoolName,
        diskless_pool: &StorPoolName,
    ) -> Result<Vec<Arc<Volume>>> {
        self.core.require_in(ctx, tx, AccessType::Use)?;
        let node = upgrade(&self.node, "node", self.core.key())?;
        let definition = upgrade(&self.definition, "resource definition", self.core.key())?;
        let diskless = self.raw_flags().contains(ResourceFlags::DISKLESS);

        let mut created = Vec::new();
        for vlm_dfn in definition.volume_definitions(ctx)? {
            let vlm_nr = vlm_dfn.raw_volume_number();
            if self.volumes.contains_key(&vlm_nr) {
                continue;
            }
            let pool_name = if diskless {
                diskless_pool.clone()
            } else {
                self.select_stor_pool_name(ctx, &node, &definition, vlm_nr, default_pool)?
            };
            let pool = node.stor_pool(ctx, &pool_name)?.ok_or_else(|| Error::NotFound {
                kind: "storage pool",
                key: format!("{}/{}", self.node_name, pool_name),
            })?;
            let volume = Volume::get_instance(
                ctx,
                tx,
                self,
                &vlm_dfn,
                &pool,
                None,
                None,
                VolumeFlags::empty(),
                InstanceMode::Create,
            )?;
            created.extend(volume);
        }
        Ok(created)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    pub fn mark_deleted(&self, ctx: &AccessContext, tx: &TransactionMgr) -> Result<()> {
        self.core.require_in(ctx, tx, AccessType::Control)?;
        self.flags.enable_flags(ctx, tx, ResourceFlags::DELETE)
    }

    /// Deletes the resource with its volumes and connections
    pub fn delete(&self, ctx: &AccessContext, tx: &TransactionMgr) -> Result<()> {
        self.core.require_in(ctx, tx, AccessType::Control)?;

        for conn in self.resource_connections.values() {
            conn.delete(ctx, tx)?;
        }
        for volume in self.volumes.values() {
            volume.delete(ctx, tx)?;
        }

        let node = upgrade(&self.node, "node", self.core.key())?;
        let definition = upgrade(&self.definition, "resource definition", self.core.key())?;
        {
            let _node_guard = node.core().lock();
            let _dfn_guard = definition.core().lock();
            node.resources.remove(tx, &self.resource_name)?;
            definition.resources.remove(tx, &self.node_name)?;
        }
        self.core.destroy(tx)?;
        debug!("Deleted resource {}/{}", self.node_name, self.resource_name);
        Ok(())
    }

    pub fn api_data(&self, ctx: &AccessContext) -> Result<ResourceApi> {
        self.core.require(ctx, AccessType::View)?;
        let definition = upgrade(&self.definition, "resource definition", self.core.key())?;
        let volumes = self
            .volumes
            .values()
            .iter()
            .map(|volume| volume.api_data(ctx))
            .collect::<Result<Vec<_>>>()?;
        Ok(ResourceApi {
            uuid: self.core.raw_uuid(),
            node_name: self.node_name.display_name().to_string(),
            resource_name: self.resource_name.display_name().to_string(),
            definition_uuid: definition.core().raw_uuid(),
            node_id: self.node_id.value(),
            flags: self.flags.raw_bits(),
            props: self.core.raw_props().map(),
            volumes,
            connections: self
                .resource_connections
                .keys()
                .iter()
                .map(|peer| peer.display_name().to_string())
                .collect(),
        })
    }
}
