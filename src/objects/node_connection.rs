//! Node connection
//!
//! Undirected link between two nodes, stored once in canonical order: the
//! node with the smaller name is the source. Both endpoints index the
//! connection by the name of the other node.

use super::api::NodeConnectionApi;
use super::common::{canonical_pair, entity_accessors, upgrade, EntityCore, InstanceMode};
use super::Node;
use crate::domain::NodeName;
use crate::error::{Error, Result};
use crate::persistence::{db_key, ExistenceDriver, NodeConnectionRow};
use crate::security::{paths, AccessContext, AccessType, ObjectProtection};
use crate::transaction::TransactionMgr;
use std::sync::{Arc, Weak};
use tracing::debug;
use uuid::Uuid;

const KIND: &str = "node connection";

pub struct NodeConnection {
    core: EntityCore,
    source: Weak<Node>,
    target: Weak<Node>,
    source_name: NodeName,
    target_name: NodeName,
}

entity_accessors!(NodeConnection);

impl NodeConnection {
    fn build(
        source: &Arc<Node>,
        target: &Arc<Node>,
        uuid: Uuid,
        obj_prot: Arc<ObjectProtection>,
        persisted: bool,
    ) -> Arc<Self> {
        let drivers = source.core().drivers().clone();
        let source_name = source.node_name().clone();
        let target_name = target.node_name().clone();
        Arc::new_cyclic(|weak| Self {
            core: EntityCore::new(
                KIND,
                format!("{}/{}", source_name, target_name),
                uuid,
                obj_prot,
                &drivers,
                ExistenceDriver::new(
                    weak.clone(),
                    drivers.node_connections.clone(),
                    db_key(&[source_name.value(), target_name.value()]),
                    Self::row,
                ),
                persisted,
            ),
            source: Arc::downgrade(source),
            target: Arc::downgrade(target),
            source_name,
            target_name,
        })
    }

    /// Orders two nodes into (source, target)
    fn endpoints<'a>(node_a: &'a Arc<Node>, node_b: &'a Arc<Node>) -> Result<(&'a Arc<Node>, &'a Arc<Node>)> {
        if node_a.node_name() == node_b.node_name() {
            return Err(Error::InvalidConnection(format!(
                "node {} cannot be connected to itself",
                node_a.node_name()
            )));
        }
        Ok(canonical_pair(node_a, node_a.node_name(), node_b, node_b.node_name()))
    }

    /// Looks up or creates the connection between two nodes, in either
    /// argument order. Creation requires CHANGE on both nodes.
    pub fn get_instance(
        ctx: &AccessContext,
        tx: &TransactionMgr,
        node_a: &Arc<Node>,
        node_b: &Arc<Node>,
        mode: InstanceMode,
    ) -> Result<Option<Arc<Self>>> {
        let (source, target) = Self::endpoints(node_a, node_b)?;
        source.core().require_in(ctx, tx, AccessType::View)?;
        target.core().require_in(ctx, tx, AccessType::View)?;
        let _source_guard = source.core().lock();
        let _target_guard = target.core().lock();
        let existing = source.node_connections.get(target.node_name());
        mode.resolve_in(
            tx,
            existing,
            KIND,
            || format!("{}/{}", source.node_name(), target.node_name()),
            || {
                source.core().require_in(ctx, tx, AccessType::Change)?;
                target.core().require_in(ctx, tx, AccessType::Change)?;
                let obj_prot = ObjectProtection::create(
                    ctx,
                    tx,
                    paths::node_connection(source.node_name(), target.node_name()),
                    source.core().drivers(),
                )?;
                let conn = Self::build(source, target, Uuid::new_v4(), obj_prot, false);
                conn.core.persist(tx)?;
                source
                    .node_connections
                    .insert(tx, target.node_name().clone(), conn.clone())?;
                target
                    .node_connections
                    .insert(tx, source.node_name().clone(), conn.clone())?;
                debug!("Created node connection {} - {}", source.node_name(), target.node_name());
                Ok(conn)
            },
        )
    }

    pub(crate) fn restore(
        node_a: &Arc<Node>,
        node_b: &Arc<Node>,
        uuid: Uuid,
        obj_prot: Arc<ObjectProtection>,
    ) -> Result<Arc<Self>> {
        let (source, target) = Self::endpoints(node_a, node_b)?;
        let conn = Self::build(source, target, uuid, obj_prot, true);
        source.node_connections.restore(target.node_name().clone(), conn.clone());
        target.node_connections.restore(source.node_name().clone(), conn.clone());
        Ok(conn)
    }

    fn row(&self) -> NodeConnectionRow {
        NodeConnectionRow {
            uuid: self.core.raw_uuid().to_string(),
            source_node: self.source_name.display_name().to_string(),
            target_node: self.target_name.display_name().to_string(),
        }
    }

    pub fn source_node(&self) -> Result<Arc<Node>> {
        self.core.check_deleted()?;
        upgrade(&self.source, "node", self.core.key())
    }

    pub fn target_node(&self) -> Result<Arc<Node>> {
        self.core.check_deleted()?;
        upgrade(&self.target, "node", self.core.key())
    }

    pub fn delete(&self, ctx: &AccessContext, tx: &TransactionMgr) -> Result<()> {
        self.core.require_in(ctx, tx, AccessType::Control)?;
        let source = upgrade(&self.source, "node", self.core.key())?;
        let target = upgrade(&self.target, "node", self.core.key())?;
        {
            let _source_guard = source.core().lock();
            let _target_guard = target.core().lock();
            source.node_connections.remove(tx, &self.target_name)?;
            target.node_connections.remove(tx, &self.source_name)?;
        }
        self.core.destroy(tx)?;
        debug!("Deleted node connection {} - {}", self.source_name, self.target_name);
        Ok(())
    }

    pub fn api_data(&self, ctx: &AccessContext) -> Result<NodeConnectionApi> {
        self.core.require(ctx, AccessType::View)?;
        Ok(NodeConnectionApi {
            uuid: self.core.raw_uuid(),
            source_node: self.source_name.display_name().to_string(),
            target_node: self.target_name.display_name().to_string(),
            props: self.core.raw_props().map(),
        })
    }
}
