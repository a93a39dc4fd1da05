//! Resource connection
//!
//! Link between two resources of the same resource definition on
//! different nodes.

use super::api::ResourceConnectionApi;
use super::common::{canonical_pair, entity_accessors, upgrade, EntityCore, InstanceMode};
use super::Resource;
use crate::domain::{NodeName, ResourceName};
use crate::error::{Error, Result};
use crate::persistence::{db_key, ExistenceDriver, ResourceConnectionRow};
use crate::security::{paths, AccessContext, AccessType, ObjectProtection};
use crate::transaction::TransactionMgr;
use std::sync::{Arc, Weak};
use tracing::debug;
use uuid::Uuid;

const KIND: &str = "resource connection";

pub struct ResourceConnection {
    core: EntityCore,
    source: Weak<Resource>,
    target: Weak<Resource>,
    source_node: NodeName,
    target_node: NodeName,
    resource_name: ResourceName,
}

entity_accessors!(ResourceConnection);

impl ResourceConnection {
    fn build(
        source: &Arc<Resource>,
        target: &Arc<Resource>,
        uuid: Uuid,
        obj_prot: Arc<ObjectProtection>,
        persisted: bool,
    ) -> Arc<Self> {
        let drivers = source.core().drivers().clone();
        let source_node = source.node_name().clone();
        let target_node = target.node_name().clone();
        let resource_name = source.resource_name().clone();
        Arc::new_cyclic(|weak| Self {
            core: EntityCore::new(
                KIND,
                format!("{}/{}/{}", source_node, target_node, resource_name),
                uuid,
                obj_prot,
                &drivers,
                ExistenceDriver::new(
                    weak.clone(),
                    drivers.resource_connections.clone(),
                    db_key(&[source_node.value(), target_node.value(), resource_name.value()]),
                    Self::row,
                ),
                persisted,
            ),
            source: Arc::downgrade(source),
            target: Arc::downgrade(target),
            source_node,
            target_node,
            resource_name,
        })
    }

    fn endpoints<'a>(
        rsc_a: &'a Arc<Resource>,
        rsc_b: &'a Arc<Resource>,
    ) -> Result<(&'a Arc<Resource>, &'a Arc<Resource>)> {
        if rsc_a.resource_name() != rsc_b.resource_name() {
            return Err(Error::InvalidConnection(format!(
                "resources {} and {} belong to different resource definitions",
                rsc_a.resource_name(),
                rsc_b.resource_name()
            )));
        }
        if rsc_a.node_name() == rsc_b.node_name() {
            return Err(Error::InvalidConnection(format!(
                "resource {} on node {} cannot be connected to itself",
                rsc_a.resource_name(),
                rsc_a.node_name()
            )));
        }
        Ok(canonical_pair(rsc_a, rsc_a.node_name(), rsc_b, rsc_b.node_name()))
    }

    /// Looks up or creates the connection between two resources, in either
    /// argument order. Creation requires USE on both resources.
    pub fn get_instance(
        ctx: &AccessContext,
        tx: &TransactionMgr,
        rsc_a: &Arc<Resource>,
        rsc_b: &Arc<Resource>,
        mode: InstanceMode,
    ) -> Result<Option<Arc<Self>>> {
        let (source, target) = Self::endpoints(rsc_a, rsc_b)?;
        source.core().require_in(ctx, tx, AccessType::View)?;
        target.core().require_in(ctx, tx, AccessType::View)?;
        let _source_guard = source.core().lock();
        let _target_guard = target.core().lock();
        let existing = source.resource_connections.get(target.node_name());
        mode.resolve_in(
            tx,
            existing,
            KIND,
            || format!("{}/{}/{}", source.node_name(), target.node_name(), source.resource_name()),
            || {
                source.core().require_in(ctx, tx, AccessType::Use)?;
                target.core().require_in(ctx, tx, AccessType::Use)?;
                let obj_prot = ObjectProtection::create(
                    ctx,
                    tx,
                    paths::resource_connection(source.node_name(), target.node_name(), source.resource_name()),
                    source.core().drivers(),
                )?;
                let conn = Self::build(source, target, Uuid::new_v4(), obj_prot, false);
                conn.core.persist(tx)?;
                source
                    .resource_connections
                    .insert(tx, target.node_name().clone(), conn.clone())?;
                target
                    .resource_connections
                    .insert(tx, source.node_name().clone(), conn.clone())?;
                debug!(
                    "Created resource connection {} - {} for {}",
                    source.node_name(),
                    target.node_name(),
                    source.resource_name()
                );
                Ok(conn)
            },
        )
    }

    pub(crate) fn restore(
        rsc_a: &Arc<Resource>,
        rsc_b: &Arc<Resource>,
        uuid: Uuid,
        obj_prot: Arc<ObjectProtection>,
    ) -> Result<Arc<Self>> {
        let (source, target) = Self::endpoints(rsc_a, rsc_b)?;
        let conn = Self::build(source, target, uuid, obj_prot, true);
        source.resource_connections.restore(target.node_name().clone(), conn.clone());
        target.resource_connections.restore(source.node_name().clone(), conn.clone());
        Ok(conn)
    }

    fn row(&self) -> ResourceConnectionRow {
        ResourceConnectionRow {
            uuid: self.core.raw_uuid().to_string(),
            source_node: self.source_node.display_name().to_string(),
            target_node: self.target_node.display_name().to_string(),
            resource_name: self.resource_name.display_name().to_string(),
        }
    }

    pub fn source_resource(&self) -> Result<Arc<Resource>> {
        self.core.check_deleted()?;
        upgrade(&self.source, "resource", self.core.key())
    }

    pub fn target_resource(&self) -> Result<Arc<Resource>> {
        self.core.check_deleted()?;
        upgrade(&self.target, "resource", self.core.key())
    }

    pub fn delete(&self, ctx: &AccessContext, tx: &TransactionMgr) -> Result<()> {
        self.core.require_in(ctx, tx, AccessType::Control)?;
        let source = upgrade(&self.source, "resource", self.core.key())?;
        let target = upgrade(&self.target, "resource", self.core.key())?;
        {
            let _source_guard = source.core().lock();
            let _target_guard = target.core().lock();
            source.resource_connections.remove(tx, &self.target_node)?;
            target.resource_connections.remove(tx, &self.source_node)?;
        }
        self.core.destroy(tx)?;
        debug!(
            "Deleted resource connection {} - {} for {}",
            self.source_node, self.target_node, self.resource_name
        );
        Ok(())
    }

    pub fn api_data(&self, ctx: &AccessContext) -> Result<ResourceConnectionApi> {
        self.core.require(ctx, AccessType::View)?;
        Ok(ResourceConnectionApi {
            uuid: self.core.raw_uuid(),
            source_node: self.source_node.display_name().to_string(),
            target_node: self.target_node.display_name().to_string(),
            resource_name: self.resource_name.display_name().to_string(),
            props: self.core.raw_props().map(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::test_support::Fixture;
    use assert_matches::assert_matches;

    #[test]
    fn test_connection_between_peers() {
        let fx = Fixture::new();
        let tx = fx.tx();
        let n1 = fx.node(&tx, "n1");
        let n2 = fx.node(&tx, "n2");
        let rsc_dfn = fx.rsc_dfn(&tx, "r1", 7000);
        let rsc1 = fx.resource(&tx, &n1, &rsc_dfn, 0);
        let rsc2 = fx.resource(&tx, &n2, &rsc_dfn, 1);

        let conn = ResourceConnection::get_instance(&fx.ctx, &tx, &rsc2, &rsc1, InstanceMode::Create)
            .unwrap()
            .unwrap();
        assert!(Arc::ptr_eq(&conn.source_resource().unwrap(), &rsc1));
        let again = ResourceConnection::get_instance(&fx.ctx, &tx, &rsc1, &rsc2, InstanceMode::Require)
            .unwrap()
            .unwrap();
        assert!(Arc::ptr_eq(&conn, &again));
        tx.commit().unwrap();

        let api = conn.api_data(&fx.ctx).unwrap();
        assert_eq!(api.source_node, "n1");
        assert_eq!(api.target_node, "n2");
        assert_eq!(api.resource_name, "r1");
    }

    #[test]
    fn test_invalid_endpoints() {
        let fx = Fixture::new();
        let tx = fx.tx();
        let n1 = fx.node(&tx, "n1");
        let n2 = fx.node(&tx, "n2");
        let r1 = fx.rsc_dfn(&tx, "r1", 7000);
        let r2 = fx.rsc_dfn(&tx, "r2", 7001);
        let rsc_r1 = fx.resource(&tx, &n1, &r1, 0);
        let rsc_r2 = fx.resource(&tx, &n2, &r2, 0);

        assert_matches!(
            ResourceConnection::get_instance(&fx.ctx, &tx, &rsc_r1, &rsc_r2, InstanceMode::Create),
            Err(Error::InvalidConnection(_))
        );
        assert_matches!(
            ResourceConnection::get_instance(&fx.ctx, &tx, &rsc_r1, &rsc_r1, InstanceMode::Create),
            Err(Error::InvalidConnection(_))
        );
    }

    #[test]
    fn test_resource_delete_removes_connection() {
        let fx = Fixture::new();
        let tx = fx.tx();
        let n1 = fx.node(&tx, "n1");
        let n2 = fx.node(&tx, "n2");
        let rsc_dfn = fx.rsc_dfn(&tx, "r1", 7000);
        let rsc1 = fx.resource(&tx, &n1, &rsc_dfn, 0);
        let rsc2 = fx.resource(&tx, &n2, &rsc_dfn, 1);
        let conn = ResourceConnection::get_instance(&fx.ctx, &tx, &rsc1, &rsc2, InstanceMode::Create)
            .unwrap()
            .unwrap();
        tx.commit().unwrap();

        let tx = fx.tx();
        rsc1.delete(&fx.ctx, &tx).unwrap();
        tx.commit().unwrap();
        assert!(conn.is_deleted());
        assert!(rsc2.resource_connections(&fx.ctx).unwrap().is_empty());
    }
}
