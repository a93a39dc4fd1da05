//! Volume connection
//!
//! Link between the two volumes with the same volume number of the two
//! resources joined by a resource connection.

use super::api::VolumeConnectionApi;
use super::common::{canonical_pair, entity_accessors, upgrade, EntityCore, InstanceMode};
use super::Volume;
use crate::domain::{NodeName, ResourceName, VolumeNumber};
use crate::error::{Error, Result};
use crate::persistence::{db_key, ExistenceDriver, VolumeConnectionRow};
use crate::security::{paths, AccessContext, AccessType, ObjectProtection};
use crate::transaction::TransactionMgr;
use std::sync::{Arc, Weak};
use tracing::debug;
use uuid::Uuid;

const KIND: &str = "volume connection";

pub struct VolumeConnection {
    core: EntityCore,
    source: Weak<Volume>,
    target: Weak<Volume>,
    source_node: NodeName,
    target_node: NodeName,
    resource_name: ResourceName,
    vlm_nr: VolumeNumber,
}

entity_accessors!(VolumeConnection);

impl VolumeConnection {
    fn build(
        source: &Arc<Volume>,
        target: &Arc<Volume>,
        uuid: Uuid,
        obj_prot: Arc<ObjectProtection>,
        persisted: bool,
    ) -> Arc<Self> {
        let drivers = source.core().drivers().clone();
        let source_node = source.node_name().clone();
        let target_node = target.node_name().clone();
        let resource_name = source.resource_name().clone();
        let vlm_nr = source.raw_volume_number();
        Arc::new_cyclic(|weak| Self {
            core: EntityCore::new(
                KIND,
                format!("{}/{}/{}/{}", source_node, target_node, resource_name, vlm_nr),
                uuid,
                obj_prot,
                &drivers,
                ExistenceDriver::new(
                    weak.clone(),
                    drivers.volume_connections.clone(),
                    db_key(&[
                        source_node.value(),
                        target_node.value(),
                        resource_name.value(),
                        &vlm_nr.to_string(),
                    ]),
                    Self::row,
                ),
                persisted,
            ),
            source: Arc::downgrade(source),
            target: Arc::downgrade(target),
            source_node,
            target_node,
            resource_name,
            vlm_nr,
        })
    }

    fn endpoints<'a>(vlm_a: &'a Arc<Volume>, vlm_b: &'a Arc<Volume>) -> Result<(&'a Arc<Volume>, &'a Arc<Volume>)> {
        if vlm_a.resource_name() != vlm_b.resource_name() || vlm_a.raw_volume_number() != vlm_b.raw_volume_number() {
            return Err(Error::InvalidConnection(format!(
                "volumes {}/{} and {}/{} do not share a volume definition",
                vlm_a.resource_name(),
                vlm_a.raw_volume_number(),
                vlm_b.resource_name(),
                vlm_b.raw_volume_number()
            )));
        }
        if vlm_a.node_name() == vlm_b.node_name() {
            return Err(Error::InvalidConnection(format!(
                "volume {}/{} on node {} cannot be connected to itself",
                vlm_a.resource_name(),
                vlm_a.raw_volume_number(),
                vlm_a.node_name()
            )));
        }
        Ok(canonical_pair(vlm_a, vlm_a.node_name(), vlm_b, vlm_b.node_name()))
    }

    /// Looks up or creates the connection between two volumes, in either
    /// argument order. Creation requires USE on both volumes.
    pub fn get_instance(
        ctx: &AccessContext,
        tx: &TransactionMgr,
        vlm_a: &Arc<Volume>,
        vlm_b: &Arc<Volume>,
        mode: InstanceMode,
    ) -> Result<Option<Arc<Self>>> {
        let (source, target) = Self::endpoints(vlm_a, vlm_b)?;
        source.core().require_in(ctx, tx, AccessType::View)?;
        target.core().require_in(ctx, tx, AccessType::View)?;
        let _source_guard = source.core().lock();
        let _target_guard = target.core().lock();
        let existing = source.volume_connections.get(target.node_name());
        mode.resolve_in(
            tx,
            existing,
            KIND,
            || {
                format!(
                    "{}/{}/{}/{}",
                    source.node_name(),
                    target.node_name(),
                    source.resource_name(),
                    source.raw_volume_number()
                )
            },
            || {
                source.core().require_in(ctx, tx, AccessType::Use)?;
                target.core().require_in(ctx, tx, AccessType::Use)?;
                let obj_prot = ObjectProtection::create(
                    ctx,
                    tx,
                    paths::volume_connection(
                        source.node_name(),
                        target.node_name(),
                        source.resource_name(),
                        source.raw_volume_number(),
                    ),
                    source.core().drivers(),
                )?;
                let conn = Self::build(source, target, Uuid::new_v4(), obj_prot, false);
                conn.core.persist(tx)?;
                source
                    .volume_connections
                    .insert(tx, target.node_name().clone(), conn.clone())?;
                target
                    .volume_connections
                    .insert(tx, source.node_name().clone(), conn.clone())?;
                debug!(
                    "Created volume connection {} - {} for {}/{}",
                    source.node_name(),
                    target.node_name(),
                    source.resource_name(),
                    source.raw_volume_number()
                );
                Ok(conn)
            },
        )
    }

    pub(crate) fn restore(
        vlm_a: &Arc<Volume>,
        vlm_b: &Arc<Volume>,
        uuid: Uuid,
        obj_prot: Arc<ObjectProtection>,
    ) -> Result<Arc<Self>> {
        let (source, target) = Self::endpoints(vlm_a, vlm_b)?;
        let conn = Self::build(source, target, uuid, obj_prot, true);
        source.volume_connections.restore(target.node_name().clone(), conn.clone());
        target.volume_connections.restore(source.node_name().clone(), conn.clone());
        Ok(conn)
    }

    fn row(&self) -> VolumeConnectionRow {
        VolumeConnectionRow {
            uuid: self.core.raw_uuid().to_string(),
            source_node: self.source_node.display_name().to_string(),
            target_node: self.target_node.display_name().to_string(),
            resource_name: self.resource_name.display_name().to_string(),
            volume_number: i64::from(self.vlm_nr.value()),
        }
    }

    pub fn source_volume(&self) -> Result<Arc<Volume>> {
        self.core.check_deleted()?;
        upgrade(&self.source, "volume", self.core.key())
    }

    pub fn target_volume(&self) -> Result<Arc<Volume>> {
        self.core.check_deleted()?;
        upgrade(&self.target, "volume", self.core.key())
    }

    pub fn delete(&self, ctx: &AccessContext, tx: &TransactionMgr) -> Result<()> {
        self.core.require_in(ctx, tx, AccessType::Control)?;
        let source = upgrade(&self.source, "volume", self.core.key())?;
        let target = upgrade(&self.target, "volume", self.core.key())?;
        {
            let _source_guard = source.core().lock();
            let _target_guard = target.core().lock();
            source.volume_connections.remove(tx, &self.target_node)?;
            target.volume_connections.remove(tx, &self.source_node)?;
        }
        self.core.destroy(tx)?;
        debug!(
            "Deleted volume connection {} - {} for {}/{}",
            self.source_node, self.target_node, self.resource_name, self.vlm_nr
        );
        Ok(())
    }

    pub fn api_data(&self, ctx: &AccessContext) -> Result<VolumeConnectionApi> {
        self.core.require(ctx, AccessType::View)?;
        Ok(VolumeConnectionApi {
            uuid: self.core.raw_uuid(),
            source_node: self.source_node.display_name().to_string(),
            target_node: self.target_node.display_name().to_string(),
            resource_name: self.resource_name.display_name().to_string(),
            volume_number: self.vlm_nr.value(),
            props: self.core.raw_props().map(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::DeviceProviderKind;
    use crate::objects::test_support::Fixture;
    use crate::objects::{Node, ResourceDefinition, VolumeDefinition, VolumeFlags};
    use crate::transaction::TransactionMgr;
    use assert_matches::assert_matches;

    fn volume(
        fx: &Fixture,
        tx: &TransactionMgr,
        node: &Arc<Node>,
        rsc_dfn: &Arc<ResourceDefinition>,
        vlm_dfn: &Arc<VolumeDefinition>,
        node_id: i64,
    ) -> Arc<Volume> {
        let pool = fx.stor_pool(tx, node, "pool1", DeviceProviderKind::Lvm);
        let rsc = fx.resource(tx, node, rsc_dfn, node_id);
        Volume::get_instance(
            &fx.ctx,
            tx,
            &rsc,
            vlm_dfn,
            &pool,
            None,
            None,
            VolumeFlags::empty(),
            InstanceMode::Create,
        )
        .unwrap()
        .unwrap()
    }

    #[test]
    fn test_connection_is_canonical() {
        let fx = Fixture::new();
        let tx = fx.tx();
        let n1 = fx.node(&tx, "n1");
        let n2 = fx.node(&tx, "n2");
        let rsc_dfn = fx.rsc_dfn(&tx, "r1", 7000);
        let vlm_dfn = fx.vlm_dfn(&tx, &rsc_dfn, 0, 1000);
        let vlm1 = volume(&fx, &tx, &n1, &rsc_dfn, &vlm_dfn, 0);
        let vlm2 = volume(&fx, &tx, &n2, &rsc_dfn, &vlm_dfn, 1);

        let conn = VolumeConnection::get_instance(&fx.ctx, &tx, &vlm2, &vlm1, InstanceMode::Create)
            .unwrap()
            .unwrap();
        assert!(Arc::ptr_eq(&conn.source_volume().unwrap(), &vlm1));
        assert!(Arc::ptr_eq(&conn.target_volume().unwrap(), &vlm2));
        assert!(vlm1.volume_connection(&fx.ctx, &NodeName::new("n2").unwrap()).unwrap().is_some());
        tx.commit().unwrap();

        let tx = fx.tx();
        vlm_dfn.delete(&fx.ctx, &tx).unwrap();
        tx.commit().unwrap();
        assert!(conn.is_deleted());
    }

    #[test]
    fn test_mismatched_volumes_are_rejected() {
        let fx = Fixture::new();
        let tx = fx.tx();
        let n1 = fx.node(&tx, "n1");
        let n2 = fx.node(&tx, "n2");
        let rsc_dfn = fx.rsc_dfn(&tx, "r1", 7000);
        let vlm_dfn0 = fx.vlm_dfn(&tx, &rsc_dfn, 0, 1000);
        let vlm_dfn1 = fx.vlm_dfn(&tx, &rsc_dfn, 1, 1001);
        let vlm1 = volume(&fx, &tx, &n1, &rsc_dfn, &vlm_dfn0, 0);
        let vlm2 = volume(&fx, &tx, &n2, &rsc_dfn, &vlm_dfn1, 1);

        assert_matches!(
            VolumeConnection::get_instance(&fx.ctx, &tx, &vlm1, &vlm2, InstanceMode::Create),
            Err(Error::InvalidConnection(_))
        );
        assert_matches!(
            VolumeConnection::get_instance(&fx.ctx, &tx, &vlm1, &vlm1, InstanceMode::Create),
            Err(Error::InvalidConnection(_))
        );
    }
}
