//! Controller Instance
//!
//! Owns the root maps of the entity graph, the persistence drivers and the
//! metrics of one controller. Opening a controller restores (or, on first
//! start, creates) the protection objects of the three root maps and loads
//! the stored graph.
//!
//! Operations run in their own transaction scope through
//! [`Controller::run_in_scope`], which commits on success and rolls back on
//! any error.

use crate::config::ControllerConfig;
use crate::domain::{
    DeviceProviderKind, DrbdNodeId, MinorNumber, NodeName, NodeType, ResourceName, StorPoolName, TcpPortNumber,
    TransportType, VolumeNumber, VOLUME_NUMBER_MAX, VOLUME_NUMBER_MIN,
};
use crate::error::Result;
use crate::metrics::ControllerMetrics;
use crate::numberpool::{get_free_number, sorted_numbers};
use crate::objects::api::TopologyApi;
use crate::objects::common::created;
use crate::objects::{
    CoreObjects, InstanceMode, Node, NodeFlags, Resource, ResourceDefinition, ResourceDefinitionFlags, ResourceFlags,
    StorPool, StorPoolDefinition, VolumeDefinition, VolumeDefinitionFlags,
};
use crate::persistence::{Database, DatabaseDrivers, DatabaseLoader, LoadSummary, MemoryDatabase};
use crate::security::{paths, AccessContext, ObjectProtection};
use crate::transaction::TransactionMgr;
use std::sync::Arc;
use tracing::{debug, info};

/// One controller instance
pub struct Controller {
    config: ControllerConfig,
    db: Arc<dyn Database>,
    objects: Arc<CoreObjects>,
    metrics: ControllerMetrics,
    sys_ctx: AccessContext,
}

impl Controller {
    /// Opens the database named by the configuration (in memory when no
    /// path is set) and loads it
    pub fn from_config(config: ControllerConfig) -> Result<Self> {
        config.validate()?;
        let db: Arc<dyn Database> = match &config.database_path {
            Some(path) => MemoryDatabase::open(path)?,
            None => MemoryDatabase::in_memory(),
        };
        Self::open(config, db)
    }

    /// Bootstraps the root maps on `db` and loads every stored entity
    pub fn open(config: ControllerConfig, db: Arc<dyn Database>) -> Result<Self> {
        let sys_ctx = AccessContext::system();
        let drivers = DatabaseDrivers::generic(db.clone());

        let tx = TransactionMgr::new(db.clone());
        let nodes_prot = map_protection(&sys_ctx, &tx, &drivers, paths::NODES_MAP)?;
        let rsc_dfn_prot = map_protection(&sys_ctx, &tx, &drivers, paths::RESOURCE_DEFINITIONS_MAP)?;
        let spdfn_prot = map_protection(&sys_ctx, &tx, &drivers, paths::STOR_POOL_DEFINITIONS_MAP)?;
        tx.commit()?;

        let objects = CoreObjects::new(drivers, nodes_prot, rsc_dfn_prot, spdfn_prot);
        let metrics = ControllerMetrics::new()?;
        let summary = DatabaseLoader::new(objects.clone()).load_all()?;
        metrics.record_load(&summary);

        let controller = Self {
            config,
            db,
            objects,
            metrics,
            sys_ctx,
        };
        controller.refresh_gauges();
        info!("Controller ready: {} entities loaded", summary.total());
        Ok(controller)
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn objects(&self) -> &Arc<CoreObjects> {
        &self.objects
    }

    pub fn metrics(&self) -> &ControllerMetrics {
        &self.metrics
    }

    /// Context with every privilege, used for bootstrap and internal work
    pub fn system_context(&self) -> &AccessContext {
        &self.sys_ctx
    }

    /// Opens a new transaction scope on the controller database
    pub fn transaction(&self) -> TransactionMgr {
        TransactionMgr::new(self.db.clone())
    }

    /// Runs `operation` in a fresh scope. The scope is committed when the
    /// operation succeeds and rolled back otherwise.
    pub fn run_in_scope<T>(&self, operation: impl FnOnce(&TransactionMgr) -> Result<T>) -> Result<T> {
        let tx = self.transaction();
        let result = operation(&tx).and_then(|value| {
            let stats = tx.commit()?;
            self.metrics.record_commit(stats);
            Ok(value)
        });
        if let Err(err) = &result {
            tx.rollback();
            self.metrics.record_rollback();
            debug!("Operation in {} failed: {}", tx.id(), err);
        }
        self.refresh_gauges();
        result
    }

    /// Restores anything stored but not yet in the live graph
    pub fn reload(&self) -> Result<LoadSummary> {
        let summary = DatabaseLoader::new(self.objects.clone()).load_all()?;
        self.metrics.record_load(&summary);
        self.refresh_gauges();
        Ok(summary)
    }

    fn refresh_gauges(&self) {
        self.metrics.set_counts(
            self.objects.node_count(),
            self.objects.resource_definition_count(),
            self.objects.stor_pool_definition_count(),
        );
    }

    // =========================================================================
    // Number Allocation
    // =========================================================================

    /// Smallest port of the configured range not used by any resource
    /// definition
    pub fn allocate_tcp_port(&self) -> Result<TcpPortNumber> {
        let occupied = sorted_numbers(
            self.objects
                .resource_definitions
                .values()
                .iter()
                .map(|rsc_dfn| i64::from(rsc_dfn.raw_port().value())),
        );
        let range = self.config.tcp_port_range;
        TcpPortNumber::new(get_free_number(&occupied, range.min, range.max)?)
    }

    /// Smallest minor number of the configured range not used by any
    /// volume definition
    pub fn allocate_minor_number(&self) -> Result<MinorNumber> {
        let occupied = sorted_numbers(self.objects.resource_definitions.values().iter().flat_map(|rsc_dfn| {
            rsc_dfn
                .volume_definitions
                .values()
                .into_iter()
                .map(|vlm_dfn| i64::from(vlm_dfn.raw_minor().value()))
        }));
        let range = self.config.minor_number_range;
        MinorNumber::new(get_free_number(&occupied, range.min, range.max)?)
    }

    fn allocate_volume_number(&self, rsc_dfn: &ResourceDefinition) -> Result<VolumeNumber> {
        let occupied = sorted_numbers(
            rsc_dfn
                .volume_definitions
                .keys()
                .into_iter()
                .map(|vlm_nr| i64::from(vlm_nr.value())),
        );
        VolumeNumber::new(get_free_number(&occupied, VOLUME_NUMBER_MIN, VOLUME_NUMBER_MAX)?)
    }

    // =========================================================================
    // Factories
    // =========================================================================

    pub fn create_node(
        &self,
        ctx: &AccessContext,
        tx: &TransactionMgr,
        name: NodeName,
        node_type: NodeType,
    ) -> Result<Arc<Node>> {
        let node = Node::get_instance(
            ctx,
            tx,
            &self.objects,
            name,
            node_type,
            NodeFlags::empty(),
            InstanceMode::Create,
        )?;
        created(node, "node")
    }

    /// Creates a storage pool on `node`, creating its definition on first use
    pub fn create_stor_pool(
        &self,
        ctx: &AccessContext,
        tx: &TransactionMgr,
        node: &Arc<Node>,
        pool_name: StorPoolName,
        provider_kind: DeviceProviderKind,
    ) -> Result<Arc<StorPool>> {
        let definition =
            StorPoolDefinition::get_instance(ctx, tx, &self.objects, pool_name, InstanceMode::LoadOrCreate)?;
        let definition = created(definition, "storage pool definition")?;
        let pool = StorPool::get_instance(ctx, tx, node, &definition, provider_kind, InstanceMode::Create)?;
        created(pool, "storage pool")
    }

    /// Creates a resource definition, allocating a port when none is given
    pub fn create_resource_definition(
        &self,
        ctx: &AccessContext,
        tx: &TransactionMgr,
        name: ResourceName,
        port: Option<TcpPortNumber>,
        secret: String,
        transport_type: TransportType,
    ) -> Result<Arc<ResourceDefinition>> {
        let _guard = self.objects.lock();
        let port = match port {
            Some(port) => port,
            None => self.allocate_tcp_port()?,
        };
        let rsc_dfn = ResourceDefinition::get_instance(
            ctx,
            tx,
            &self.objects,
            name,
            port,
            secret,
            transport_type,
            ResourceDefinitionFlags::empty(),
            InstanceMode::Create,
        )?;
        created(rsc_dfn, "resource definition")
    }

    /// Creates a volume definition, allocating the volume number and the
    /// minor number when they are not given
    pub fn create_volume_definition(
        &self,
        ctx: &AccessContext,
        tx: &TransactionMgr,
        rsc_dfn: &Arc<ResourceDefinition>,
        vlm_nr: Option<VolumeNumber>,
        minor: Option<MinorNumber>,
        size_kib: u64,
    ) -> Result<Arc<VolumeDefinition>> {
        let _guard = self.objects.lock();
        let vlm_nr = match vlm_nr {
            Some(vlm_nr) => vlm_nr,
            None => self.allocate_volume_number(rsc_dfn)?,
        };
        let minor = match minor {
            Some(minor) => minor,
            None => self.allocate_minor_number()?,
        };
        let vlm_dfn = VolumeDefinition::get_instance(
            ctx,
            tx,
            rsc_dfn,
            vlm_nr,
            minor,
            size_kib,
            VolumeDefinitionFlags::empty(),
            InstanceMode::Create,
        )?;
        created(vlm_dfn, "volume definition")
    }

    /// Deploys `rsc_dfn` on `node` and creates its volumes in the configured
    /// storage pools. A node id is allocated when none is given.
    pub fn create_resource(
        &self,
        ctx: &AccessContext,
        tx: &TransactionMgr,
        node: &Arc<Node>,
        rsc_dfn: &Arc<ResourceDefinition>,
        node_id: Option<DrbdNodeId>,
        flags: ResourceFlags,
    ) -> Result<Arc<Resource>> {
        let node_id = match node_id {
            Some(node_id) => node_id,
            None => rsc_dfn.next_free_node_id(ctx)?,
        };
        let rsc = Resource::get_instance(ctx, tx, node, rsc_dfn, node_id, flags, InstanceMode::Create)?;
        let rsc = created(rsc, "resource")?;
        rsc.adjust_volumes(
            ctx,
            tx,
            &self.config.default_stor_pool_name()?,
            &self.config.diskless_stor_pool_name()?,
        )?;
        Ok(rsc)
    }

    /// Snapshot of every entity visible to `ctx`
    pub fn topology(&self, ctx: &AccessContext) -> Result<TopologyApi> {
        Ok(TopologyApi {
            nodes: self
                .objects
                .nodes(ctx)?
                .iter()
                .map(|node| node.api_data(ctx))
                .collect::<Result<_>>()?,
            stor_pool_definitions: self
                .objects
                .stor_pool_definitions(ctx)?
                .iter()
                .map(|spdfn| spdfn.api_data(ctx))
                .collect::<Result<_>>()?,
            resource_definitions: self
                .objects
                .resource_definitions(ctx)?
                .iter()
                .map(|rsc_dfn| rsc_dfn.api_data(ctx))
                .collect::<Result<_>>()?,
        })
    }
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("objects", &self.objects)
            .field("config", &self.config)
            .finish()
    }
}

/// Restores the protection of a root map, creating it on first start
fn map_protection(
    sys_ctx: &AccessContext,
    tx: &TransactionMgr,
    drivers: &DatabaseDrivers,
    path: &str,
) -> Result<Arc<ObjectProtection>> {
    if drivers.object_protection.load(path)?.is_some() {
        DatabaseLoader::load_protection(drivers, path)
    } else {
        info!("Creating protection of {}", path);
        ObjectProtection::create(sys_ctx, tx, path, drivers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Bound, Error, RangeViolation};
    use crate::persistence::{NodeRow, PersistedRow, ResourceRow, WriteKind};
    use crate::security::{Identity, Privilege, Role, SecurityType};
    use assert_matches::assert_matches;
    use std::thread;

    fn setup() -> (Arc<MemoryDatabase>, Controller, AccessContext) {
        let db = MemoryDatabase::in_memory();
        let controller = Controller::open(ControllerConfig::default(), db.clone()).unwrap();
        let ctx = AccessContext::new(
            Identity::new("admin").unwrap(),
            Role::new("admin").unwrap(),
            SecurityType::public(),
            Privilege::OBJ_VIEW | Privilege::OBJ_USE | Privilege::OBJ_CHANGE | Privilege::OBJ_CONTROL,
        );
        db.clear_journal();
        (db, controller, ctx)
    }

    fn node_name(name: &str) -> NodeName {
        NodeName::new(name).unwrap()
    }

    fn rsc_name(name: &str) -> ResourceName {
        ResourceName::new(name).unwrap()
    }

    #[test]
    fn test_open_creates_map_protections_once() {
        let db = MemoryDatabase::in_memory();
        let first = Controller::open(ControllerConfig::default(), db.clone()).unwrap();
        assert_eq!(db.row_count("sec_object_protection"), 3);
        drop(first);

        db.clear_journal();
        Controller::open(ControllerConfig::default(), db.clone()).unwrap();
        assert_eq!(db.row_count("sec_object_protection"), 3);
        assert!(db.journal().is_empty());
    }

    #[test]
    fn test_concurrent_disjoint_node_creation() {
        let (db, controller, ctx) = setup();
        thread::scope(|scope| {
            for idx in 0..8 {
                let controller = &controller;
                let ctx = &ctx;
                scope.spawn(move || {
                    controller
                        .run_in_scope(|tx| {
                            controller.create_node(ctx, tx, node_name(&format!("node-{}", idx)), NodeType::Satellite)
                        })
                        .unwrap();
                });
            }
        });

        assert_eq!(controller.objects().node_count(), 8);
        assert_eq!(db.row_count(NodeRow::TABLE), 8);
        assert_eq!(controller.metrics().transactions_committed.get(), 8);
        assert_eq!(controller.reload().unwrap().total(), 0);
        assert_eq!(controller.metrics().nodes.get(), 8);
    }

    #[test]
    fn test_rejected_commit_has_no_visible_effect() {
        let (db, controller, ctx) = setup();
        db.reject_next(Some(ResourceRow::TABLE), Some(WriteKind::Insert));

        let result = controller.run_in_scope(|tx| {
            let node = controller.create_node(&ctx, tx, node_name("n1"), NodeType::Satellite)?;
            let rsc_dfn = controller.create_resource_definition(&ctx, tx, rsc_name("r1"), None, "s".into(), TransportType::Ip)?;
            controller.create_resource(&ctx, tx, &node, &rsc_dfn, None, ResourceFlags::DISKLESS)
        });

        assert_matches!(result, Err(Error::Persistence(_)));
        assert!(db.journal().is_empty());
        assert_eq!(db.row_count(NodeRow::TABLE), 0);
        assert_eq!(db.row_count("sec_object_protection"), 3);
        assert!(controller.objects().node(&ctx, &node_name("n1")).unwrap().is_none());
        assert!(controller.objects().resource_definition(&ctx, &rsc_name("r1")).unwrap().is_none());
        assert_eq!(controller.metrics().transactions_rolled_back.get(), 1);

        // the same operation succeeds once the store accepts it
        controller
            .run_in_scope(|tx| controller.create_node(&ctx, tx, node_name("n1"), NodeType::Satellite))
            .unwrap();
        assert_eq!(db.row_count(NodeRow::TABLE), 1);
    }

    #[test]
    fn test_scope_cannot_build_on_uncommitted_node() {
        let (db, controller, ctx) = setup();
        let rsc_dfn = controller
            .run_in_scope(|tx| {
                controller.create_resource_definition(&ctx, tx, rsc_name("r1"), None, "s".into(), TransportType::Ip)
            })
            .unwrap();

        let first = controller.transaction();
        let staged = controller.create_node(&ctx, &first, node_name("n1"), NodeType::Satellite).unwrap();

        let second = controller.transaction();
        let require = |tx: &TransactionMgr| {
            Node::get_instance(
                &ctx,
                tx,
                controller.objects(),
                node_name("n1"),
                NodeType::Satellite,
                NodeFlags::empty(),
                InstanceMode::Require,
            )
        };
        assert_matches!(require(&second), Err(Error::TransactionConflict { .. }));
        assert_matches!(
            controller.create_resource(&ctx, &second, &staged, &rsc_dfn, None, ResourceFlags::DISKLESS),
            Err(Error::TransactionConflict { .. })
        );

        first.rollback();
        assert_matches!(require(&second), Err(Error::NotFound { .. }));
        second.commit().unwrap();

        assert_eq!(db.row_count(NodeRow::TABLE), 0);
        assert_eq!(db.row_count(ResourceRow::TABLE), 0);
        assert!(rsc_dfn.resources(&ctx).unwrap().is_empty());
        assert_eq!(controller.reload().unwrap().total(), 0);

        let reopened = Controller::open(ControllerConfig::default(), db).unwrap();
        assert_eq!(reopened.objects().node_count(), 0);
        assert_eq!(reopened.objects().resource_definition_count(), 1);
    }

    #[test]
    fn test_supplied_numbers_must_be_unused() {
        let (_db, controller, ctx) = setup();
        let r1 = controller
            .run_in_scope(|tx| {
                let r1 = controller.create_resource_definition(&ctx, tx, rsc_name("r1"), None, "s".into(), TransportType::Ip)?;
                controller.create_volume_definition(&ctx, tx, &r1, None, None, 4096)?;
                Ok(r1)
            })
            .unwrap();
        let port = r1.port(&ctx).unwrap();
        let minor = MinorNumber::new(1000).unwrap();

        assert_matches!(
            controller.run_in_scope(|tx| {
                controller.create_resource_definition(&ctx, tx, rsc_name("r2"), Some(port), "s".into(), TransportType::Ip)
            }),
            Err(Error::DataAlreadyExists { kind: "TCP port", .. })
        );
        assert_matches!(
            controller.run_in_scope(|tx| {
                let r2 = controller.create_resource_definition(&ctx, tx, rsc_name("r2"), None, "s".into(), TransportType::Ip)?;
                controller.create_volume_definition(&ctx, tx, &r2, None, Some(minor), 4096)
            }),
            Err(Error::DataAlreadyExists { kind: "minor number", .. })
        );
        assert_eq!(controller.objects().resource_definition_count(), 1);

        // allocation skips the taken numbers
        let (r2, vlm_dfn) = controller
            .run_in_scope(|tx| {
                let r2 = controller.create_resource_definition(&ctx, tx, rsc_name("r2"), None, "s".into(), TransportType::Ip)?;
                let vlm_dfn = controller.create_volume_definition(&ctx, tx, &r2, None, None, 4096)?;
                Ok((r2, vlm_dfn))
            })
            .unwrap();
        assert_eq!(r2.port(&ctx).unwrap().value(), 7001);
        assert_eq!(vlm_dfn.minor_nr(&ctx).unwrap().value(), 1001);
    }

    #[test]
    fn test_partial_apply_is_a_defect() {
        let (db, controller, ctx) = setup();
        db.fail_partially_after(1);
        let err = controller
            .run_in_scope(|tx| controller.create_node(&ctx, tx, node_name("n1"), NodeType::Satellite))
            .unwrap_err();

        assert_matches!(err, Error::PartialCommit { .. });
        assert!(err.is_defect());
        assert!(controller.objects().node(&ctx, &node_name("n1")).unwrap().is_none());
    }

    #[test]
    fn test_flag_noops_do_not_persist() {
        let (db, controller, ctx) = setup();
        let node = controller
            .run_in_scope(|tx| controller.create_node(&ctx, tx, node_name("n1"), NodeType::Satellite))
            .unwrap();
        let flags = node.flags().unwrap();

        controller
            .run_in_scope(|tx| flags.enable_flags(&ctx, tx, NodeFlags::EVACUATE))
            .unwrap();
        db.clear_journal();

        controller
            .run_in_scope(|tx| flags.enable_flags(&ctx, tx, NodeFlags::EVACUATE))
            .unwrap();
        controller
            .run_in_scope(|tx| flags.disable_flags(&ctx, tx, NodeFlags::QIGNORE))
            .unwrap();
        controller
            .run_in_scope(|tx| {
                flags.enable_flags(&ctx, tx, NodeFlags::QIGNORE)?;
                flags.disable_flags(&ctx, tx, NodeFlags::QIGNORE)
            })
            .unwrap();

        assert!(db.journal().is_empty());
        assert_eq!(flags.flags_bits(&ctx).unwrap(), NodeFlags::EVACUATE.bits());
    }

    #[test]
    fn test_deleted_entities_reject_accessors() {
        let (_db, controller, ctx) = setup();
        let (node, rsc) = controller
            .run_in_scope(|tx| {
                let node = controller.create_node(&ctx, tx, node_name("n1"), NodeType::Satellite)?;
                let rsc_dfn =
                    controller.create_resource_definition(&ctx, tx, rsc_name("r1"), None, "s".into(), TransportType::Ip)?;
                let rsc = controller.create_resource(&ctx, tx, &node, &rsc_dfn, None, ResourceFlags::empty())?;
                Ok((node, rsc))
            })
            .unwrap();
        controller.run_in_scope(|tx| node.delete(&ctx, tx)).unwrap();

        assert!(node.is_deleted());
        assert!(rsc.is_deleted());
        assert_matches!(node.name(), Err(Error::AccessToDeleted { .. }));
        assert_matches!(node.uuid(), Err(Error::AccessToDeleted { .. }));
        assert_matches!(node.flags(), Err(Error::AccessToDeleted { .. }));
        assert_matches!(node.node_type(&ctx), Err(Error::AccessToDeleted { .. }));
        assert_matches!(node.resources(&ctx), Err(Error::AccessToDeleted { .. }));
        assert_matches!(node.api_data(&ctx), Err(Error::AccessToDeleted { .. }));
        assert_matches!(rsc.node_id(&ctx), Err(Error::AccessToDeleted { .. }));
        assert_matches!(rsc.definition(), Err(Error::AccessToDeleted { .. }));
    }

    #[test]
    fn test_volume_size_bounds() {
        let (_db, controller, ctx) = setup();
        controller
            .run_in_scope(|tx| {
                let rsc_dfn =
                    controller.create_resource_definition(&ctx, tx, rsc_name("r1"), None, "s".into(), TransportType::Ip)?;
                let vlm_dfn = controller.create_volume_definition(&ctx, tx, &rsc_dfn, None, None, 1_048_576)?;
                assert_eq!(vlm_dfn.volume_size(&ctx)?, 1_048_576);

                assert_matches!(
                    controller.create_volume_definition(&ctx, tx, &rsc_dfn, None, None, 0),
                    Err(Error::ValueOutOfRange(RangeViolation { bound: Bound::TooLow, .. }))
                );
                assert_matches!(
                    controller.create_volume_definition(
                        &ctx,
                        tx,
                        &rsc_dfn,
                        None,
                        None,
                        crate::domain::MAX_VOLUME_SIZE_KIB + 1
                    ),
                    Err(Error::ValueOutOfRange(RangeViolation { bound: Bound::TooHigh, .. }))
                );
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_number_allocation() {
        let (_db, controller, ctx) = setup();
        controller
            .run_in_scope(|tx| {
                let first =
                    controller.create_resource_definition(&ctx, tx, rsc_name("r1"), None, "s".into(), TransportType::Ip)?;
                let second =
                    controller.create_resource_definition(&ctx, tx, rsc_name("r2"), None, "s".into(), TransportType::Ip)?;
                assert_eq!(first.port(&ctx)?.value(), 7000);
                assert_eq!(second.port(&ctx)?.value(), 7001);

                let v0 = controller.create_volume_definition(&ctx, tx, &first, None, None, 4096)?;
                let v1 = controller.create_volume_definition(&ctx, tx, &first, None, None, 4096)?;
                let other = controller.create_volume_definition(&ctx, tx, &second, None, None, 4096)?;
                assert_eq!(v0.volume_number()?.value(), 0);
                assert_eq!(v1.volume_number()?.value(), 1);
                assert_eq!(other.volume_number()?.value(), 0);
                assert_eq!(v0.minor_nr(&ctx)?.value(), 1000);
                assert_eq!(v1.minor_nr(&ctx)?.value(), 1001);
                assert_eq!(other.minor_nr(&ctx)?.value(), 1002);

                // node ids 0, 1 and 2 are taken, so the next resource gets 3
                let diskless = ResourceFlags::DISKLESS;
                for (idx, name) in ["n0", "n1", "n2", "n3"].iter().enumerate() {
                    let node = controller.create_node(&ctx, tx, node_name(name), NodeType::Satellite)?;
                    controller.create_stor_pool(
                        &ctx,
                        tx,
                        &node,
                        controller.config().diskless_stor_pool_name()?,
                        DeviceProviderKind::Diskless,
                    )?;
                    let node_id = if idx < 3 { Some(DrbdNodeId::new(idx as i64)?) } else { None };
                    let rsc = controller.create_resource(&ctx, tx, &node, &first, node_id, diskless)?;
                    assert_eq!(rsc.node_id(&ctx)?.value() as usize, idx);
                    assert_eq!(rsc.volumes(&ctx)?.len(), 2);
                }
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_port_range_exhaustion() {
        let db = MemoryDatabase::in_memory();
        let config = ControllerConfig {
            tcp_port_range: crate::domain::NumberRange::new(7000, 7001),
            ..Default::default()
        };
        let controller = Controller::open(config, db).unwrap();
        let ctx = controller.system_context().clone();
        let result = controller.run_in_scope(|tx| {
            for name in ["r1", "r2", "r3"] {
                controller.create_resource_definition(&ctx, tx, rsc_name(name), None, "s".into(), TransportType::Ip)?;
            }
            Ok(())
        });
        assert_matches!(result, Err(Error::PoolExhausted { min: 7000, max: 7001 }));
        assert_eq!(controller.objects().resource_definition_count(), 0);
    }

    #[test]
    fn test_reopen_restores_graph() {
        let (db, controller, ctx) = setup();
        let uuid = controller
            .run_in_scope(|tx| {
                let node = controller.create_node(&ctx, tx, node_name("n1"), NodeType::Combined)?;
                controller.create_stor_pool(&ctx, tx, &node, StorPoolName::new("DfltStorPool")?, DeviceProviderKind::Lvm)?;
                let rsc_dfn =
                    controller.create_resource_definition(&ctx, tx, rsc_name("r1"), None, "s".into(), TransportType::Ip)?;
                controller.create_volume_definition(&ctx, tx, &rsc_dfn, None, None, 8192)?;
                controller.create_resource(&ctx, tx, &node, &rsc_dfn, None, ResourceFlags::empty())?;
                node.uuid()
            })
            .unwrap();
        let before = controller.topology(&ctx).unwrap();

        let reopened = Controller::open(ControllerConfig::default(), db).unwrap();
        let after = reopened.topology(&ctx).unwrap();
        assert_eq!(after, before);
        assert_eq!(after.nodes[0].uuid, uuid);
        assert_eq!(reopened.metrics().entities_loaded.get(), 7);

        let node = reopened.objects().node(&ctx, &node_name("N1")).unwrap().unwrap();
        assert_eq!(node.node_type(&ctx).unwrap(), NodeType::Combined);
        assert_eq!(reopened.reload().unwrap().total(), 0);
    }

    #[test]
    fn test_unprivileged_context_sees_nothing() {
        let (_db, controller, ctx) = setup();
        controller
            .run_in_scope(|tx| controller.create_node(&ctx, tx, node_name("n1"), NodeType::Satellite))
            .unwrap();

        let public = AccessContext::public();
        assert_matches!(controller.topology(&public), Err(Error::AccessDenied { .. }));
        assert_matches!(
            controller.run_in_scope(|tx| controller.create_node(&public, tx, node_name("n2"), NodeType::Satellite)),
            Err(Error::AccessDenied { .. })
        );
    }
}
