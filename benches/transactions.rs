//! Benchmarks for transaction scopes and graph loading
//!
//! Target: 10K committed scopes/sec on the in-memory database

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use std::sync::Arc;
use storage_topology_controller::domain::{NodeName, NodeType, ResourceName, TransportType};
use storage_topology_controller::objects::ResourceFlags;
use storage_topology_controller::persistence::Database;
use storage_topology_controller::{Controller, ControllerConfig, MemoryDatabase};

fn bench_commit_scopes(c: &mut Criterion) {
    let mut group = c.benchmark_group("transactions");
    group.throughput(Throughput::Elements(1));

    group.bench_function("commit_node", |b| {
        let controller = Controller::open(ControllerConfig::default(), MemoryDatabase::in_memory()).unwrap();
        let ctx = controller.system_context().clone();
        let mut counter = 0u64;

        b.iter(|| {
            counter += 1;
            let name = NodeName::new(format!("node-{}", counter)).unwrap();
            controller
                .run_in_scope(|tx| controller.create_node(&ctx, tx, black_box(name), NodeType::Satellite))
                .unwrap();
        });
    });

    group.bench_function("rollback_resource_definition", |b| {
        let controller = Controller::open(ControllerConfig::default(), MemoryDatabase::in_memory()).unwrap();
        let ctx = controller.system_context().clone();

        b.iter(|| {
            let tx = controller.transaction();
            let name = ResourceName::new("bench-rsc").unwrap();
            controller
                .create_resource_definition(&ctx, &tx, black_box(name), None, String::new(), TransportType::Ip)
                .unwrap();
            tx.rollback();
        });
    });

    group.finish();
}

/// Database with `nodes` nodes, each carrying every one of `resources`
/// diskless resources
fn populated_database(nodes: usize, resources: usize) -> Arc<dyn Database> {
    let db: Arc<dyn Database> = MemoryDatabase::in_memory();
    let controller = Controller::open(ControllerConfig::default(), db.clone()).unwrap();
    let ctx = controller.system_context().clone();

    controller
        .run_in_scope(|tx| {
            let nodes = (0..nodes)
                .map(|i| controller.create_node(&ctx, tx, NodeName::new(format!("node-{:03}", i))?, NodeType::Satellite))
                .collect::<storage_topology_controller::Result<Vec<_>>>()?;
            for i in 0..resources {
                let rsc_dfn = controller.create_resource_definition(
                    &ctx,
                    tx,
                    ResourceName::new(format!("rsc-{:03}", i))?,
                    None,
                    String::new(),
                    TransportType::Ip,
                )?;
                for node in &nodes {
                    controller.create_resource(&ctx, tx, node, &rsc_dfn, None, ResourceFlags::DISKLESS)?;
                }
            }
            Ok(())
        })
        .unwrap();
    db
}

fn bench_load_graph(c: &mut Criterion) {
    let mut group = c.benchmark_group("loader");

    for (nodes, resources) in [(3usize, 10usize), (16, 32)] {
        let db = populated_database(nodes, resources);
        group.throughput(Throughput::Elements((nodes * resources) as u64));

        group.bench_function(format!("load_{}x{}", nodes, resources), |b| {
            b.iter_batched(
                || db.clone(),
                |db| {
                    let controller = Controller::open(ControllerConfig::default(), db).unwrap();
                    black_box(controller.objects().node_count())
                },
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

criterion_group!(benches, bench_commit_scopes, bench_load_graph);
criterion_main!(benches);
