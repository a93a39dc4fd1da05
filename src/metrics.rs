//! Controller Metrics
//!
//! Prometheus counters and gauges of one controller instance. Each
//! [`ControllerMetrics`] owns its registry, so several controllers (or
//! tests) in one process never collide on metric names.

use crate::error::Result;
use crate::persistence::LoadSummary;
use crate::transaction::CommitStats;
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

const PREFIX: &str = "topology_controller";

/// Metrics of one controller instance
#[derive(Clone)]
pub struct ControllerMetrics {
    registry: Registry,
    pub transactions_committed: IntCounter,
    pub transactions_rolled_back: IntCounter,
    pub objects_flushed: IntCounter,
    pub entities_loaded: IntCounter,
    pub nodes: IntGauge,
    pub resource_definitions: IntGauge,
    pub stor_pool_definitions: IntGauge,
}

impl ControllerMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new_custom(Some(PREFIX.to_string()), None)?;

        let transactions_committed = IntCounter::new(
            "transactions_committed_total",
            "Transaction scopes committed successfully",
        )?;
        let transactions_rolled_back = IntCounter::new(
            "transactions_rolled_back_total",
            "Transaction scopes rolled back",
        )?;
        let objects_flushed = IntCounter::new(
            "objects_flushed_total",
            "Transactional objects flushed by commits",
        )?;
        let entities_loaded = IntCounter::new(
            "entities_loaded_total",
            "Entities restored from the database",
        )?;
        let nodes = IntGauge::new("nodes", "Registered nodes")?;
        let resource_definitions = IntGauge::new("resource_definitions", "Registered resource definitions")?;
        let stor_pool_definitions = IntGauge::new(
            "stor_pool_definitions",
            "Registered storage pool definitions",
        )?;

        registry.register(Box::new(transactions_committed.clone()))?;
        registry.register(Box::new(transactions_rolled_back.clone()))?;
        registry.register(Box::new(objects_flushed.clone()))?;
        registry.register(Box::new(entities_loaded.clone()))?;
        registry.register(Box::new(nodes.clone()))?;
        registry.register(Box::new(resource_definitions.clone()))?;
        registry.register(Box::new(stor_pool_definitions.clone()))?;

        Ok(Self {
            registry,
            transactions_committed,
            transactions_rolled_back,
            objects_flushed,
            entities_loaded,
            nodes,
            resource_definitions,
            stor_pool_definitions,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_commit(&self, stats: CommitStats) {
        self.transactions_committed.inc();
        self.objects_flushed.inc_by(stats.objects as u64);
    }

    pub fn record_rollback(&self) {
        self.transactions_rolled_back.inc();
    }

    pub fn record_load(&self, summary: &LoadSummary) {
        self.entities_loaded.inc_by(summary.total() as u64);
    }

    /// Updates the top-level entity gauges
    pub fn set_counts(&self, nodes: usize, resource_definitions: usize, stor_pool_definitions: usize) {
        self.nodes.set(nodes as i64);
        self.resource_definitions.set(resource_definitions as i64);
        self.stor_pool_definitions.set(stor_pool_definitions as i64);
    }

    /// Renders the registry in the text exposition format
    pub fn encode(&self) -> Result<(String, Vec<u8>)> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok((encoder.format_type().to_string(), buffer))
    }
}

impl std::fmt::Debug for ControllerMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerMetrics")
            .field("transactions_committed", &self.transactions_committed.get())
            .field("transactions_rolled_back", &self.transactions_rolled_back.get())
            .field("nodes", &self.nodes.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_encoding() {
        let metrics = ControllerMetrics::new().unwrap();
        metrics.record_commit(CommitStats { objects: 3, writes: 5 });
        metrics.record_rollback();
        metrics.set_counts(2, 1, 0);

        assert_eq!(metrics.transactions_committed.get(), 1);
        assert_eq!(metrics.objects_flushed.get(), 3);
        assert_eq!(metrics.transactions_rolled_back.get(), 1);

        let (content_type, body) = metrics.encode().unwrap();
        let text = String::from_utf8(body).unwrap();
        assert!(content_type.starts_with("text/plain"));
        assert!(text.contains("topology_controller_transactions_committed_total 1"));
        assert!(text.contains("topology_controller_nodes 2"));
    }

    #[test]
    fn test_registries_are_independent() {
        let first = ControllerMetrics::new().unwrap();
        let second = ControllerMetrics::new().unwrap();
        first.record_rollback();
        assert_eq!(second.transactions_rolled_back.get(), 0);
    }
}
