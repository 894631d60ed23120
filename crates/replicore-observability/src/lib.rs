//! Replicore Observability
//!
//! Metrics for the ingestion core.
//!
//! # Features
//!
//! - Lock-free sensors (`Count`, `Max`, `Avg`) and windowed `Rate`s
//! - Versioned `(store, version)` / store-total stats with sentinel defaults
//! - Ingestion stats: consumption rates, lag families, readiness readings
//! - Prometheus export of host-level metrics and every versioned reporter
//! - Health, readiness and metrics endpoints
//!
//! # Usage
//!
//! ```no_run
//! use replicore_observability::{exporter, metrics, IngestionStatsAggregator};
//!
//! metrics::init();
//!
//! let stats = IngestionStatsAggregator::new("dc0");
//! if let Ok(collector) = stats.collector() {
//!     let _ = metrics::REGISTRY.register(Box::new(collector));
//! }
//!
//! let metrics_router = exporter::create_metrics_router();
//! ```

pub mod exporter;
pub mod ingestion_stats;
pub mod metrics;
pub mod sensor;
pub mod versioned;

pub use exporter::{MetricsServer, ReadinessCheck};
pub use ingestion_stats::{
    names, region_metric_prefix, IngestionStats, IngestionStatsAggregator, PartitionReport,
    ReplicaProfile, StatsErrorCode,
};
pub use metrics::{init as init_metrics, REGISTRY};
pub use versioned::{StatsReporter, StatsScope, VersionedStats, VersionedStatsCollector};

/// Initialize all observability components
pub fn init() {
    metrics::init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_double_init_is_safe() {
        init();
        init();
        let _registry = &*REGISTRY;
    }

    #[test]
    fn test_collector_registers_into_global_registry() {
        init();
        let stats = IngestionStatsAggregator::new("dc0");
        stats.register_replica("lib_test_store", 1, &ReplicaProfile::default());
        REGISTRY
            .register(Box::new(stats.collector().unwrap()))
            .unwrap();

        let families = REGISTRY.gather();
        let family = families
            .iter()
            .find(|f| f.get_name() == "replicore_ingestion_stats")
            .unwrap();
        assert!(family.get_metric().iter().any(|m| m
            .get_label()
            .iter()
            .any(|l| l.get_value() == "lib_test_store")));
    }
}
