use lazy_static::lazy_static;
use prometheus::{
    HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
};
use std::sync::Once;

static INIT: Once = Once::new();

lazy_static! {
    /// Global Prometheus metrics registry
    pub static ref REGISTRY: Registry = Registry::new();

    // ============================================================================
    // Replica Lifecycle Metrics
    // ============================================================================

    /// Partition replicas with a running consumption task
    pub static ref REPLICAS_ACTIVE: IntGauge = IntGauge::new(
        "replicore_replicas_active",
        "Number of partition replicas with a running consumption task"
    ).expect("metric can be created");

    /// Replicas per lifecycle state
    pub static ref REPLICA_STATES: IntGaugeVec = IntGaugeVec::new(
        Opts::new("replicore_replica_states", "Partition replicas by lifecycle state"),
        &["state"]
    ).expect("metric can be created");

    /// Lifecycle transitions
    pub static ref STATE_TRANSITIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("replicore_state_transitions_total", "Total replica state transitions"),
        &["from", "to"]
    ).expect("metric can be created");

    /// Leader/standby flips applied at a safe point
    pub static ref ROLE_TRANSITIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("replicore_role_transitions_total", "Total replica role transitions"),
        &["to"]
    ).expect("metric can be created");

    // ============================================================================
    // Consumption Metrics
    // ============================================================================

    /// Ingestion errors by kind and phase (before/after end of push)
    pub static ref INGESTION_ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("replicore_ingestion_errors_total", "Total ingestion errors"),
        &["kind", "phase"]
    ).expect("metric can be created");

    /// Retries of source operations (subscribe, poll, end offset)
    pub static ref SOURCE_RETRIES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("replicore_source_retries_total", "Total retried source operations"),
        &["operation"]
    ).expect("metric can be created");

    /// Records per poll
    pub static ref POLL_BATCH_SIZE: HistogramVec = HistogramVec::new(
        HistogramOpts::new("replicore_poll_batch_size", "Records returned per poll")
            .buckets(vec![0.0, 1.0, 10.0, 50.0, 100.0, 500.0, 1000.0, 5000.0]),
        &["role"]
    ).expect("metric can be created");

    // ============================================================================
    // Write-Compute Metrics
    // ============================================================================

    /// Partial updates merged, by outcome
    pub static ref MERGES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("replicore_write_compute_merges_total", "Total write-compute merges"),
        &["outcome"]
    ).expect("metric can be created");

    /// Merge latency
    pub static ref MERGE_LATENCY: HistogramVec = HistogramVec::new(
        HistogramOpts::new("replicore_write_compute_merge_latency_seconds", "Write-compute merge latency in seconds")
            .buckets(vec![0.00001, 0.00005, 0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05]),
        &["store"]
    ).expect("metric can be created");
}

/// Initialize metrics registry
/// Can be called multiple times safely (idempotent)
pub fn init() {
    INIT.call_once(|| {
        REGISTRY
            .register(Box::new(REPLICAS_ACTIVE.clone()))
            .expect("replicas_active can be registered");
        REGISTRY
            .register(Box::new(REPLICA_STATES.clone()))
            .expect("replica_states can be registered");
        REGISTRY
            .register(Box::new(STATE_TRANSITIONS_TOTAL.clone()))
            .expect("state_transitions_total can be registered");
        REGISTRY
            .register(Box::new(ROLE_TRANSITIONS_TOTAL.clone()))
            .expect("role_transitions_total can be registered");

        REGISTRY
            .register(Box::new(INGESTION_ERRORS_TOTAL.clone()))
            .expect("ingestion_errors_total can be registered");
        REGISTRY
            .register(Box::new(SOURCE_RETRIES_TOTAL.clone()))
            .expect("source_retries_total can be registered");
        REGISTRY
            .register(Box::new(POLL_BATCH_SIZE.clone()))
            .expect("poll_batch_size can be registered");

        REGISTRY
            .register(Box::new(MERGES_TOTAL.clone()))
            .expect("merges_total can be registered");
        REGISTRY
            .register(Box::new(MERGE_LATENCY.clone()))
            .expect("merge_latency can be registered");
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registration() {
        init();
        init();
        assert!(!REGISTRY.gather().is_empty());
    }

    #[test]
    fn test_state_transition_counter() {
        STATE_TRANSITIONS_TOTAL
            .with_label_values(&["BOOTSTRAPPING", "ONLINE"])
            .inc();

        assert_eq!(
            STATE_TRANSITIONS_TOTAL
                .with_label_values(&["BOOTSTRAPPING", "ONLINE"])
                .get(),
            1
        );
    }

    #[test]
    fn test_ingestion_errors_by_phase() {
        INGESTION_ERRORS_TOTAL
            .with_label_values(&["storage", "before_end_of_push"])
            .inc_by(3);

        assert_eq!(
            INGESTION_ERRORS_TOTAL
                .with_label_values(&["storage", "before_end_of_push"])
                .get(),
            3
        );
    }
}
