//! Versioned Ingestion Stats
//!
//! Per-store-version ingestion metrics built on the [`VersionedStats`] registry.
//!
//! ## Recording
//!
//! Consumption loops call the `record_*` methods of [`IngestionStatsAggregator`].
//! Each call updates the version payload *and* the store-total payload, and is a
//! no-op for whichever side does not exist yet. Lag state is pushed as whole
//! per-partition [`PartitionReport`]s rather than deltas, so nothing is ever
//! summed twice.
//!
//! ## Sensors
//!
//! | group          | registered when                         | examples                                   |
//! |----------------|-----------------------------------------|--------------------------------------------|
//! | unconditional  | reporter creation                       | `records_consumed`, `leader_offset_lag`    |
//! | hybrid         | first hybrid replica of the version     | `rt_topic_offset_lag`                      |
//! | region         | first active-active replica, per region | `dc0_from_dc1_rt_lag`                      |
//!
//! ## Sentinels
//!
//! Lag families are summed across hosts, so they read `0` when no replica is
//! present. Readiness-style readings (`rt_topic_offset_lag`,
//! `number_of_partitions_not_receive_SOBR`, `write_compute_operation_failure`,
//! `leader_stalled_hybrid_ingestion`) read
//! [`StatsErrorCode::InactiveStoreIngestionTask`] instead, so "no data" can be
//! told apart from "zero lag".

use crate::sensor::{Count, LatencySensor, Rate};
use crate::versioned::{
    SensorSet, StatsReporter, StatsScope, VersionedStats, VersionedStatsCollector,
};
use dashmap::DashMap;
use replicore_core::{parse_topic, LagSnapshot, RegionId, TopicKind};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Sentinel values reported in place of a reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsErrorCode {
    /// No payload exists for the scope being scraped
    NullIngestionStats,
    /// A payload exists but no replica of the version is active on this host
    InactiveStoreIngestionTask,
    /// The reading only makes sense for hybrid versions
    MetricOnlyAvailableForHybridStores,
}

impl StatsErrorCode {
    pub const fn code(self) -> i64 {
        match self {
            StatsErrorCode::NullIngestionStats => -1,
            StatsErrorCode::InactiveStoreIngestionTask => -2,
            StatsErrorCode::MetricOnlyAvailableForHybridStores => -3,
        }
    }

    pub const fn value(self) -> f64 {
        self.code() as f64
    }
}

pub mod names {
    pub const RECORDS_CONSUMED: &str = "records_consumed";
    pub const BYTES_CONSUMED: &str = "bytes_consumed";
    pub const LEADER_RECORDS_CONSUMED: &str = "leader_records_consumed";
    pub const LEADER_BYTES_CONSUMED: &str = "leader_bytes_consumed";
    pub const FOLLOWER_RECORDS_CONSUMED: &str = "follower_records_consumed";
    pub const FOLLOWER_BYTES_CONSUMED: &str = "follower_bytes_consumed";
    pub const LEADER_RECORDS_PRODUCED: &str = "leader_records_produced";
    pub const LEADER_BYTES_PRODUCED: &str = "leader_bytes_produced";
    pub const STALE_PARTITIONS_WITHOUT_INGESTION_TASK: &str =
        "stale_partitions_without_ingestion_task";
    pub const SUBSCRIBE_ACTION_PREP_LATENCY: &str = "subscribe_action_prep_latency";
    pub const SUBSCRIBE_ACTION_GET_CONSUMER_LATENCY: &str = "subscribe_action_get_consumer_latency";
    pub const SUBSCRIBE_ACTION_CONSUMER_SUBSCRIBE_LATENCY: &str =
        "subscribe_action_consumer_subscribe_latency";

    pub const INGESTION_TASK_ERRORED_GAUGE: &str = "ingestion_task_errored_gauge";
    pub const INGESTION_TASK_PUSH_TIMEOUT_GAUGE: &str = "ingestion_task_push_timeout_gauge";
    pub const WRITE_COMPUTE_OPERATION_FAILURE: &str = "write_compute_operation_failure";

    pub const BATCH_REPLICATION_LAG: &str = "batch_replication_lag";
    pub const LEADER_OFFSET_LAG: &str = "leader_offset_lag";
    pub const BATCH_LEADER_OFFSET_LAG: &str = "batch_leader_offset_lag";
    pub const HYBRID_LEADER_OFFSET_LAG: &str = "hybrid_leader_offset_lag";
    pub const FOLLOWER_OFFSET_LAG: &str = "follower_offset_lag";
    pub const BATCH_FOLLOWER_OFFSET_LAG: &str = "batch_follower_offset_lag";
    pub const HYBRID_FOLLOWER_OFFSET_LAG: &str = "hybrid_follower_offset_lag";

    pub const RT_TOPIC_OFFSET_LAG: &str = "rt_topic_offset_lag";
    pub const RT_TOPIC_OFFSET_LAG_OVER_THRESHOLD: &str = "rt_topic_offset_lag_over_threshold";
    pub const NUMBER_OF_PARTITIONS_NOT_RECEIVE_SOBR: &str = "number_of_partitions_not_receive_SOBR";
    pub const LEADER_STALLED_HYBRID_INGESTION: &str = "leader_stalled_hybrid_ingestion";

    pub const AVG: &str = "_avg";
    pub const MAX: &str = "_max";

    pub const REGION_RT_LAG: &str = "_rt_lag";
    pub const REGION_RT_BYTES_CONSUMED: &str = "_rt_bytes_consumed";
    pub const REGION_RT_RECORDS_CONSUMED: &str = "_rt_records_consumed";
}

const HYBRID_GROUP: &str = "hybrid";

/// Metric name prefix of a remote region as seen from the local one.
pub fn region_metric_prefix(local_region: &str, remote_alias: &str) -> String {
    format!("{}_from_{}", local_region, remote_alias)
}

/// What the stats layer needs to know about a replica's store version.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicaProfile {
    pub hybrid: bool,
    pub active_active: bool,
    /// Remote regions and their aliases
    pub regions: BTreeMap<RegionId, String>,
}

/// Latest lag state of one partition replica.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionReport {
    pub lag: LagSnapshot,
    /// `0` when the last merge succeeded
    pub write_compute_error_code: i64,
}

#[derive(Debug, Default)]
struct RegionRates {
    bytes: Rate,
    records: Rate,
}

/// Stats payload of one scope (a store version or a store total).
#[derive(Debug)]
pub struct IngestionStats {
    records_consumed: Rate,
    bytes_consumed: Rate,
    leader_records_consumed: Rate,
    leader_bytes_consumed: Rate,
    follower_records_consumed: Rate,
    follower_bytes_consumed: Rate,
    leader_records_produced: Rate,
    leader_bytes_produced: Rate,
    regions: DashMap<RegionId, RegionRates>,

    stale_partitions: Count,
    subscribe_prep_latency: LatencySensor,
    subscribe_get_consumer_latency: LatencySensor,
    subscribe_consumer_subscribe_latency: LatencySensor,

    errored: AtomicI64,
    push_timeout: AtomicI64,

    /// Keyed by `(version, partition)` so a store total can hold every version
    partitions: Mutex<BTreeMap<(u32, u32), PartitionReport>>,
}

impl IngestionStats {
    /// Region rates are created for every configured region up front.
    pub fn new(profile: &ReplicaProfile) -> Self {
        let stats = Self {
            records_consumed: Rate::new(),
            bytes_consumed: Rate::new(),
            leader_records_consumed: Rate::new(),
            leader_bytes_consumed: Rate::new(),
            follower_records_consumed: Rate::new(),
            follower_bytes_consumed: Rate::new(),
            leader_records_produced: Rate::new(),
            leader_bytes_produced: Rate::new(),
            regions: DashMap::new(),
            stale_partitions: Count::new(),
            subscribe_prep_latency: LatencySensor::new(),
            subscribe_get_consumer_latency: LatencySensor::new(),
            subscribe_consumer_subscribe_latency: LatencySensor::new(),
            errored: AtomicI64::new(0),
            push_timeout: AtomicI64::new(0),
            partitions: Mutex::new(BTreeMap::new()),
        };
        stats.ensure_regions(profile);
        stats
    }

    fn ensure_regions(&self, profile: &ReplicaProfile) {
        if !profile.active_active {
            return;
        }
        for region in profile.regions.keys() {
            self.regions.entry(*region).or_default();
        }
    }

    fn partitions(&self) -> std::sync::MutexGuard<'_, BTreeMap<(u32, u32), PartitionReport>> {
        self.partitions.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn report_partition(&self, version: u32, partition: u32, report: PartitionReport) {
        self.partitions().insert((version, partition), report);
    }

    fn remove_partition(&self, version: u32, partition: u32) {
        self.partitions().remove(&(version, partition));
    }

    fn has_active_partitions(&self) -> bool {
        !self.partitions().is_empty()
    }

    fn sum_lag(&self, f: impl Fn(&LagSnapshot) -> u64) -> f64 {
        self.partitions().values().map(|r| f(&r.lag)).sum::<u64>() as f64
    }

    // ---- lag families (aggregated across hosts, 0 when inactive) ----

    pub fn batch_replication_lag(&self) -> f64 {
        self.sum_lag(LagSnapshot::batch_replication_lag)
    }

    pub fn leader_offset_lag(&self) -> f64 {
        self.sum_lag(LagSnapshot::leader_lag)
    }

    pub fn batch_leader_offset_lag(&self) -> f64 {
        self.sum_lag(|lag| lag.leader_batch_lag)
    }

    pub fn hybrid_leader_offset_lag(&self) -> f64 {
        self.sum_lag(|lag| lag.leader_hybrid_lag)
    }

    pub fn follower_offset_lag(&self) -> f64 {
        self.sum_lag(LagSnapshot::follower_lag)
    }

    pub fn batch_follower_offset_lag(&self) -> f64 {
        self.sum_lag(|lag| lag.follower_batch_lag)
    }

    pub fn hybrid_follower_offset_lag(&self) -> f64 {
        self.sum_lag(|lag| lag.follower_hybrid_lag)
    }

    pub fn region_offset_lag(&self, region: RegionId) -> f64 {
        self.sum_lag(|lag| lag.region_lags.get(&region).copied().unwrap_or(0))
    }

    // ---- readiness readings (inactive sentinel when no replica) ----

    pub fn rt_topic_offset_lag(&self) -> f64 {
        let partitions = self.partitions();
        if partitions.is_empty() {
            return StatsErrorCode::InactiveStoreIngestionTask.value();
        }
        let mut hybrid = partitions.values().filter(|r| r.lag.hybrid).peekable();
        if hybrid.peek().is_none() {
            return StatsErrorCode::MetricOnlyAvailableForHybridStores.value();
        }
        hybrid.map(|r| r.lag.real_time_lag.unwrap_or(0)).sum::<u64>() as f64
    }

    /// `max(0, rt_topic_offset_lag - offset_lag_threshold)`.
    pub fn rt_topic_offset_lag_over_threshold(&self) -> f64 {
        let partitions = self.partitions();
        let hybrid: Vec<_> = partitions.values().filter(|r| r.lag.hybrid).collect();
        if partitions.is_empty() {
            return 0.0;
        }
        if hybrid.is_empty() {
            return StatsErrorCode::MetricOnlyAvailableForHybridStores.value();
        }
        let lag: u64 = hybrid.iter().map(|r| r.lag.real_time_lag.unwrap_or(0)).sum();
        let threshold = hybrid
            .iter()
            .map(|r| r.lag.offset_lag_threshold)
            .max()
            .unwrap_or(0);
        replicore_core::over_threshold(lag, threshold) as f64
    }

    pub fn number_of_partitions_not_receive_sobr(&self) -> f64 {
        let partitions = self.partitions();
        if partitions.is_empty() {
            return StatsErrorCode::InactiveStoreIngestionTask.value();
        }
        partitions
            .values()
            .filter(|r| r.lag.hybrid && !r.lag.start_of_buffer_replay_received)
            .count() as f64
    }

    pub fn write_compute_error_code(&self) -> f64 {
        let partitions = self.partitions();
        if partitions.is_empty() {
            return StatsErrorCode::InactiveStoreIngestionTask.value();
        }
        partitions
            .values()
            .map(|r| r.write_compute_error_code)
            .max()
            .unwrap_or(0) as f64
    }

    /// `1` when the leader lags but no bytes are being consumed.
    pub fn leader_stalled_hybrid_ingestion(&self) -> f64 {
        if !self.has_active_partitions() {
            return StatsErrorCode::InactiveStoreIngestionTask.value();
        }
        if self.leader_offset_lag() > 0.0 && self.leader_bytes_consumed.measure() == 0.0 {
            1.0
        } else {
            0.0
        }
    }

    // ---- gauges ----

    pub fn errored_gauge(&self) -> f64 {
        self.errored.load(Ordering::Acquire) as f64
    }

    pub fn push_timeout_gauge(&self) -> f64 {
        self.push_timeout.load(Ordering::Acquire) as f64
    }

    // ---- recording ----

    pub fn record_records_consumed(&self, count: u64) {
        self.records_consumed.record(count as f64);
    }

    pub fn record_bytes_consumed(&self, bytes: u64) {
        self.bytes_consumed.record(bytes as f64);
    }

    pub fn record_leader_records_consumed(&self, count: u64) {
        self.leader_records_consumed.record(count as f64);
    }

    pub fn record_leader_bytes_consumed(&self, bytes: u64) {
        self.leader_bytes_consumed.record(bytes as f64);
    }

    pub fn record_follower_records_consumed(&self, count: u64) {
        self.follower_records_consumed.record(count as f64);
    }

    pub fn record_follower_bytes_consumed(&self, bytes: u64) {
        self.follower_bytes_consumed.record(bytes as f64);
    }

    pub fn record_leader_records_produced(&self, count: u64) {
        self.leader_records_produced.record(count as f64);
    }

    pub fn record_leader_bytes_produced(&self, bytes: u64) {
        self.leader_bytes_produced.record(bytes as f64);
    }

    /// Recording for a region that was never configured is dropped.
    pub fn record_region_bytes_consumed(&self, region: RegionId, bytes: u64) {
        if let Some(rates) = self.regions.get(&region) {
            rates.bytes.record(bytes as f64);
        }
    }

    pub fn record_region_records_consumed(&self, region: RegionId, count: u64) {
        if let Some(rates) = self.regions.get(&region) {
            rates.records.record(count as f64);
        }
    }

    pub fn record_stale_partition(&self) {
        self.stale_partitions.record();
    }

    pub fn record_subscribe_prep_latency(&self, millis: f64) {
        self.subscribe_prep_latency.record(millis);
    }

    pub fn record_subscribe_get_consumer_latency(&self, millis: f64) {
        self.subscribe_get_consumer_latency.record(millis);
    }

    pub fn record_subscribe_consumer_subscribe_latency(&self, millis: f64) {
        self.subscribe_consumer_subscribe_latency.record(millis);
    }

    pub fn region_bytes_consumed(&self, region: RegionId) -> f64 {
        self.regions
            .get(&region)
            .map(|rates| rates.bytes.measure())
            .unwrap_or(0.0)
    }

    pub fn region_records_consumed(&self, region: RegionId) -> f64 {
        self.regions
            .get(&region)
            .map(|rates| rates.records.measure())
            .unwrap_or(0.0)
    }

    pub fn has_region(&self, region: RegionId) -> bool {
        self.regions.contains_key(&region)
    }

    pub fn stale_partitions(&self) -> f64 {
        self.stale_partitions.measure()
    }
}

fn register_unconditional(reporter: &StatsReporter<IngestionStats>) {
    use names::*;

    let null = StatsErrorCode::NullIngestionStats.value();

    reporter.register_sensor(INGESTION_TASK_ERRORED_GAUGE, null, IngestionStats::errored_gauge);
    reporter.register_sensor(
        INGESTION_TASK_PUSH_TIMEOUT_GAUGE,
        null,
        IngestionStats::push_timeout_gauge,
    );
    reporter.register_sensor(
        WRITE_COMPUTE_OPERATION_FAILURE,
        null,
        IngestionStats::write_compute_error_code,
    );

    reporter.register_sensor(BATCH_REPLICATION_LAG, 0.0, IngestionStats::batch_replication_lag);
    reporter.register_sensor(LEADER_OFFSET_LAG, 0.0, IngestionStats::leader_offset_lag);
    reporter.register_sensor(BATCH_LEADER_OFFSET_LAG, 0.0, IngestionStats::batch_leader_offset_lag);
    reporter.register_sensor(HYBRID_LEADER_OFFSET_LAG, 0.0, IngestionStats::hybrid_leader_offset_lag);
    reporter.register_sensor(FOLLOWER_OFFSET_LAG, 0.0, IngestionStats::follower_offset_lag);
    reporter.register_sensor(
        BATCH_FOLLOWER_OFFSET_LAG,
        0.0,
        IngestionStats::batch_follower_offset_lag,
    );
    reporter.register_sensor(
        HYBRID_FOLLOWER_OFFSET_LAG,
        0.0,
        IngestionStats::hybrid_follower_offset_lag,
    );

    reporter.register_sensor(RECORDS_CONSUMED, 0.0, |s: &IngestionStats| {
        s.records_consumed.measure()
    });
    reporter.register_sensor(BYTES_CONSUMED, 0.0, |s: &IngestionStats| {
        s.bytes_consumed.measure()
    });
    reporter.register_sensor(LEADER_RECORDS_CONSUMED, 0.0, |s: &IngestionStats| {
        s.leader_records_consumed.measure()
    });
    reporter.register_sensor(LEADER_BYTES_CONSUMED, 0.0, |s: &IngestionStats| {
        s.leader_bytes_consumed.measure()
    });
    reporter.register_sensor(FOLLOWER_RECORDS_CONSUMED, 0.0, |s: &IngestionStats| {
        s.follower_records_consumed.measure()
    });
    reporter.register_sensor(FOLLOWER_BYTES_CONSUMED, 0.0, |s: &IngestionStats| {
        s.follower_bytes_consumed.measure()
    });
    reporter.register_sensor(LEADER_RECORDS_PRODUCED, 0.0, |s: &IngestionStats| {
        s.leader_records_produced.measure()
    });
    reporter.register_sensor(LEADER_BYTES_PRODUCED, 0.0, |s: &IngestionStats| {
        s.leader_bytes_produced.measure()
    });
    reporter.register_sensor(
        STALE_PARTITIONS_WITHOUT_INGESTION_TASK,
        0.0,
        IngestionStats::stale_partitions,
    );

    reporter.register_sensor(
        format!("{}{}", SUBSCRIBE_ACTION_PREP_LATENCY, AVG),
        0.0,
        |s: &IngestionStats| s.subscribe_prep_latency.avg(),
    );
    reporter.register_sensor(
        format!("{}{}", SUBSCRIBE_ACTION_PREP_LATENCY, MAX),
        0.0,
        |s: &IngestionStats| s.subscribe_prep_latency.max(),
    );
    reporter.register_sensor(
        format!("{}{}", SUBSCRIBE_ACTION_GET_CONSUMER_LATENCY, AVG),
        0.0,
        |s: &IngestionStats| s.subscribe_get_consumer_latency.avg(),
    );
    reporter.register_sensor(
        format!("{}{}", SUBSCRIBE_ACTION_GET_CONSUMER_LATENCY, MAX),
        0.0,
        |s: &IngestionStats| s.subscribe_get_consumer_latency.max(),
    );
    reporter.register_sensor(
        format!("{}{}", SUBSCRIBE_ACTION_CONSUMER_SUBSCRIBE_LATENCY, AVG),
        0.0,
        |s: &IngestionStats| s.subscribe_consumer_subscribe_latency.avg(),
    );
    reporter.register_sensor(
        format!("{}{}", SUBSCRIBE_ACTION_CONSUMER_SUBSCRIBE_LATENCY, MAX),
        0.0,
        |s: &IngestionStats| s.subscribe_consumer_subscribe_latency.max(),
    );
}

fn register_hybrid(reporter: &StatsReporter<IngestionStats>) {
    use names::*;

    reporter.register_sensor(RT_TOPIC_OFFSET_LAG, 0.0, IngestionStats::rt_topic_offset_lag);
    reporter.register_sensor(
        RT_TOPIC_OFFSET_LAG_OVER_THRESHOLD,
        0.0,
        IngestionStats::rt_topic_offset_lag_over_threshold,
    );
    reporter.register_sensor(
        NUMBER_OF_PARTITIONS_NOT_RECEIVE_SOBR,
        0.0,
        IngestionStats::number_of_partitions_not_receive_sobr,
    );
    reporter.register_sensor(
        LEADER_STALLED_HYBRID_INGESTION,
        0.0,
        IngestionStats::leader_stalled_hybrid_ingestion,
    );
}

fn register_region(reporter: &StatsReporter<IngestionStats>, prefix: &str, region: RegionId) {
    use names::*;

    reporter.register_sensor(
        format!("{}{}", prefix, REGION_RT_LAG),
        0.0,
        move |s: &IngestionStats| s.region_offset_lag(region),
    );
    reporter.register_sensor(
        format!("{}{}", prefix, REGION_RT_BYTES_CONSUMED),
        0.0,
        move |s: &IngestionStats| s.region_bytes_consumed(region),
    );
    reporter.register_sensor(
        format!("{}{}", prefix, REGION_RT_RECORDS_CONSUMED),
        0.0,
        move |s: &IngestionStats| s.region_records_consumed(region),
    );
}

/// Host-wide entry point for ingestion stats.
pub struct IngestionStatsAggregator {
    local_region: String,
    stats: Arc<VersionedStats<IngestionStats, ReplicaProfile>>,
}

impl IngestionStatsAggregator {
    pub fn new(local_region: impl Into<String>) -> Self {
        let sensors: SensorSet<IngestionStats> = Arc::new(register_unconditional);
        Self {
            local_region: local_region.into(),
            stats: Arc::new(VersionedStats::new(IngestionStats::new, sensors)),
        }
    }

    pub fn local_region(&self) -> &str {
        &self.local_region
    }

    pub fn registry(&self) -> Arc<VersionedStats<IngestionStats, ReplicaProfile>> {
        Arc::clone(&self.stats)
    }

    /// Prometheus collector exporting every reporter of this aggregator.
    pub fn collector(&self) -> prometheus::Result<VersionedStatsCollector> {
        VersionedStatsCollector::new(
            "replicore_ingestion_stats",
            "Versioned ingestion stats by store, version and sensor",
            self.stats.clone(),
        )
    }

    /// Create the payloads of a store version and register its conditional
    /// sensors. Called when a replica of the version starts on this host.
    pub fn register_replica(&self, store: &str, version: u32, profile: &ReplicaProfile) {
        let (version_stats, total_stats) = self.stats.get_or_create(store, version, profile);
        version_stats.ensure_regions(profile);
        total_stats.ensure_regions(profile);

        for scope in [StatsScope::Version(version), StatsScope::Total] {
            let Some(reporter) = self.stats.reporter(store, scope) else {
                continue;
            };
            if profile.hybrid && reporter.register_once(HYBRID_GROUP, register_hybrid) {
                debug!(store, scope = %scope, "Registered hybrid ingestion sensors");
            }
            if profile.active_active {
                for (region, alias) in &profile.regions {
                    let prefix = region_metric_prefix(&self.local_region, alias);
                    reporter.register_once(&format!("region:{}", region), |r| {
                        register_region(r, &prefix, *region)
                    });
                }
            }
        }
    }

    /// [`register_replica`](Self::register_replica) keyed by version topic name.
    /// Names that are not version topics are ignored.
    pub fn register_version_topic(&self, topic: &str, profile: &ReplicaProfile) {
        match parse_topic(topic) {
            Ok(TopicKind::Version { store, version }) => {
                self.register_replica(&store, version, profile)
            }
            _ => warn!(topic, "Invalid store version topic name"),
        }
    }

    /// Replace the lag state of one partition in both scopes.
    pub fn report_partition(&self, store: &str, version: u32, partition: u32, report: PartitionReport) {
        self.stats.with_both(store, version, |stats| {
            stats.report_partition(version, partition, report.clone())
        });
    }

    pub fn remove_partition(&self, store: &str, version: u32, partition: u32) {
        self.stats.with_both(store, version, |stats| {
            stats.remove_partition(version, partition)
        });
    }

    pub fn record_records_consumed(&self, store: &str, version: u32, count: u64) {
        self.stats
            .with_both(store, version, |s| s.record_records_consumed(count));
    }

    pub fn record_bytes_consumed(&self, store: &str, version: u32, bytes: u64) {
        self.stats
            .with_both(store, version, |s| s.record_bytes_consumed(bytes));
    }

    pub fn record_leader_records_consumed(&self, store: &str, version: u32, count: u64) {
        self.stats
            .with_both(store, version, |s| s.record_leader_records_consumed(count));
    }

    pub fn record_leader_bytes_consumed(&self, store: &str, version: u32, bytes: u64) {
        self.stats
            .with_both(store, version, |s| s.record_leader_bytes_consumed(bytes));
    }

    pub fn record_follower_records_consumed(&self, store: &str, version: u32, count: u64) {
        self.stats
            .with_both(store, version, |s| s.record_follower_records_consumed(count));
    }

    pub fn record_follower_bytes_consumed(&self, store: &str, version: u32, bytes: u64) {
        self.stats
            .with_both(store, version, |s| s.record_follower_bytes_consumed(bytes));
    }

    pub fn record_leader_records_produced(&self, store: &str, version: u32, count: u64) {
        self.stats
            .with_both(store, version, |s| s.record_leader_records_produced(count));
    }

    pub fn record_leader_bytes_produced(&self, store: &str, version: u32, bytes: u64) {
        self.stats
            .with_both(store, version, |s| s.record_leader_bytes_produced(bytes));
    }

    pub fn record_region_bytes_consumed(&self, store: &str, version: u32, region: RegionId, bytes: u64) {
        self.stats
            .with_both(store, version, |s| s.record_region_bytes_consumed(region, bytes));
    }

    pub fn record_region_records_consumed(
        &self,
        store: &str,
        version: u32,
        region: RegionId,
        count: u64,
    ) {
        self.stats
            .with_both(store, version, |s| s.record_region_records_consumed(region, count));
    }

    pub fn record_stale_partition(&self, store: &str, version: u32) {
        self.stats
            .with_both(store, version, IngestionStats::record_stale_partition);
    }

    pub fn record_subscribe_prep_latency(&self, store: &str, version: u32, millis: f64) {
        self.stats
            .with_both(store, version, |s| s.record_subscribe_prep_latency(millis));
    }

    pub fn record_subscribe_get_consumer_latency(&self, store: &str, version: u32, millis: f64) {
        self.stats.with_both(store, version, |s| {
            s.record_subscribe_get_consumer_latency(millis)
        });
    }

    pub fn record_subscribe_consumer_subscribe_latency(
        &self,
        store: &str,
        version: u32,
        millis: f64,
    ) {
        self.stats.with_both(store, version, |s| {
            s.record_subscribe_consumer_subscribe_latency(millis)
        });
    }

    /// Only set after end of push; version scope only.
    pub fn set_errored(&self, store: &str, version: u32) {
        self.set_version_gauge(store, version, |s| &s.errored, 1);
    }

    pub fn reset_errored(&self, store: &str, version: u32) {
        self.set_version_gauge(store, version, |s| &s.errored, 0);
    }

    pub fn set_push_timeout(&self, store: &str, version: u32) {
        self.set_version_gauge(store, version, |s| &s.push_timeout, 1);
    }

    pub fn reset_push_timeout(&self, store: &str, version: u32) {
        self.set_version_gauge(store, version, |s| &s.push_timeout, 0);
    }

    fn set_version_gauge(
        &self,
        store: &str,
        version: u32,
        gauge: impl Fn(&IngestionStats) -> &AtomicI64,
        value: i64,
    ) {
        if let Some(stats) = self.stats.version_stats(store, version) {
            gauge(&stats).store(value, Ordering::Release);
        }
    }

    pub fn remove_version(&self, store: &str, version: u32) {
        if let Some(total) = self.stats.total_stats(store) {
            total.partitions().retain(|(v, _), _| *v != version);
        }
        self.stats.remove_version(store, version);
    }

    pub fn remove_store(&self, store: &str) {
        self.stats.remove_store(store);
    }

    pub fn version_stats(&self, store: &str, version: u32) -> Option<Arc<IngestionStats>> {
        self.stats.version_stats(store, version)
    }

    pub fn total_stats(&self, store: &str) -> Option<Arc<IngestionStats>> {
        self.stats.total_stats(store)
    }

    /// Reading of a named gauge; `None` when the reporter or sensor does not exist.
    pub fn read_gauge(&self, store: &str, scope: StatsScope, sensor: &str) -> Option<f64> {
        self.stats.reporter(store, scope)?.read(sensor)
    }
}
