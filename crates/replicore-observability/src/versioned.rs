//! Versioned Stats Registry
//!
//! Keeps one stats payload per `(store, version)` plus one store-total payload
//! per store, and a [`StatsReporter`] per scope that turns a payload into named
//! gauge readings.
//!
//! ## Hierarchy
//!
//! ```text
//! store "orders"
//!   ├── total        -> Arc<S>  (receives every recorded delta)
//!   ├── version 3    -> Arc<S>
//!   └── version 4    -> Arc<S>
//! ```
//!
//! Payloads are created through an injected constructor the first time a
//! replica of the version registers. Creation goes through `DashMap::entry`, so
//! concurrent first callers observe the same payload.
//!
//! ## Reporters
//!
//! A reporter outlives its payload: when a version is retired the reporter is
//! unbound and every sensor reads its configured default instead of failing.
//! Unconditional sensors are registered by the injected [`SensorSet`] when the
//! reporter is created; conditional groups (hybrid, per-region) are registered
//! later through [`StatsReporter::register_once`].

use dashmap::DashMap;
use prometheus::core::{Collector, Desc};
use prometheus::proto::MetricFamily;
use prometheus::{GaugeVec, Opts};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use tracing::debug;

/// Which payload of a store a reporter reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StatsScope {
    Version(u32),
    Total,
}

impl fmt::Display for StatsScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatsScope::Version(version) => write!(f, "{}", version),
            StatsScope::Total => write!(f, "total"),
        }
    }
}

type SensorRead<S> = Arc<dyn Fn(&S) -> f64 + Send + Sync>;

struct RegisteredSensor<S> {
    read: SensorRead<S>,
    default: f64,
}

/// Named gauges over the payload of one scope.
pub struct StatsReporter<S> {
    store: String,
    scope: StatsScope,
    stats: RwLock<Option<Arc<S>>>,
    sensors: RwLock<BTreeMap<String, RegisteredSensor<S>>>,
    registered_groups: Mutex<BTreeSet<String>>,
}

impl<S> StatsReporter<S> {
    pub fn new(store: impl Into<String>, scope: StatsScope) -> Self {
        Self {
            store: store.into(),
            scope,
            stats: RwLock::new(None),
            sensors: RwLock::new(BTreeMap::new()),
            registered_groups: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn store(&self) -> &str {
        &self.store
    }

    pub fn scope(&self) -> StatsScope {
        self.scope
    }

    pub fn bind(&self, stats: Arc<S>) {
        *self.stats.write().unwrap_or_else(|e| e.into_inner()) = Some(stats);
    }

    pub fn unbind(&self) {
        *self.stats.write().unwrap_or_else(|e| e.into_inner()) = None;
    }

    pub fn stats(&self) -> Option<Arc<S>> {
        self.stats.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Register a named gauge. The first registration of a name wins.
    pub fn register_sensor<F>(&self, name: impl Into<String>, default: f64, read: F)
    where
        F: Fn(&S) -> f64 + Send + Sync + 'static,
    {
        let name = name.into();
        let mut sensors = self.sensors.write().unwrap_or_else(|e| e.into_inner());
        if sensors.contains_key(&name) {
            return;
        }
        debug!(store = %self.store, scope = %self.scope, sensor = %name, "Registered sensor");
        sensors.insert(
            name,
            RegisteredSensor {
                read: Arc::new(read),
                default,
            },
        );
    }

    /// Run `register` once per group name for the lifetime of this reporter.
    ///
    /// Returns `true` if this call performed the registration. Concurrent
    /// callers for the same group return only after the winner's sensors are
    /// in place.
    pub fn register_once(&self, group: &str, register: impl FnOnce(&Self)) -> bool {
        let mut groups = self
            .registered_groups
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if groups.contains(group) {
            return false;
        }
        register(self);
        groups.insert(group.to_string());
        true
    }

    pub fn has_group(&self, group: &str) -> bool {
        self.registered_groups
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(group)
    }

    pub fn has_sensor(&self, name: &str) -> bool {
        self.sensors
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(name)
    }

    /// Current value of a sensor, or its default when no payload is bound.
    ///
    /// `None` only when no sensor of that name was ever registered.
    pub fn read(&self, name: &str) -> Option<f64> {
        let stats = self.stats();
        let sensors = self.sensors.read().unwrap_or_else(|e| e.into_inner());
        let sensor = sensors.get(name)?;
        Some(read_sensor(sensor, stats.as_deref()))
    }

    pub fn sensor_names(&self) -> Vec<String> {
        self.sensors
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    /// Read every registered sensor.
    pub fn snapshot(&self) -> Vec<(String, f64)> {
        let stats = self.stats();
        self.sensors
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(name, sensor)| (name.clone(), read_sensor(sensor, stats.as_deref())))
            .collect()
    }
}

fn read_sensor<S>(sensor: &RegisteredSensor<S>, stats: Option<&S>) -> f64 {
    match stats {
        Some(stats) => (sensor.read)(stats),
        None => sensor.default,
    }
}

impl<S> fmt::Debug for StatsReporter<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatsReporter")
            .field("store", &self.store)
            .field("scope", &self.scope)
            .field("sensors", &self.sensor_names())
            .finish()
    }
}

/// Registers the unconditional sensors of a freshly created reporter.
pub type SensorSet<S> = Arc<dyn Fn(&StatsReporter<S>) + Send + Sync>;

type PayloadFactory<S, C> = Arc<dyn Fn(&C) -> S + Send + Sync>;

/// Two-level `(store, version)` / store-total registry of stats payloads.
pub struct VersionedStats<S, C> {
    factory: PayloadFactory<S, C>,
    sensors: SensorSet<S>,
    versions: DashMap<(String, u32), Arc<S>>,
    totals: DashMap<String, Arc<S>>,
    reporters: DashMap<(String, StatsScope), Arc<StatsReporter<S>>>,
}

impl<S, C> VersionedStats<S, C>
where
    S: Send + Sync + 'static,
{
    pub fn new<F>(factory: F, sensors: SensorSet<S>) -> Self
    where
        F: Fn(&C) -> S + Send + Sync + 'static,
    {
        Self {
            factory: Arc::new(factory),
            sensors,
            versions: DashMap::new(),
            totals: DashMap::new(),
            reporters: DashMap::new(),
        }
    }

    /// Payloads of a version and of its store total, created on first use.
    pub fn get_or_create(&self, store: &str, version: u32, context: &C) -> (Arc<S>, Arc<S>) {
        let version_stats = self
            .versions
            .entry((store.to_string(), version))
            .or_insert_with(|| Arc::new((self.factory)(context)))
            .clone();
        let total_stats = self
            .totals
            .entry(store.to_string())
            .or_insert_with(|| Arc::new((self.factory)(context)))
            .clone();

        self.reporter_or_create(store, StatsScope::Version(version))
            .bind(Arc::clone(&version_stats));
        self.reporter_or_create(store, StatsScope::Total)
            .bind(Arc::clone(&total_stats));

        (version_stats, total_stats)
    }

    pub fn version_stats(&self, store: &str, version: u32) -> Option<Arc<S>> {
        self.versions
            .get(&(store.to_string(), version))
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn total_stats(&self, store: &str) -> Option<Arc<S>> {
        self.totals.get(store).map(|entry| Arc::clone(entry.value()))
    }

    /// Apply `record` to the version payload and the store total; each side is
    /// skipped when absent.
    pub fn with_both(&self, store: &str, version: u32, record: impl Fn(&S)) {
        if let Some(total) = self.total_stats(store) {
            record(&total);
        }
        if let Some(stats) = self.version_stats(store, version) {
            record(&stats);
        }
    }

    /// Drop a version payload; its reporter keeps reporting defaults.
    pub fn remove_version(&self, store: &str, version: u32) -> bool {
        let removed = self.versions.remove(&(store.to_string(), version)).is_some();
        if let Some(reporter) = self.reporter(store, StatsScope::Version(version)) {
            reporter.unbind();
        }
        removed
    }

    /// Drop every payload of a store.
    pub fn remove_store(&self, store: &str) {
        self.versions.retain(|(name, _), _| name != store);
        self.totals.remove(store);
        for reporter in self.reporters.iter() {
            if reporter.key().0 == store {
                reporter.value().unbind();
            }
        }
    }

    pub fn reporter(&self, store: &str, scope: StatsScope) -> Option<Arc<StatsReporter<S>>> {
        self.reporters
            .get(&(store.to_string(), scope))
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Every reporter, sorted by store then scope.
    pub fn reporters(&self) -> Vec<Arc<StatsReporter<S>>> {
        let mut reporters: Vec<_> = self
            .reporters
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        reporters.sort_by(|a, b| (a.store(), a.scope()).cmp(&(b.store(), b.scope())));
        reporters
    }

    fn reporter_or_create(&self, store: &str, scope: StatsScope) -> Arc<StatsReporter<S>> {
        self.reporters
            .entry((store.to_string(), scope))
            .or_insert_with(|| {
                let reporter = StatsReporter::new(store, scope);
                (self.sensors)(&reporter);
                Arc::new(reporter)
            })
            .clone()
    }
}

/// Source of `(store, scope, sensor, value)` readings for a
/// [`VersionedStatsCollector`].
pub trait ReporterSource: Send + Sync {
    fn readings(&self) -> Vec<(String, StatsScope, String, f64)>;
}

impl<S, C> ReporterSource for VersionedStats<S, C>
where
    S: Send + Sync + 'static,
    C: Send + Sync,
{
    fn readings(&self) -> Vec<(String, StatsScope, String, f64)> {
        self.reporters()
            .into_iter()
            .flat_map(|reporter| {
                let store = reporter.store().to_string();
                let scope = reporter.scope();
                reporter
                    .snapshot()
                    .into_iter()
                    .map(move |(sensor, value)| (store.clone(), scope, sensor, value))
            })
            .collect()
    }
}

/// Exposes every reporter of a registry as one Prometheus gauge family,
/// labelled by store, version and sensor. Values are read at scrape time.
pub struct VersionedStatsCollector {
    source: Arc<dyn ReporterSource>,
    gauges: GaugeVec,
}

impl VersionedStatsCollector {
    pub fn new(name: &str, help: &str, source: Arc<dyn ReporterSource>) -> prometheus::Result<Self> {
        let gauges = GaugeVec::new(Opts::new(name, help), &["store", "version", "sensor"])?;
        Ok(Self { source, gauges })
    }
}

impl Collector for VersionedStatsCollector {
    fn desc(&self) -> Vec<&Desc> {
        self.gauges.desc()
    }

    fn collect(&self) -> Vec<MetricFamily> {
        self.gauges.reset();
        for (store, scope, sensor, value) in self.source.readings() {
            self.gauges
                .with_label_values(&[store.as_str(), scope.to_string().as_str(), sensor.as_str()])
                .set(value);
        }
        self.gauges.collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[derive(Default)]
    struct Counter {
        value: AtomicU64,
    }

    fn registry() -> VersionedStats<Counter, ()> {
        let sensors: SensorSet<Counter> = Arc::new(|reporter| {
            reporter.register_sensor("value", -7.0, |c: &Counter| {
                c.value.load(Ordering::Relaxed) as f64
            });
        });
        VersionedStats::new(|_: &()| Counter::default(), sensors)
    }

    #[test]
    fn test_records_reach_version_and_total() {
        let stats = registry();
        stats.get_or_create("orders", 1, &());
        stats.get_or_create("orders", 2, &());

        stats.with_both("orders", 1, |c| {
            c.value.fetch_add(3, Ordering::Relaxed);
        });
        stats.with_both("orders", 2, |c| {
            c.value.fetch_add(4, Ordering::Relaxed);
        });

        let total = stats.reporter("orders", StatsScope::Total).unwrap();
        assert_eq!(total.read("value"), Some(7.0));
        let v1 = stats.reporter("orders", StatsScope::Version(1)).unwrap();
        assert_eq!(v1.read("value"), Some(3.0));
    }

    #[test]
    fn test_recording_without_payload_is_noop() {
        let stats = registry();
        stats.with_both("missing", 1, |c| {
            c.value.fetch_add(1, Ordering::Relaxed);
        });
        assert!(stats.version_stats("missing", 1).is_none());
        assert!(stats.reporter("missing", StatsScope::Total).is_none());
    }

    #[test]
    fn test_get_or_create_returns_same_payload() {
        let stats = registry();
        let (a, _) = stats.get_or_create("orders", 1, &());
        let (b, _) = stats.get_or_create("orders", 1, &());
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_retired_version_reports_default() {
        let stats = registry();
        stats.get_or_create("orders", 1, &());
        stats.with_both("orders", 1, |c| {
            c.value.fetch_add(5, Ordering::Relaxed);
        });

        assert!(stats.remove_version("orders", 1));
        let reporter = stats.reporter("orders", StatsScope::Version(1)).unwrap();
        assert_eq!(reporter.read("value"), Some(-7.0));
        assert_eq!(reporter.read("unknown"), None);

        stats.remove_store("orders");
        let total = stats.reporter("orders", StatsScope::Total).unwrap();
        assert_eq!(total.read("value"), Some(-7.0));
    }

    #[test]
    fn test_register_once_runs_group_once() {
        let reporter: StatsReporter<Counter> = StatsReporter::new("orders", StatsScope::Total);
        assert!(reporter.register_once("hybrid", |r| r.register_sensor("a", 0.0, |_| 1.0)));
        assert!(!reporter.register_once("hybrid", |r| r.register_sensor("b", 0.0, |_| 1.0)));
        assert!(reporter.has_sensor("a"));
        assert!(!reporter.has_sensor("b"));
    }

    #[test]
    fn test_concurrent_first_registration_has_one_winner() {
        let stats = registry();
        let registrations = AtomicU64::new(0);
        let barrier = std::sync::Barrier::new(8);

        let payloads: Vec<_> = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..8)
                .map(|_| {
                    scope.spawn(|| {
                        barrier.wait();
                        let (version, total) = stats.get_or_create("orders", 1, &());
                        let reporter = stats.reporter("orders", StatsScope::Version(1)).unwrap();
                        reporter.register_once("hybrid", |r| {
                            registrations.fetch_add(1, Ordering::Relaxed);
                            std::thread::sleep(std::time::Duration::from_millis(5));
                            r.register_sensor("hybrid_value", 0.0, |_| 1.0);
                        });
                        // Losers return only once the winner's sensor exists
                        assert!(reporter.has_sensor("hybrid_value"));
                        (version, total)
                    })
                })
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });

        assert_eq!(registrations.load(Ordering::Relaxed), 1);
        let (first_version, first_total) = &payloads[0];
        for (version, total) in &payloads {
            assert!(Arc::ptr_eq(first_version, version));
            assert!(Arc::ptr_eq(first_total, total));
        }
        assert_eq!(stats.reporters().len(), 2);
    }

    #[test]
    fn test_collector_exports_every_reporter() {
        let stats = Arc::new(registry());
        stats.get_or_create("orders", 3, &());
        let collector =
            VersionedStatsCollector::new("test_versioned_value", "test", stats.clone()).unwrap();

        let families = collector.collect();
        assert_eq!(families.len(), 1);
        // version 3 and total
        assert_eq!(families[0].get_metric().len(), 2);
    }
}
