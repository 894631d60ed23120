//! Sensors
//!
//! Typed accumulators recorded from many consumption loops at once and read from
//! the scrape path:
//!
//! - [`Count`]: number of recorded events
//! - [`Max`]: largest recorded value
//! - [`Avg`]: mean of recorded values
//! - [`Rate`]: sum of recorded values per second over a rolling window
//! - [`LatencySensor`]: `Avg` + `Max` pair recorded together
//!
//! `Count`, `Max` and `Avg` are lock-free (atomics). `Rate` keeps two window
//! buckets behind its own mutex; no lock is ever shared between sensors.

use prometheus::core::{Atomic, AtomicF64};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Default rolling window of a [`Rate`].
pub const DEFAULT_RATE_WINDOW: Duration = Duration::from_secs(30);

#[derive(Debug, Default)]
pub struct Count {
    count: AtomicU64,
}

impl Count {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self) {
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn measure(&self) -> f64 {
        self.count.load(Ordering::Relaxed) as f64
    }
}

/// Largest recorded value; `0.0` before the first sample.
#[derive(Debug)]
pub struct Max {
    /// `f64` bits
    max: AtomicU64,
}

impl Max {
    pub fn new() -> Self {
        Self {
            max: AtomicU64::new(f64::NEG_INFINITY.to_bits()),
        }
    }

    pub fn record(&self, value: f64) {
        let _ = self
            .max
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                let current = f64::from_bits(current);
                (value > current).then(|| value.to_bits())
            });
    }

    pub fn measure(&self) -> f64 {
        let max = f64::from_bits(self.max.load(Ordering::Acquire));
        if max == f64::NEG_INFINITY {
            0.0
        } else {
            max
        }
    }
}

impl Default for Max {
    fn default() -> Self {
        Self::new()
    }
}

/// Mean of recorded values; `0.0` before the first sample.
#[derive(Debug)]
pub struct Avg {
    sum: AtomicF64,
    count: AtomicU64,
}

impl Avg {
    pub fn new() -> Self {
        Self {
            sum: AtomicF64::new(0.0),
            count: AtomicU64::new(0),
        }
    }

    pub fn record(&self, value: f64) {
        self.sum.inc_by(value);
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn measure(&self) -> f64 {
        let count = self.count.load(Ordering::Acquire);
        if count == 0 {
            return 0.0;
        }
        self.sum.get() / count as f64
    }
}

impl Default for Avg {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
struct RateBuckets {
    oldest_start: Instant,
    current_start: Instant,
    previous: f64,
    current: f64,
}

/// Per-second rate of recorded values over a rolling window.
///
/// Two buckets of `window` length are kept; the measured rate covers the live
/// part of both, so values stop contributing between one and two windows after
/// they were recorded.
#[derive(Debug)]
pub struct Rate {
    window: Duration,
    buckets: Mutex<RateBuckets>,
}

impl Rate {
    pub fn new() -> Self {
        Self::with_window(DEFAULT_RATE_WINDOW)
    }

    pub fn with_window(window: Duration) -> Self {
        let now = Instant::now();
        Self {
            window,
            buckets: Mutex::new(RateBuckets {
                oldest_start: now,
                current_start: now,
                previous: 0.0,
                current: 0.0,
            }),
        }
    }

    pub fn record(&self, value: f64) {
        self.record_at(value, Instant::now());
    }

    pub fn record_at(&self, value: f64, now: Instant) {
        let mut buckets = self.lock();
        Self::roll(&mut buckets, self.window, now);
        buckets.current += value;
    }

    pub fn measure(&self) -> f64 {
        self.measure_at(Instant::now())
    }

    pub fn measure_at(&self, now: Instant) -> f64 {
        let mut buckets = self.lock();
        Self::roll(&mut buckets, self.window, now);
        let total = buckets.previous + buckets.current;
        if total == 0.0 {
            return 0.0;
        }
        let elapsed = now
            .saturating_duration_since(buckets.oldest_start)
            .as_secs_f64()
            .max(1.0);
        total / elapsed
    }

    fn roll(buckets: &mut RateBuckets, window: Duration, now: Instant) {
        let elapsed = now.saturating_duration_since(buckets.current_start);
        if elapsed >= window * 2 {
            buckets.previous = 0.0;
            buckets.current = 0.0;
            buckets.current_start = now;
            buckets.oldest_start = now;
        } else if elapsed >= window {
            buckets.previous = buckets.current;
            buckets.current = 0.0;
            buckets.oldest_start = buckets.current_start;
            buckets.current_start += window;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RateBuckets> {
        self.buckets
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for Rate {
    fn default() -> Self {
        Self::new()
    }
}

/// Latency distribution: average and maximum.
#[derive(Debug, Default)]
pub struct LatencySensor {
    avg: Avg,
    max: Max,
}

impl LatencySensor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, millis: f64) {
        self.avg.record(millis);
        self.max.record(millis);
    }

    pub fn avg(&self) -> f64 {
        self.avg.measure()
    }

    pub fn max(&self) -> f64 {
        self.max.measure()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_empty_sensors_measure_zero() {
        assert_eq!(Count::new().measure(), 0.0);
        assert_eq!(Max::new().measure(), 0.0);
        assert_eq!(Avg::new().measure(), 0.0);
        assert_eq!(Rate::new().measure(), 0.0);
    }

    #[test]
    fn test_latency_sensor_tracks_avg_and_max() {
        let sensor = LatencySensor::new();
        sensor.record(10.0);
        sensor.record(30.0);
        assert_eq!(sensor.avg(), 20.0);
        assert_eq!(sensor.max(), 30.0);
    }

    #[test]
    fn test_rate_expires_after_two_windows() {
        let rate = Rate::with_window(Duration::from_secs(10));
        let start = Instant::now();
        rate.record_at(100.0, start);
        assert!(rate.measure_at(start + Duration::from_secs(5)) > 0.0);
        assert!(rate.measure_at(start + Duration::from_secs(15)) > 0.0);
        assert_eq!(rate.measure_at(start + Duration::from_secs(25)), 0.0);
    }

    #[test]
    fn test_rate_divides_by_elapsed_seconds() {
        let rate = Rate::with_window(Duration::from_secs(60));
        let start = Instant::now();
        rate.record_at(40.0, start);
        rate.record_at(40.0, start + Duration::from_secs(2));
        let measured = rate.measure_at(start + Duration::from_secs(4));
        assert!((measured - 20.0).abs() < 0.01);
    }

    #[test]
    fn test_max_and_avg_with_negative_samples() {
        let max = Max::new();
        let avg = Avg::new();
        for value in [-5.0, -2.5, -9.0] {
            max.record(value);
            avg.record(value);
        }
        assert_eq!(max.measure(), -2.5);
        assert_eq!(avg.measure(), -5.5);
    }

    #[test]
    fn test_concurrent_recording() {
        let count = Arc::new(Count::new());
        let max = Arc::new(Max::new());
        let avg = Arc::new(Avg::new());

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let count = Arc::clone(&count);
                let max = Arc::clone(&max);
                let avg = Arc::clone(&avg);
                std::thread::spawn(move || {
                    for i in 0..1000 {
                        count.record();
                        max.record((t * 1000 + i) as f64);
                        avg.record(1.0);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(count.measure(), 8000.0);
        assert_eq!(max.measure(), 7999.0);
        assert_eq!(avg.measure(), 1.0);
    }
}
