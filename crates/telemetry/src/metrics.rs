//! Metrics primitives and registry.
//!
//! Lightweight metric types (counter, gauge, histogram) and a registry to
//! create and retrieve them by name. Values live in memory on atomics; a
//! [`MetricsSnapshot`] is what gets exported.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::Serialize;

/// Metric names recorded by the engine.
pub mod names {
    /// Runs handed to a worker.
    pub const RUNS_CLAIMED: &str = "spire_runs_claimed_total";
    /// A run was claimed while already in flight in this process. Must stay 0.
    pub const CLAIM_COLLISIONS: &str = "spire_claim_collisions_total";
    /// Step invocations, including retries.
    pub const STEPS_EXECUTED: &str = "spire_steps_executed_total";
    /// Side effects invoked and committed.
    pub const EFFECTS_COMMITTED: &str = "spire_effects_committed_total";
    /// Side effects answered from the ledger instead of invoked.
    pub const EFFECTS_REPLAYED: &str = "spire_effects_replayed_total";
    /// Runs that reached `completed`.
    pub const RUNS_COMPLETED: &str = "spire_runs_completed_total";
    /// Runs that reached `failed`.
    pub const RUNS_FAILED: &str = "spire_runs_failed_total";
    /// Tickets expired by the sweeper.
    pub const TICKETS_EXPIRED: &str = "spire_tickets_expired_total";
    /// Wall time per step invocation.
    pub const STEP_DURATION_SECONDS: &str = "spire_step_duration_seconds";
    /// Workers currently driving a run.
    pub const WORKERS_BUSY: &str = "spire_workers_busy";
}

/// An incrementing counter.
#[derive(Debug, Clone, Default)]
pub struct Counter {
    value: Arc<AtomicU64>,
}

impl Counter {
    /// Create a new counter starting at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment by one.
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment by a given amount.
    pub fn inc_by(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    /// Current value.
    #[must_use]
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// A gauge that can go up and down.
#[derive(Debug, Clone, Default)]
pub struct Gauge {
    value: Arc<AtomicI64>,
}

impl Gauge {
    /// Create a new gauge starting at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment by one.
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement by one.
    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    /// Set to a specific value.
    pub fn set(&self, v: i64) {
        self.value.store(v, Ordering::Relaxed);
    }

    /// Current value.
    #[must_use]
    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// A histogram keeping count and sum, in microseconds for sub-second
/// resolution without floating-point atomics.
#[derive(Debug, Clone, Default)]
pub struct Histogram {
    count: Arc<AtomicU64>,
    sum_micros: Arc<AtomicU64>,
}

impl Histogram {
    /// Create a new histogram.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an observation in seconds. Negative values count as zero.
    pub fn observe(&self, seconds: f64) {
        let micros = (seconds.max(0.0) * 1_000_000.0).round() as u64;
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_micros.fetch_add(micros, Ordering::Relaxed);
    }

    /// Record a duration.
    pub fn observe_duration(&self, elapsed: std::time::Duration) {
        self.observe(elapsed.as_secs_f64());
    }

    /// Number of observations recorded.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Sum of all observations, in seconds.
    #[must_use]
    pub fn sum(&self) -> f64 {
        self.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0
    }
}

/// Point-in-time copy of every metric.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    /// Counter values.
    pub counters: BTreeMap<String, u64>,
    /// Gauge values.
    pub gauges: BTreeMap<String, i64>,
    /// Histogram `(count, sum)` pairs.
    pub histograms: BTreeMap<String, HistogramSnapshot>,
}

/// Exported histogram summary.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HistogramSnapshot {
    /// Observations.
    pub count: u64,
    /// Sum of observations.
    pub sum: f64,
}

/// Registry for creating and retrieving named metrics.
///
/// Retrieving the same name twice returns handles to the same value.
#[derive(Debug, Clone, Default)]
pub struct MetricsRegistry {
    counters: Arc<RwLock<HashMap<String, Counter>>>,
    gauges: Arc<RwLock<HashMap<String, Gauge>>>,
    histograms: Arc<RwLock<HashMap<String, Histogram>>>,
}

impl MetricsRegistry {
    /// Create a new empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create a counter by name.
    pub fn counter(&self, name: &str) -> Counter {
        if let Some(c) = self.counters.read().get(name) {
            return c.clone();
        }
        self.counters.write().entry(name.to_owned()).or_default().clone()
    }

    /// Get or create a gauge by name.
    pub fn gauge(&self, name: &str) -> Gauge {
        if let Some(g) = self.gauges.read().get(name) {
            return g.clone();
        }
        self.gauges.write().entry(name.to_owned()).or_default().clone()
    }

    /// Get or create a histogram by name.
    pub fn histogram(&self, name: &str) -> Histogram {
        if let Some(h) = self.histograms.read().get(name) {
            return h.clone();
        }
        self.histograms.write().entry(name.to_owned()).or_default().clone()
    }

    /// Copy every metric.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            counters: self
                .counters
                .read()
                .iter()
                .map(|(k, v)| (k.clone(), v.get()))
                .collect(),
            gauges: self
                .gauges
                .read()
                .iter()
                .map(|(k, v)| (k.clone(), v.get()))
                .collect(),
            histograms: self
                .histograms
                .read()
                .iter()
                .map(|(k, v)| {
                    (
                        k.clone(),
                        HistogramSnapshot {
                            count: v.count(),
                            sum: v.sum(),
                        },
                    )
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn counter_increments() {
        let c = Counter::new();
        assert_eq!(c.get(), 0);
        c.inc();
        c.inc_by(5);
        assert_eq!(c.get(), 6);
    }

    #[test]
    fn gauge_up_and_down() {
        let g = Gauge::new();
        g.inc();
        g.inc();
        g.dec();
        assert_eq!(g.get(), 1);
        g.set(42);
        assert_eq!(g.get(), 42);
    }

    #[test]
    fn histogram_records_observations() {
        let h = Histogram::new();
        h.observe(1.0);
        h.observe(2.5);
        h.observe_duration(Duration::from_millis(500));
        assert_eq!(h.count(), 3);
        assert!((h.sum() - 4.0).abs() < 1e-9);
    }

    #[test]
    fn registry_returns_same_metric_for_same_name() {
        let reg = MetricsRegistry::new();
        reg.counter(names::STEPS_EXECUTED).inc();
        assert_eq!(reg.counter(names::STEPS_EXECUTED).get(), 1);
        assert_eq!(reg.counter(names::RUNS_FAILED).get(), 0);
    }

    #[test]
    fn snapshot_copies_every_kind() {
        let reg = MetricsRegistry::new();
        reg.counter(names::RUNS_CLAIMED).inc_by(3);
        reg.gauge(names::WORKERS_BUSY).set(2);
        reg.histogram(names::STEP_DURATION_SECONDS).observe(0.25);

        let snap = reg.snapshot();
        assert_eq!(snap.counters[names::RUNS_CLAIMED], 3);
        assert_eq!(snap.gauges[names::WORKERS_BUSY], 2);
        assert_eq!(snap.histograms[names::STEP_DURATION_SECONDS].count, 1);
    }
}
