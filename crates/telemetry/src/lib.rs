#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! # Spire Telemetry
//!
//! Metrics and notifications for the Spire durable execution core.
//!
//! This crate provides:
//! - [`MetricsRegistry`] -- named counters, gauges and histograms on atomics
//! - [`NotificationBus`] -- broadcast fan-out of [`RunNotification`]s
//! - [`Telemetry`] -- both, shared by the engine and the HTTP surface
//!
//! Notifications are **projections**, not the source of truth. The
//! checkpoint store and the event timeline are.

pub mod metrics;
pub mod notification;

use std::sync::Arc;

pub use metrics::{
    Counter, Gauge, Histogram, HistogramSnapshot, MetricsRegistry, MetricsSnapshot, names,
};
pub use notification::{NotificationBus, NotificationSubscriber, RunNotification};

/// Metrics registry and notification bus, cheap to clone.
#[derive(Clone)]
pub struct Telemetry {
    metrics: MetricsRegistry,
    bus: Arc<NotificationBus>,
}

impl Telemetry {
    /// Create telemetry whose bus buffers `capacity` notifications per subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            metrics: MetricsRegistry::new(),
            bus: Arc::new(NotificationBus::new(capacity)),
        }
    }

    /// The metrics registry.
    #[must_use]
    pub fn metrics(&self) -> &MetricsRegistry {
        &self.metrics
    }

    /// The notification bus.
    #[must_use]
    pub fn bus(&self) -> &NotificationBus {
        &self.bus
    }
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new(256)
    }
}

impl std::fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Telemetry")
            .field("subscribers", &self.bus.subscriber_count())
            .finish_non_exhaustive()
    }
}
