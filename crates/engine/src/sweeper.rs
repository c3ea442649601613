//! Background expiry of overdue tickets.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use spire_ports::{PortsError, Store};
use spire_telemetry::{Telemetry, names};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Periodically expires pending tickets past their deadline.
///
/// Expiring a ticket makes its parked run claimable; the orchestrator then
/// fails the run. The sweeper does nothing else.
#[derive(Clone)]
pub struct Sweeper {
    store: Arc<dyn Store>,
    telemetry: Telemetry,
    interval: Duration,
}

impl Sweeper {
    /// Sweep `store` every `interval`.
    pub fn new(store: Arc<dyn Store>, telemetry: Telemetry, interval: Duration) -> Self {
        Self {
            store,
            telemetry,
            interval,
        }
    }

    /// Expire every ticket overdue at `now`. Returns how many were expired.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<usize, PortsError> {
        let expired = self.store.expire_overdue_tickets(now).await?;
        if !expired.is_empty() {
            self.telemetry
                .metrics()
                .counter(names::TICKETS_EXPIRED)
                .inc_by(expired.len() as u64);
            for ticket in &expired {
                info!(ticket_id = %ticket.ticket_id, run_id = %ticket.run_id, "ticket expired");
            }
        }
        Ok(expired.len())
    }

    /// Run [`Sweeper::sweep_once`] on a timer until `shutdown` fires.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    () = shutdown.cancelled() => break,
                }
                if let Err(err) = self.sweep_once(Utc::now()).await {
                    warn!(error = %err, "ticket sweep failed");
                }
            }
            debug!("sweeper stopped");
        })
    }
}

impl std::fmt::Debug for Sweeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sweeper")
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}
