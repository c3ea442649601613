//! Worker pool: claims runs and hands them to the orchestrator.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use spire_core::{RunId, WorkerId};
use spire_ports::{PortsError, Store};
use spire_telemetry::{Telemetry, names};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::orchestrator::{Disposition, Orchestrator};

struct Inner {
    orchestrator: Orchestrator,
    store: Arc<dyn Store>,
    telemetry: Telemetry,
    config: EngineConfig,
    in_flight: DashMap<RunId, WorkerId>,
}

/// Polls the store for claimable runs on N worker tasks.
///
/// Runs are exclusive through their lease; the in-flight map is a local
/// cross-check. Claiming a run this process already drives bumps
/// `spire_claim_collisions_total`, which must stay at zero.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

/// Running worker tasks.
#[derive(Debug)]
pub struct DispatcherHandle {
    shutdown: CancellationToken,
    workers: JoinSet<()>,
}

impl Dispatcher {
    /// Create a dispatcher.
    pub fn new(
        orchestrator: Orchestrator,
        store: Arc<dyn Store>,
        telemetry: Telemetry,
        config: EngineConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                orchestrator,
                store,
                telemetry,
                config,
                in_flight: DashMap::new(),
            }),
        }
    }

    /// Spawn `config.workers` worker tasks that stop when `shutdown` fires.
    ///
    /// A worker finishes the run it is driving before it exits.
    pub fn start(&self, shutdown: CancellationToken) -> Result<DispatcherHandle, EngineError> {
        let mut workers = JoinSet::new();
        for n in 0..self.inner.config.workers {
            let worker_id = self.inner.config.worker_id(&n.to_string())?;
            let dispatcher = self.clone();
            let shutdown = shutdown.clone();
            workers.spawn(async move { dispatcher.work(worker_id, shutdown).await });
        }
        info!(workers = self.inner.config.workers, "dispatcher started");
        Ok(DispatcherHandle { shutdown, workers })
    }

    async fn work(&self, worker_id: WorkerId, shutdown: CancellationToken) {
        debug!(worker = %worker_id, "worker started");
        while !shutdown.is_cancelled() {
            let idle = match self.poll_once(&worker_id).await {
                Ok(Some(_)) => false,
                Ok(None) => true,
                Err(err) => {
                    warn!(worker = %worker_id, error = %err, "claim failed");
                    true
                }
            };
            if idle {
                tokio::select! {
                    () = tokio::time::sleep(self.inner.config.poll_interval) => {}
                    () = shutdown.cancelled() => break,
                }
            }
        }
        debug!(worker = %worker_id, "worker stopped");
    }

    /// Claim one run and drive it. `None` when nothing was claimable.
    pub async fn poll_once(&self, worker_id: &WorkerId) -> Result<Option<Disposition>, PortsError> {
        let inner = &self.inner;
        let Some(claimed) = inner
            .store
            .claim_next(worker_id, inner.config.lease_ttl, Utc::now())
            .await?
        else {
            return Ok(None);
        };
        let run_id = claimed.run.run_id;
        let metrics = inner.telemetry.metrics();
        metrics.counter(names::RUNS_CLAIMED).inc();
        debug!(worker = %worker_id, %run_id, status = claimed.run.status.as_str(), "claimed run");

        match inner.in_flight.entry(run_id) {
            Entry::Occupied(holder) => {
                metrics.counter(names::CLAIM_COLLISIONS).inc();
                error!(worker = %worker_id, %run_id, holder = %holder.get(), "run claimed while in flight");
            }
            Entry::Vacant(slot) => {
                slot.insert(worker_id.clone());
            }
        }

        let busy = metrics.gauge(names::WORKERS_BUSY);
        busy.inc();
        let disposition = inner.orchestrator.drive(claimed).await;
        busy.dec();
        inner.in_flight.remove_if(&run_id, |_, holder| holder == worker_id);
        debug!(worker = %worker_id, %run_id, ?disposition, "run driven");
        Ok(Some(disposition))
    }

    /// Drive runs on the calling task until nothing is claimable.
    ///
    /// Returns how many claims were driven. Parked runs stay parked, so this
    /// terminates once every remaining run waits on a pending ticket.
    pub async fn drain(&self) -> Result<usize, EngineError> {
        let worker_id = self.inner.config.worker_id("drain")?;
        let mut driven = 0;
        while self.poll_once(&worker_id).await?.is_some() {
            driven += 1;
        }
        Ok(driven)
    }

    /// Runs currently being driven by this process.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.len()
    }
}

impl DispatcherHandle {
    /// Signal shutdown and wait for every worker to finish its current run.
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        while let Some(joined) = self.workers.join_next().await {
            if let Err(err) = joined {
                error!(error = %err, "worker task panicked");
            }
        }
        info!("dispatcher stopped");
    }

    /// Wait for the workers to exit without signalling them.
    pub async fn join(mut self) {
        while let Some(joined) = self.workers.join_next().await {
            if let Err(err) = joined {
                error!(error = %err, "worker task panicked");
            }
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("workers", &self.inner.config.workers)
            .field("in_flight", &self.inner.in_flight.len())
            .finish_non_exhaustive()
    }
}
