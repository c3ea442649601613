//! Run repository port: creation, lease-based claims and fenced status changes.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use spire_core::{RunId, TenantId, WorkerId, WorkflowId};
use spire_execution::{Run, RunStatus};
use uuid::Uuid;

use crate::error::PortsError;

/// Input for [`RunRepo::create_run`].
#[derive(Debug, Clone)]
pub struct NewRun {
    /// Caller-chosen id.
    pub run_id: RunId,
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Workflow to execute.
    pub workflow_id: WorkflowId,
    /// Spawning run, if any.
    pub parent_run_id: Option<RunId>,
    /// Lower runs first.
    pub priority: i32,
    /// Start payload.
    pub input: Value,
}

/// Proof of a worker's claim on a run. Every fenced write carries one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    /// Claimed run.
    pub run_id: RunId,
    /// Holder.
    pub worker_id: WorkerId,
    /// Fencing token.
    pub token: Uuid,
    /// Lease deadline.
    pub expires_at: DateTime<Utc>,
}

/// A run handed to a worker by [`RunRepo::claim_next`].
#[derive(Debug, Clone)]
pub struct ClaimedRun {
    /// The run as stored after the claim.
    pub run: Run,
    /// The claim to fence subsequent writes with.
    pub claim: Claim,
}

/// Deadline of a lease taken at `now` for `ttl`, saturating at the far future.
#[must_use]
pub fn lease_deadline(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::TimeDelta::from_std(ttl)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Persistence and coordination for runs.
///
/// A run is *claimable* at `now` when it is not terminal, holds no live lease
/// and is one of:
/// - `queued`;
/// - `running` with an expired lease (its worker crashed);
/// - `waiting_approval` whose last ticket is no longer pending, or whose
///   cancellation was requested.
#[async_trait]
pub trait RunRepo: Send + Sync {
    /// Insert a `queued` run.
    async fn create_run(&self, new: NewRun) -> Result<Run, PortsError>;

    /// Fetch a run.
    async fn get_run(&self, run_id: RunId) -> Result<Option<Run>, PortsError>;

    /// Atomically claim the best claimable run: lowest `priority`, then oldest
    /// `updated_at`, then creation order. Does not change the run's status.
    async fn claim_next(
        &self,
        worker_id: &WorkerId,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<ClaimedRun>, PortsError>;

    /// Extend a claim. Fails with `LeaseUnavailable` if the token no longer matches.
    async fn renew_claim(
        &self,
        claim: &Claim,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Claim, PortsError>;

    /// Drop a claim without changing status. Idempotent.
    async fn release_claim(&self, claim: &Claim) -> Result<(), PortsError>;

    /// Change status under a claim.
    ///
    /// Validated against the run state machine. Entering `running` sets
    /// `started_at` once; entering `waiting_approval` or a terminal status
    /// releases the claim; terminal statuses set `finished_at`. `last_error`
    /// overwrites the stored error when `Some`.
    async fn transition(
        &self,
        claim: &Claim,
        to: RunStatus,
        last_error: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Run, PortsError>;

    /// Record a cancellation request. Idempotent; the first request time wins.
    /// Terminal runs are rejected with `InvalidState`.
    async fn request_cancel(&self, run_id: RunId, now: DateTime<Utc>) -> Result<Run, PortsError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_deadline_saturates() {
        let now = Utc::now();
        assert_eq!((lease_deadline(now, Duration::from_secs(30)) - now).num_seconds(), 30);
        assert_eq!(lease_deadline(now, Duration::MAX), DateTime::<Utc>::MAX_UTC);
    }
}
