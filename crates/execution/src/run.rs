//! The run record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use spire_core::{CheckpointId, RunId, TenantId, TicketId, WorkerId, WorkflowId};
use uuid::Uuid;

use crate::status::RunStatus;

/// A worker's time-bounded claim on a run.
///
/// The token fences every write made under the claim: once the lease lapses
/// and another worker claims the run, writes carrying the old token fail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Holder.
    pub worker_id: WorkerId,
    /// Fencing token, never exposed over the control surface.
    #[serde(skip)]
    pub token: Uuid,
    /// Deadline after which the run may be claimed again.
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    /// Returns `true` if the lease is still held at `now`.
    #[must_use]
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// One execution of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    /// Unique id.
    pub run_id: RunId,
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Registered workflow this run executes.
    pub workflow_id: WorkflowId,
    /// Run that spawned this one, if any.
    pub parent_run_id: Option<RunId>,
    /// Current status.
    pub status: RunStatus,
    /// Lower runs first.
    pub priority: i32,
    /// Start payload.
    pub input: Value,
    /// Latest checkpoint; never decreases.
    pub last_checkpoint_id: Option<CheckpointId>,
    /// Latest ticket issued for this run.
    pub last_ticket_id: Option<TicketId>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// First claim time.
    pub started_at: Option<DateTime<Utc>>,
    /// Terminal transition time.
    pub finished_at: Option<DateTime<Utc>>,
    /// Last write to this row.
    pub updated_at: DateTime<Utc>,
    /// Reason for the latest failure, prefixed `step:` or `fatal:`.
    pub last_error: Option<String>,
    /// Set once cancellation has been requested.
    pub cancel_requested_at: Option<DateTime<Utc>>,
    /// Active claim, if any.
    pub lease: Option<Lease>,
}

impl Run {
    /// Returns `true` if a live lease is held at `now`.
    #[must_use]
    pub fn is_claimed(&self, now: DateTime<Utc>) -> bool {
        self.lease.as_ref().is_some_and(|lease| lease.is_live(now))
    }

    /// Returns `true` if cancellation has been requested.
    #[must_use]
    pub fn cancel_requested(&self) -> bool {
        self.cancel_requested_at.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn run() -> Run {
        let now = Utc::now();
        Run {
            run_id: RunId::v4(),
            tenant_id: TenantId::v4(),
            workflow_id: WorkflowId::new("refund_flow").unwrap(),
            parent_run_id: None,
            status: RunStatus::Running,
            priority: 0,
            input: json!({}),
            last_checkpoint_id: None,
            last_ticket_id: None,
            created_at: now,
            started_at: None,
            finished_at: None,
            updated_at: now,
            last_error: None,
            cancel_requested_at: None,
            lease: None,
        }
    }

    #[test]
    fn claim_is_live_until_expiry() {
        let now = Utc::now();
        let mut r = run();
        assert!(!r.is_claimed(now));
        r.lease = Some(Lease {
            worker_id: WorkerId::new("w-1").unwrap(),
            token: Uuid::new_v4(),
            expires_at: now + Duration::seconds(30),
        });
        assert!(r.is_claimed(now));
        assert!(!r.is_claimed(now + Duration::seconds(31)));
    }

    #[test]
    fn lease_token_is_not_serialized() {
        let mut r = run();
        r.lease = Some(Lease {
            worker_id: WorkerId::new("w-1").unwrap(),
            token: Uuid::new_v4(),
            expires_at: Utc::now(),
        });
        let json = serde_json::to_value(&r).unwrap();
        assert!(json["lease"].get("token").is_none());
        assert_eq!(json["lease"]["worker_id"], "w-1");
    }
}
