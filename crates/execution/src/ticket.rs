//! Human-in-the-loop approval tickets.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use spire_core::{CheckpointId, EffectId, RunId, TenantId, TicketId};

use crate::error::ExecutionError;

/// Lifecycle of a ticket. Leaves `pending` at most once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    /// Waiting for a decision.
    Pending,
    /// Approved by a reviewer.
    Approved,
    /// Rejected by a reviewer.
    Rejected,
    /// No decision before `expires_at`, or the run was canceled.
    Expired,
}

impl TicketStatus {
    /// Every ticket status.
    pub const ALL: [Self; 4] = [Self::Pending, Self::Approved, Self::Rejected, Self::Expired];

    /// Stable lowercase name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Expired => "expired",
        }
    }

    /// Returns `true` once the ticket can no longer be decided.
    #[must_use]
    pub fn is_final(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl std::fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TicketStatus {
    type Err = ExecutionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ExecutionError::unknown("ticket status", s))
    }
}

/// Risk classification shown to reviewers. Ordered from least to most risky.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    /// Routine.
    Low,
    /// Needs a look.
    Medium,
    /// Money or customer data involved.
    High,
    /// Irreversible or wide blast radius.
    Critical,
}

impl RiskLevel {
    /// Every risk level, ascending.
    pub const ALL: [Self; 4] = [Self::Low, Self::Medium, Self::High, Self::Critical];

    /// Stable lowercase name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RiskLevel {
    type Err = ExecutionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|level| level.as_str() == s)
            .ok_or_else(|| ExecutionError::unknown("risk level", s))
    }
}

/// A reviewer's verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    /// Let the gated step proceed.
    Approve,
    /// Stop the run.
    Reject,
}

impl Decision {
    /// Ticket status recorded for this decision.
    #[must_use]
    pub fn resulting_status(&self) -> TicketStatus {
        match self {
            Self::Approve => TicketStatus::Approved,
            Self::Reject => TicketStatus::Rejected,
        }
    }
}

/// A request for a human decision bound to one checkpoint of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticket {
    /// Deterministic id derived from `(run_id, checkpoint_id, interrupt_id)`.
    pub ticket_id: TicketId,
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Parked run.
    pub run_id: RunId,
    /// Checkpoint the run was parked at.
    pub checkpoint_id: CheckpointId,
    /// Step-supplied interrupt name.
    pub interrupt_id: String,
    /// Current status.
    pub status: TicketStatus,
    /// Risk classification.
    pub risk_level: RiskLevel,
    /// Everything a reviewer needs to decide.
    pub context_pack: Value,
    /// Reviewer-supplied payload once decided.
    pub decision_payload: Option<Value>,
    /// Reviewer principal once decided.
    pub decided_by: Option<String>,
    /// Prepared effect held behind this ticket, if any.
    pub effect_id: Option<EffectId>,
    /// A decision applies only while the run is still at this checkpoint.
    pub expected_checkpoint_id: CheckpointId,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Decision or expiry time.
    pub decided_at: Option<DateTime<Utc>>,
    /// Deadline for a decision.
    pub expires_at: Option<DateTime<Utc>>,
}

impl Ticket {
    /// Returns `true` if the ticket is pending and past its deadline at `now`.
    #[must_use]
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.status == TicketStatus::Pending && self.expires_at.is_some_and(|at| at <= now)
    }

    /// Returns `true` if `decision` with `payload` is exactly what was recorded.
    #[must_use]
    pub fn records(&self, decision: Decision, payload: &Value) -> bool {
        self.status == decision.resulting_status()
            && self.decision_payload.as_ref() == Some(payload)
    }
}
