//! Ticket store port.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use spire_core::{CheckpointId, EffectId, RunId, TenantId, TicketId};
use spire_execution::{Decision, RiskLevel, Ticket, TicketStatus};

use crate::error::PortsError;

/// Input for [`TicketStore::create_ticket`].
#[derive(Debug, Clone)]
pub struct NewTicket {
    /// Deterministic id; see `spire_core::ticket_id_for`.
    pub ticket_id: TicketId,
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Parked run.
    pub run_id: RunId,
    /// Checkpoint the run is parked at; also the expected checkpoint.
    pub checkpoint_id: CheckpointId,
    /// Step-supplied interrupt name.
    pub interrupt_id: String,
    /// Risk classification.
    pub risk_level: RiskLevel,
    /// Reviewer context.
    pub context_pack: Value,
    /// Gated effect, if any.
    pub effect_id: Option<EffectId>,
    /// Deadline.
    pub expires_at: Option<DateTime<Utc>>,
}

/// Query for [`TicketStore::list_tickets`]. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketFilter {
    /// Restrict to a tenant.
    pub tenant_id: Option<TenantId>,
    /// Restrict to a status.
    pub status: Option<TicketStatus>,
    /// Restrict to a risk level.
    pub risk_level: Option<RiskLevel>,
    /// Restrict to a run.
    pub run_id: Option<RunId>,
    /// Maximum rows; drivers apply [`TicketFilter::DEFAULT_LIMIT`] when unset.
    pub limit: Option<usize>,
}

impl TicketFilter {
    /// Row cap when `limit` is unset.
    pub const DEFAULT_LIMIT: usize = 100;

    /// Effective row cap.
    #[must_use]
    pub fn effective_limit(&self) -> usize {
        self.limit.unwrap_or(Self::DEFAULT_LIMIT)
    }

    /// Returns `true` if `ticket` passes every set field.
    #[must_use]
    pub fn matches(&self, ticket: &Ticket) -> bool {
        self.tenant_id.is_none_or(|t| t == ticket.tenant_id)
            && self.status.is_none_or(|s| s == ticket.status)
            && self.risk_level.is_none_or(|r| r == ticket.risk_level)
            && self.run_id.is_none_or(|r| r == ticket.run_id)
    }
}

/// A reviewer's decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TicketDecision {
    /// Approve or reject.
    pub decision: Decision,
    /// Reviewer payload.
    #[serde(default)]
    pub payload: Value,
    /// Reviewer principal.
    #[serde(default)]
    pub decided_by: Option<String>,
}

/// Successful result of [`TicketStore::decide_ticket`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", content = "ticket", rename_all = "snake_case")]
pub enum DecideOutcome {
    /// The decision was recorded now.
    Applied(Ticket),
    /// The identical decision was already recorded.
    Unchanged(Ticket),
}

impl DecideOutcome {
    /// The ticket after the call.
    #[must_use]
    pub fn ticket(&self) -> &Ticket {
        match self {
            Self::Applied(ticket) | Self::Unchanged(ticket) => ticket,
        }
    }
}

/// Human-in-the-loop tickets with optimistic concurrency.
#[async_trait]
pub trait TicketStore: Send + Sync {
    /// Insert a pending ticket and point `run.last_ticket_id` at it.
    /// Idempotent on `ticket_id`: an existing row is returned unchanged.
    async fn create_ticket(&self, new: NewTicket, now: DateTime<Utc>) -> Result<Ticket, PortsError>;

    /// Fetch a ticket.
    async fn get_ticket(&self, ticket_id: TicketId) -> Result<Option<Ticket>, PortsError>;

    /// Record a decision, in this order:
    /// 1. the identical decision is already recorded → `Unchanged`;
    /// 2. `expected` differs from the ticket's expected checkpoint, or the
    ///    run has moved past it → `Conflict`;
    /// 3. the ticket is not pending → `AlreadyDecided`;
    /// 4. otherwise → `Applied`.
    async fn decide_ticket(
        &self,
        ticket_id: TicketId,
        decision: TicketDecision,
        expected: CheckpointId,
        now: DateTime<Utc>,
    ) -> Result<DecideOutcome, PortsError>;

    /// Tickets matching `filter`, newest first.
    async fn list_tickets(&self, filter: &TicketFilter) -> Result<Vec<Ticket>, PortsError>;

    /// Expire every pending ticket whose deadline has passed. Returns them.
    async fn expire_overdue_tickets(&self, now: DateTime<Utc>) -> Result<Vec<Ticket>, PortsError>;

    /// Expire one pending ticket. Idempotent on `expired`; other final
    /// statuses are `AlreadyDecided`.
    async fn expire_ticket(&self, ticket_id: TicketId, now: DateTime<Utc>) -> Result<Ticket, PortsError>;
}
