//! Timeline events for audit and inspection.
//!
//! The timeline is an append-only, per-run ordered log. It is never consulted
//! for control decisions; checkpoints are. An [`Event`] is the stored row,
//! a [`TimelineEntry`] is the typed shape the engine writes.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use spire_core::{CheckpointId, EffectId, RunId, Sequence, TicketId};

use crate::error::ExecutionError;
use crate::ticket::RiskLevel;

/// Event type of a timeline row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// First claim of a run; initial checkpoint written.
    Started,
    /// A step finished and its checkpoint was written.
    StepCompleted,
    /// A side effect ran and its ledger entry was committed.
    EffectCommitted,
    /// A side effect was found committed and its stored result reused.
    EffectReplayed,
    /// A step failed with a retryable error and will run again.
    StepRetrying,
    /// A ticket was issued and the run parked.
    PausedForApproval,
    /// An approved ticket resumed the run.
    Resumed,
    /// A ticket was rejected.
    ApprovalRejected,
    /// A ticket expired before a decision arrived.
    TicketExpired,
    /// An operator asked for cancellation.
    CancelRequested,
    /// The run reached `canceled`.
    Canceled,
    /// The run reached `failed`.
    Failed,
    /// The run reached `completed`.
    Completed,
}

impl EventKind {
    /// Every event kind.
    pub const ALL: [Self; 13] = [
        Self::Started,
        Self::StepCompleted,
        Self::EffectCommitted,
        Self::EffectReplayed,
        Self::StepRetrying,
        Self::PausedForApproval,
        Self::Resumed,
        Self::ApprovalRejected,
        Self::TicketExpired,
        Self::CancelRequested,
        Self::Canceled,
        Self::Failed,
        Self::Completed,
    ];

    /// Stable snake_case name stored in the `event_type` column.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::StepCompleted => "step_completed",
            Self::EffectCommitted => "effect_committed",
            Self::EffectReplayed => "effect_replayed",
            Self::StepRetrying => "step_retrying",
            Self::PausedForApproval => "paused_for_approval",
            Self::Resumed => "resumed",
            Self::ApprovalRejected => "approval_rejected",
            Self::TicketExpired => "ticket_expired",
            Self::CancelRequested => "cancel_requested",
            Self::Canceled => "canceled",
            Self::Failed => "failed",
            Self::Completed => "completed",
        }
    }

    /// Lifecycle events mark run status changes; the rest are detail.
    #[must_use]
    pub fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            Self::Started
                | Self::PausedForApproval
                | Self::Resumed
                | Self::Completed
                | Self::Failed
                | Self::Canceled
        )
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = ExecutionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| ExecutionError::unknown("event type", s))
    }
}

/// A stored timeline row. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Owning run.
    pub run_id: RunId,
    /// Strictly increasing per run, starting at 1.
    pub sequence: Sequence,
    /// Event type.
    pub event_type: EventKind,
    /// Type-specific payload.
    pub payload: Value,
    /// When the row was written.
    pub created_at: DateTime<Utc>,
}

/// Why a run failed. Carried in the `failed` event payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The step returned an error (after retries).
    Step,
    /// A ticket was rejected.
    Rejected,
    /// A ticket expired.
    Expired,
    /// An action handler refused or could not confirm a side effect.
    Action,
    /// The engine hit an unrecoverable inconsistency.
    Fatal,
}

/// Typed timeline entry written by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TimelineEntry {
    /// The run was claimed for the first time.
    Started {
        /// Workflow being executed.
        workflow_id: String,
        /// Initial checkpoint.
        checkpoint_id: CheckpointId,
    },
    /// A step finished.
    StepCompleted {
        /// Step name.
        step: String,
        /// Index of the step that finished.
        position: usize,
        /// Checkpoint written for it.
        checkpoint_id: CheckpointId,
    },
    /// A side effect ran and was committed.
    EffectCommitted {
        /// Step that requested the effect.
        step: String,
        /// Action name.
        action: String,
        /// Ledger key.
        effect_id: EffectId,
        /// Checkpoint holding the result.
        checkpoint_id: CheckpointId,
    },
    /// A committed effect was reused instead of invoked.
    EffectReplayed {
        /// Step that requested the effect.
        step: String,
        /// Action name.
        action: String,
        /// Ledger key.
        effect_id: EffectId,
    },
    /// A retryable step failure.
    StepRetrying {
        /// Step name.
        step: String,
        /// Attempt that failed, starting at 1.
        attempt: u32,
        /// Error message.
        error: String,
    },
    /// A ticket was issued.
    PausedForApproval {
        /// Step waiting for approval.
        step: String,
        /// Issued ticket.
        ticket_id: TicketId,
        /// Checkpoint the decision must match.
        checkpoint_id: CheckpointId,
        /// Risk classification.
        risk_level: RiskLevel,
    },
    /// An approval resumed the run.
    Resumed {
        /// Approved ticket.
        ticket_id: TicketId,
        /// Checkpoint execution resumed from.
        checkpoint_id: CheckpointId,
    },
    /// A ticket was rejected.
    ApprovalRejected {
        /// Rejected ticket.
        ticket_id: TicketId,
        /// Who rejected it, if known.
        decided_by: Option<String>,
    },
    /// A ticket expired undecided.
    TicketExpired {
        /// Expired ticket.
        ticket_id: TicketId,
    },
    /// Cancellation was requested.
    CancelRequested {
        /// Operator-supplied reason.
        reason: String,
        /// Who asked.
        requested_by: String,
    },
    /// The run was canceled.
    Canceled {
        /// Operator-supplied reason.
        reason: String,
    },
    /// The run failed.
    Failed {
        /// Failure class.
        kind: FailureKind,
        /// Error message.
        error: String,
        /// Step that failed, if any.
        step: Option<String>,
    },
    /// The run completed.
    Completed {
        /// Terminal checkpoint.
        checkpoint_id: CheckpointId,
    },
}

impl TimelineEntry {
    /// The event type this entry is stored under.
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Started { .. } => EventKind::Started,
            Self::StepCompleted { .. } => EventKind::StepCompleted,
            Self::EffectCommitted { .. } => EventKind::EffectCommitted,
            Self::EffectReplayed { .. } => EventKind::EffectReplayed,
            Self::StepRetrying { .. } => EventKind::StepRetrying,
            Self::PausedForApproval { .. } => EventKind::PausedForApproval,
            Self::Resumed { .. } => EventKind::Resumed,
            Self::ApprovalRejected { .. } => EventKind::ApprovalRejected,
            Self::TicketExpired { .. } => EventKind::TicketExpired,
            Self::CancelRequested { .. } => EventKind::CancelRequested,
            Self::Canceled { .. } => EventKind::Canceled,
            Self::Failed { .. } => EventKind::Failed,
            Self::Completed { .. } => EventKind::Completed,
        }
    }

    /// The payload column: the entry's fields without the `event` tag.
    pub fn payload(&self) -> Result<Value, serde_json::Error> {
        let mut value = serde_json::to_value(self)?;
        if let Value::Object(map) = &mut value {
            map.remove("event");
        }
        Ok(value)
    }

    /// Rebuild a typed entry from a stored row.
    pub fn from_event(event: &Event) -> Result<Self, serde_json::Error> {
        let mut value = event.payload.clone();
        if let Value::Object(map) = &mut value {
            map.insert("event".to_owned(), Value::from(event.event_type.as_str()));
        }
        serde_json::from_value(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn kind_names_match_serde() {
        for kind in EventKind::ALL {
            assert_eq!(serde_json::to_value(kind).unwrap(), json!(kind.as_str()));
            assert_eq!(kind.as_str().parse::<EventKind>().unwrap(), kind);
        }
    }

    #[test]
    fn lifecycle_subset() {
        let lifecycle: Vec<_> = EventKind::ALL
            .into_iter()
            .filter(EventKind::is_lifecycle)
            .map(|k| k.as_str())
            .collect();
        assert_eq!(
            lifecycle,
            vec!["started", "paused_for_approval", "resumed", "canceled", "failed", "completed"]
        );
    }

    #[test]
    fn payload_drops_tag() {
        let entry = TimelineEntry::Canceled {
            reason: "operator".into(),
        };
        assert_eq!(entry.kind(), EventKind::Canceled);
        assert_eq!(entry.payload().unwrap(), json!({ "reason": "operator" }));
    }

    #[test]
    fn entry_rebuilds_from_stored_row() {
        let entry = TimelineEntry::Failed {
            kind: FailureKind::Step,
            error: "boom".into(),
            step: Some("charge".into()),
        };
        let event = Event {
            run_id: RunId::v4(),
            sequence: Sequence::new(4),
            event_type: entry.kind(),
            payload: entry.payload().unwrap(),
            created_at: Utc::now(),
        };
        assert_eq!(TimelineEntry::from_event(&event).unwrap(), entry);
    }

    #[test]
    fn paused_payload_shape() {
        let ticket_id = TicketId::v4();
        let entry = TimelineEntry::PausedForApproval {
            step: "approve_refund".into(),
            ticket_id,
            checkpoint_id: CheckpointId::new(2),
            risk_level: RiskLevel::High,
        };
        assert_eq!(
            entry.payload().unwrap(),
            json!({
                "step": "approve_refund",
                "ticket_id": ticket_id.to_string(),
                "checkpoint_id": 2,
                "risk_level": "high",
            })
        );
    }
}
