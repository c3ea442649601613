//! Versioned checkpoint payload.
//!
//! Every checkpoint stores a [`RunState`] document. Resume decodes the latest
//! one and continues at `position`; nothing else is needed to pick a run up
//! on a different worker.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use spire_core::{EffectId, TicketId};

use crate::error::ExecutionError;
use crate::ticket::Decision;

/// Schema version written by this build.
pub const RUN_STATE_SCHEMA_VERSION: u32 = 1;

/// A recorded approval decision, keyed by step name in [`RunState::decisions`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    /// Ticket that carried the decision.
    pub ticket_id: TicketId,
    /// Approve or reject.
    pub decision: Decision,
    /// Reviewer-supplied payload.
    #[serde(default)]
    pub payload: Value,
    /// Reviewer principal.
    #[serde(default)]
    pub decided_by: Option<String>,
}

/// An effect whose result is checkpointed but whose ledger row may still be
/// `prepared`. Committed first thing on resume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingCommit {
    /// Ledger key.
    pub effect_id: EffectId,
    /// Step that produced the effect.
    pub step: String,
    /// Action name.
    pub action: String,
    /// Result returned by the action handler.
    pub result: Value,
}

/// Terminal outcome stored on the last checkpoint of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    /// Every step finished.
    Completed,
    /// The run failed.
    Failed {
        /// Error message.
        reason: String,
    },
    /// The run was canceled.
    Canceled {
        /// Operator-supplied reason.
        reason: String,
    },
}

/// Durable continuation of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    /// Payload schema version.
    pub schema_version: u32,
    /// Index of the next step to execute.
    pub position: usize,
    /// User state threaded through steps.
    pub data: Value,
    /// Effect results by step name.
    #[serde(default)]
    pub outputs: BTreeMap<String, Value>,
    /// Approval decisions by step name.
    #[serde(default)]
    pub decisions: BTreeMap<String, DecisionRecord>,
    /// Effect checkpointed but not yet committed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_commit: Option<PendingCommit>,
    /// Set on terminal checkpoints only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Outcome>,
}

impl RunState {
    /// State for a run that has not executed any step yet.
    #[must_use]
    pub fn initial(input: Value) -> Self {
        Self {
            schema_version: RUN_STATE_SCHEMA_VERSION,
            position: 0,
            data: input,
            outputs: BTreeMap::new(),
            decisions: BTreeMap::new(),
            pending_commit: None,
            outcome: None,
        }
    }

    /// Returns `true` if this state ends the run.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.outcome.is_some()
    }

    /// Copy of this state with `outcome` set and nothing pending.
    #[must_use]
    pub fn finished(&self, outcome: Outcome) -> Self {
        Self {
            pending_commit: None,
            outcome: Some(outcome),
            ..self.clone()
        }
    }

    /// Encode for storage.
    pub fn to_payload(&self) -> Result<Value, ExecutionError> {
        Ok(serde_json::to_value(self)?)
    }

    /// Decode a stored payload, refusing unknown schema versions.
    pub fn from_payload(payload: &Value) -> Result<Self, ExecutionError> {
        let found = payload
            .get("schema_version")
            .and_then(Value::as_u64)
            .unwrap_or_default();
        if found != u64::from(RUN_STATE_SCHEMA_VERSION) {
            return Err(ExecutionError::UnsupportedSchema {
                found: u32::try_from(found).unwrap_or(u32::MAX),
                expected: RUN_STATE_SCHEMA_VERSION,
            });
        }
        Ok(serde_json::from_value(payload.clone())?)
    }
}
