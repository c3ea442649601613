//! Checkpoint records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use spire_core::{CheckpointId, RunId};

use crate::error::ExecutionError;
use crate::state::RunState;

/// An immutable snapshot of a run's continuation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Owning run.
    pub run_id: RunId,
    /// Per-run position, starting at [`CheckpointId::FIRST`].
    pub checkpoint_id: CheckpointId,
    /// Encoded [`RunState`].
    pub state_payload: Value,
    /// Write time.
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Decode the payload.
    pub fn state(&self) -> Result<RunState, ExecutionError> {
        RunState::from_payload(&self.state_payload)
    }
}
