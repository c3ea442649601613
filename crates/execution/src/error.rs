//! Execution error types.

use thiserror::Error;

use crate::idempotency::IdempotencyError;
use crate::status::RunStatus;

/// Errors raised while validating or decoding execution records.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// A state transition is not valid for the current status.
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition {
        /// Current status.
        from: String,
        /// Attempted target status.
        to: String,
    },

    /// A checkpoint payload was written by an incompatible schema.
    #[error("unsupported run state schema version {found} (expected {expected})")]
    UnsupportedSchema {
        /// Version found in the payload.
        found: u32,
        /// Version this build understands.
        expected: u32,
    },

    /// A stored enum column held an unknown value.
    #[error("unknown {kind}: {value:?}")]
    UnknownValue {
        /// Which enum was being parsed.
        kind: &'static str,
        /// The rejected value.
        value: String,
    },

    /// Effect key derivation rejected its input.
    #[error(transparent)]
    Idempotency(#[from] IdempotencyError),

    /// A serialization or deserialization error.
    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ExecutionError {
    /// Create an invalid-transition error from run statuses.
    pub fn invalid_run_transition(from: RunStatus, to: RunStatus) -> Self {
        Self::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    pub(crate) fn unknown(kind: &'static str, value: &str) -> Self {
        Self::UnknownValue {
            kind,
            value: value.to_owned(),
        }
    }
}
