//! Error types for port operations.
//!
//! Every port method returns `Result<_, PortsError>`. Store drivers map
//! their internal errors into these variants so the engine can make
//! retry/fail decisions without knowing the concrete backend.

use std::time::Duration;

/// Error type for all port operations.
///
/// Distinguishes retryable failures (connection, timeout) from permanent
/// ones (not found, conflict, invalid state) so the engine can decide
/// whether a run should be retried later or failed now.
#[derive(Debug, thiserror::Error)]
pub enum PortsError {
    /// Entity not found.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Kind of entity (e.g. "run", "ticket").
        entity: String,
        /// Identifier that was looked up.
        id: String,
    },

    /// Optimistic concurrency conflict on a checkpoint id.
    #[error("{entity} {id}: expected checkpoint {expected}, found {actual}")]
    Conflict {
        /// Kind of entity.
        entity: String,
        /// Identifier of the conflicting entity.
        id: String,
        /// Checkpoint the caller expected.
        expected: u64,
        /// Checkpoint currently stored (0 when none).
        actual: u64,
    },

    /// A ticket was already decided or expired with a different outcome.
    #[error("ticket {ticket_id} already {status}")]
    AlreadyDecided {
        /// The ticket.
        ticket_id: String,
        /// Its final status.
        status: String,
    },

    /// A record is not in the state the operation requires.
    #[error("{entity} {id} is {actual}, expected {expected}")]
    InvalidState {
        /// Kind of entity.
        entity: String,
        /// Identifier.
        id: String,
        /// Required state.
        expected: String,
        /// Current state.
        actual: String,
    },

    /// A run status change the state machine does not allow.
    #[error("run {run_id}: invalid transition from {from} to {to}")]
    InvalidTransition {
        /// The run.
        run_id: String,
        /// Current status.
        from: String,
        /// Attempted status.
        to: String,
    },

    /// Backend connection failure.
    #[error("connection error: {0}")]
    Connection(String),

    /// Serialization or deserialization failure.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Operation exceeded its timeout.
    #[error("timeout: {operation} after {duration:?}")]
    Timeout {
        /// Name of the operation that timed out.
        operation: String,
        /// How long was waited before giving up.
        duration: Duration,
    },

    /// The caller's claim on the run was lost to another worker.
    #[error("lease unavailable for run {run_id}")]
    LeaseUnavailable {
        /// The run whose claim is gone.
        run_id: String,
    },

    /// Catch-all internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl PortsError {
    /// Convenience constructor for [`PortsError::NotFound`].
    pub fn not_found(entity: impl Into<String>, id: impl ToString) -> Self {
        Self::NotFound {
            entity: entity.into(),
            id: id.to_string(),
        }
    }

    /// Convenience constructor for [`PortsError::Conflict`].
    pub fn conflict(entity: impl Into<String>, id: impl ToString, expected: u64, actual: u64) -> Self {
        Self::Conflict {
            entity: entity.into(),
            id: id.to_string(),
            expected,
            actual,
        }
    }

    /// Convenience constructor for [`PortsError::InvalidState`].
    pub fn invalid_state(
        entity: impl Into<String>,
        id: impl ToString,
        expected: impl ToString,
        actual: impl ToString,
    ) -> Self {
        Self::InvalidState {
            entity: entity.into(),
            id: id.to_string(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    /// Convenience constructor for [`PortsError::LeaseUnavailable`].
    pub fn lease_unavailable(run_id: impl ToString) -> Self {
        Self::LeaseUnavailable {
            run_id: run_id.to_string(),
        }
    }

    /// Convenience constructor for [`PortsError::Timeout`].
    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration,
        }
    }

    /// Returns `true` for transient errors that may succeed if retried.
    ///
    /// Currently [`Connection`](Self::Connection) and [`Timeout`](Self::Timeout).
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Timeout { .. })
    }

    /// Returns `true` for optimistic-concurrency rejections.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::AlreadyDecided { .. })
    }
}

impl From<serde_json::Error> for PortsError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<spire_execution::ExecutionError> for PortsError {
    fn from(err: spire_execution::ExecutionError) -> Self {
        Self::Serialization(err.to_string())
    }
}
