//! Engine error types.

use spire_execution::IdempotencyError;
use spire_ports::PortsError;

/// Errors surfaced by the control surface and engine setup.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The request is malformed; nothing was written.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The entity does not exist or belongs to another tenant.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Entity kind (`run`, `ticket`).
        entity: String,
        /// Requested identifier.
        id: String,
    },

    /// Optimistic concurrency rejected the write.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The entity is in a state that does not allow the operation.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Configuration the engine cannot run with.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Storage failure.
    #[error("store error: {0}")]
    Store(#[source] PortsError),
}

impl EngineError {
    /// Shorthand for [`EngineError::NotFound`].
    pub fn not_found(entity: impl Into<String>, id: impl ToString) -> Self {
        Self::NotFound {
            entity: entity.into(),
            id: id.to_string(),
        }
    }

    /// Whether retrying the same call may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Store(err) if err.is_retryable())
    }
}

impl From<PortsError> for EngineError {
    fn from(err: PortsError) -> Self {
        match err {
            PortsError::NotFound { entity, id } => Self::NotFound { entity, id },
            PortsError::Conflict { .. } | PortsError::AlreadyDecided { .. } => {
                Self::Conflict(err.to_string())
            }
            PortsError::InvalidState { .. } | PortsError::InvalidTransition { .. } => {
                Self::InvalidState(err.to_string())
            }
            other => Self::Store(other),
        }
    }
}

impl From<IdempotencyError> for EngineError {
    fn from(err: IdempotencyError) -> Self {
        Self::Validation(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    #[test]
    fn port_errors_are_classified() {
        assert!(matches!(
            EngineError::from(PortsError::not_found("run", "r-1")),
            EngineError::NotFound { ref entity, .. } if entity == "run"
        ));
        assert!(matches!(
            EngineError::from(PortsError::conflict("ticket", "t", 2, 3)),
            EngineError::Conflict(_)
        ));
        assert!(matches!(
            EngineError::from(PortsError::invalid_state("run", "r", "non-terminal", "completed")),
            EngineError::InvalidState(_)
        ));
        assert!(matches!(
            EngineError::from(PortsError::Internal("boom".into())),
            EngineError::Store(_)
        ));
    }

    #[test]
    fn only_transient_store_errors_are_retryable() {
        assert!(EngineError::from(PortsError::timeout("claim", Duration::from_secs(1))).is_retryable());
        assert!(!EngineError::Validation("bad".into()).is_retryable());
        assert!(!EngineError::from(PortsError::Internal("boom".into())).is_retryable());
    }

    #[test]
    fn conflict_display_keeps_checkpoint_numbers() {
        let err = EngineError::from(PortsError::conflict("ticket", "t-1", 2, 4));
        assert_eq!(err.to_string(), "conflict: ticket t-1: expected checkpoint 2, found 4");
    }
}
