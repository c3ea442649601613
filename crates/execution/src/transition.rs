//! State machine transition validation for runs.
//!
//! ```text
//! queued → running → { waiting_approval ⇄ running } → { completed | failed | canceled }
//! ```
//!
//! `waiting_approval → failed` covers rejected and expired tickets; every
//! non-terminal state may move to `canceled`.

use crate::error::ExecutionError;
use crate::status::RunStatus;

/// Returns `true` if the run-level transition from `from` to `to` is valid.
#[must_use]
pub fn can_transition_run(from: RunStatus, to: RunStatus) -> bool {
    matches!(
        (from, to),
        (RunStatus::Queued, RunStatus::Running)
            | (RunStatus::Queued, RunStatus::Canceled)
            | (RunStatus::Running, RunStatus::WaitingApproval)
            | (RunStatus::Running, RunStatus::Completed)
            | (RunStatus::Running, RunStatus::Failed)
            | (RunStatus::Running, RunStatus::Canceled)
            | (RunStatus::WaitingApproval, RunStatus::Running)
            | (RunStatus::WaitingApproval, RunStatus::Failed)
            | (RunStatus::WaitingApproval, RunStatus::Canceled)
    )
}

/// Validate a run-level transition, returning an error if invalid.
pub fn validate_run_transition(from: RunStatus, to: RunStatus) -> Result<(), ExecutionError> {
    if can_transition_run(from, to) {
        Ok(())
    } else {
        Err(ExecutionError::invalid_run_transition(from, to))
    }
}
