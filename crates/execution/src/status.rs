//! Run-level status tracking.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ExecutionError;

/// The overall status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Created, waiting for a worker to claim it.
    Queued,
    /// A worker is executing steps.
    Running,
    /// Parked on a ticket; holds no worker.
    WaitingApproval,
    /// All steps finished.
    Completed,
    /// A step, an approval or the engine failed the run.
    Failed,
    /// Cancelled by an external request.
    Canceled,
}

impl RunStatus {
    /// Every status, in state-machine order.
    pub const ALL: [Self; 6] = [
        Self::Queued,
        Self::Running,
        Self::WaitingApproval,
        Self::Completed,
        Self::Failed,
        Self::Canceled,
    ];

    /// Returns `true` if the run has reached a final state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }

    /// Returns `true` if the run is parked waiting for a human decision.
    #[must_use]
    pub fn is_parked(&self) -> bool {
        matches!(self, Self::WaitingApproval)
    }

    /// Stable lowercase name, used in storage columns and on the wire.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::WaitingApproval => "waiting_approval",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = ExecutionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ExecutionError::unknown("run status", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Canceled.is_terminal());

        assert!(!RunStatus::Queued.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(!RunStatus::WaitingApproval.is_terminal());
    }

    #[test]
    fn only_waiting_approval_is_parked() {
        for status in RunStatus::ALL {
            assert_eq!(status.is_parked(), status == RunStatus::WaitingApproval);
        }
    }

    #[test]
    fn display_matches_serde_name() {
        for status in RunStatus::ALL {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{status}\""));
        }
    }

    #[test]
    fn parse_roundtrips_every_status() {
        for status in RunStatus::ALL {
            assert_eq!(status.as_str().parse::<RunStatus>().unwrap(), status);
        }
    }

    #[test]
    fn parse_rejects_unknown() {
        let err = "paused".parse::<RunStatus>().unwrap_err();
        assert_eq!(err.to_string(), "unknown run status: \"paused\"");
    }
}
