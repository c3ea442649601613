//! Effect ledger records.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use spire_core::{EffectId, RunId, TicketId};

use crate::error::ExecutionError;

/// Ledger state of a side effect.
///
/// ```text
/// prepared → committed
///          → aborted
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectStatus {
    /// Recorded; the action may or may not have run.
    Prepared,
    /// The action ran and its result is authoritative.
    Committed,
    /// The action must never run.
    Aborted,
}

impl EffectStatus {
    /// Every effect status.
    pub const ALL: [Self; 3] = [Self::Prepared, Self::Committed, Self::Aborted];

    /// Stable lowercase name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Prepared => "prepared",
            Self::Committed => "committed",
            Self::Aborted => "aborted",
        }
    }
}

impl std::fmt::Display for EffectStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EffectStatus {
    type Err = ExecutionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ExecutionError::unknown("effect status", s))
    }
}

/// One row of the effect ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Effect {
    /// Content-derived key.
    pub effect_id: EffectId,
    /// Run that requested the effect.
    pub run_id: RunId,
    /// Action name.
    pub action: String,
    /// Ledger state.
    pub status: EffectStatus,
    /// Parameters as requested.
    pub prepared_payload: Value,
    /// Action result once committed.
    pub result_payload: Option<Value>,
    /// Ticket gating this effect, if any.
    pub ticket_id: Option<TicketId>,
    /// Prepare time.
    pub created_at: DateTime<Utc>,
    /// Commit time.
    pub committed_at: Option<DateTime<Utc>>,
}

impl Effect {
    /// The stored result, if committed.
    #[must_use]
    pub fn committed_result(&self) -> Option<&Value> {
        match self.status {
            EffectStatus::Committed => self.result_payload.as_ref(),
            EffectStatus::Prepared | EffectStatus::Aborted => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_names_roundtrip() {
        for status in EffectStatus::ALL {
            assert_eq!(status.as_str().parse::<EffectStatus>().unwrap(), status);
        }
        assert!("done".parse::<EffectStatus>().is_err());
    }

    #[test]
    fn committed_result_only_when_committed() {
        let mut effect = Effect {
            effect_id: EffectId::from_digest([3u8; 32]),
            run_id: RunId::v4(),
            action: "issue_refund".into(),
            status: EffectStatus::Prepared,
            prepared_payload: json!({ "amount_cents": 100 }),
            result_payload: Some(json!({ "refund_id": "r-1" })),
            ticket_id: None,
            created_at: Utc::now(),
            committed_at: None,
        };
        assert!(effect.committed_result().is_none());
        effect.status = EffectStatus::Committed;
        assert_eq!(effect.committed_result(), Some(&json!({ "refund_id": "r-1" })));
    }
}
