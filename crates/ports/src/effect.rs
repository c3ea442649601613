//! Effect ledger port.

use async_trait::async_trait;
use serde_json::Value;
use spire_core::{EffectId, RunId, TicketId};
use spire_execution::Effect;

use crate::error::PortsError;

/// Input for [`EffectLedger::prepare_effect`].
#[derive(Debug, Clone)]
pub struct NewEffect {
    /// Content-derived key.
    pub effect_id: EffectId,
    /// Requesting run.
    pub run_id: RunId,
    /// Action name.
    pub action: String,
    /// Action parameters.
    pub params: Value,
    /// Ticket gating the effect, if any.
    pub ticket_id: Option<TicketId>,
}

/// Result of [`EffectLedger::prepare_effect`].
#[derive(Debug, Clone)]
pub enum PrepareOutcome {
    /// A new `prepared` row was written.
    Prepared(Effect),
    /// A row with this key already existed; returned unchanged.
    AlreadyExists(Effect),
}

impl PrepareOutcome {
    /// The stored effect, whichever way it was obtained.
    #[must_use]
    pub fn into_effect(self) -> Effect {
        match self {
            Self::Prepared(effect) | Self::AlreadyExists(effect) => effect,
        }
    }
}

/// Exactly-once bookkeeping for side effects.
///
/// At most one row exists per effect id. `prepared → committed` and
/// `prepared → aborted` are the only changes; a committed result is final.
#[async_trait]
pub trait EffectLedger: Send + Sync {
    /// Record intent. Idempotent on `effect_id`.
    async fn prepare_effect(&self, new: NewEffect) -> Result<PrepareOutcome, PortsError>;

    /// Store the result of a prepared effect. Any other state is `InvalidState`.
    async fn commit_effect(&self, effect_id: &EffectId, result: Value) -> Result<Effect, PortsError>;

    /// Mark a prepared effect as never to run. Idempotent on `aborted`;
    /// `committed` is `InvalidState`.
    async fn abort_effect(&self, effect_id: &EffectId) -> Result<Effect, PortsError>;

    /// Fetch an effect.
    async fn lookup_effect(&self, effect_id: &EffectId) -> Result<Option<Effect>, PortsError>;

    /// Every effect of a run, oldest first.
    async fn effects_for_run(&self, run_id: RunId) -> Result<Vec<Effect>, PortsError>;
}
