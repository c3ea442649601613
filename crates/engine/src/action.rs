//! Action handlers: the clients that actually touch the outside world.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use spire_core::{EffectId, RunId, TenantId, TicketId};

/// One invocation of an action.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionCall {
    /// Run performing the effect.
    pub run_id: RunId,
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Action name.
    pub action: String,
    /// Parameters.
    pub params: Value,
    /// Ledger key; pass it to the remote system as its idempotency key.
    pub effect_id: EffectId,
    /// Approval ticket gating this call, if any.
    pub ticket_id: Option<TicketId>,
}

/// Why an action did not produce a result.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ActionError {
    /// The remote side definitively refused; nothing happened.
    #[error("rejected: {0}")]
    Rejected(String),
    /// The outcome is unknown; the effect may or may not have happened.
    #[error("outcome unknown: {0}")]
    Ambiguous(String),
}

/// Performs a named side effect.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// Perform the call, returning the result to record in the ledger.
    async fn invoke(&self, call: &ActionCall) -> Result<Value, ActionError>;
}

/// Thread-safe registry of action handlers keyed by action name.
#[derive(Default)]
pub struct ActionRegistry {
    handlers: DashMap<String, Arc<dyn ActionHandler>>,
}

impl ActionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `name`, replacing any previous one.
    pub fn register(&self, name: impl Into<String>, handler: Arc<dyn ActionHandler>) {
        let name = name.into();
        tracing::info!(action = %name, "registered action handler");
        self.handlers.insert(name, handler);
    }

    /// Handler for `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn ActionHandler>> {
        self.handlers.get(name).map(|entry| entry.value().clone())
    }

    /// Whether `name` has a handler.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Number of registered handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no handler is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<String> = self.handlers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        f.debug_struct("ActionRegistry").field("actions", &names).finish()
    }
}
