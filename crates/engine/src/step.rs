//! Step contract: the user task logic a workflow is made of.
//!
//! A step is a pure-ish function of the [`StepContext`]. It never touches the
//! store; it tells the orchestrator what to do next through a
//! [`StepOutcome`]. Side effects are requested, not performed, so the
//! orchestrator can route them through the effect ledger.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use spire_core::{RunId, TenantId, WorkflowId};
use spire_execution::{DecisionRecord, RiskLevel};

/// How often a failing step is retried in-process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles on every further attempt.
    pub backoff: Duration,
}

impl RetryPolicy {
    /// Run once, never retry.
    pub const NONE: Self = Self {
        max_attempts: 1,
        backoff: Duration::ZERO,
    };

    /// Retry up to `max_attempts` total attempts.
    #[must_use]
    pub const fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts,
            backoff,
        }
    }

    /// Delay after the failed `attempt` (1-based).
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let doublings = attempt.saturating_sub(1).min(16);
        self.backoff.saturating_mul(1 << doublings)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::NONE
    }
}

/// A step failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct StepError {
    message: String,
    retryable: bool,
}

impl StepError {
    /// A failure worth retrying (timeouts, flaky dependencies).
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    /// A failure that retrying will not fix.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }

    /// The error message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Whether the retry policy applies.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.retryable
    }
}

/// A side-effecting action the step wants performed exactly once.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectRequest {
    /// Registered action name.
    pub action: String,
    /// Action parameters. Floats are rejected; use integer minor units.
    pub params: Value,
}

impl EffectRequest {
    /// Request `action` with `params`.
    pub fn new(action: impl Into<String>, params: Value) -> Self {
        Self {
            action: action.into(),
            params,
        }
    }
}

/// A request to pause until a human decides.
#[derive(Debug, Clone, PartialEq)]
pub struct ApprovalRequest {
    /// Stable name of the interrupt within the step.
    pub interrupt_id: String,
    /// Risk classification shown in the inbox.
    pub risk_level: RiskLevel,
    /// Everything the reviewer needs to decide.
    pub context_pack: Value,
    /// Effect to perform once approved.
    pub action: Option<EffectRequest>,
    /// Decision deadline; falls back to the engine default.
    pub expires_in: Option<Duration>,
}

impl ApprovalRequest {
    /// Ask for approval at `risk_level`.
    pub fn new(interrupt_id: impl Into<String>, risk_level: RiskLevel) -> Self {
        Self {
            interrupt_id: interrupt_id.into(),
            risk_level,
            context_pack: Value::Object(serde_json::Map::new()),
            action: None,
            expires_in: None,
        }
    }

    /// Attach the reviewer's context.
    #[must_use]
    pub fn with_context(mut self, context_pack: Value) -> Self {
        self.context_pack = context_pack;
        self
    }

    /// Gate `effect` behind the decision.
    #[must_use]
    pub fn gating(mut self, effect: EffectRequest) -> Self {
        self.action = Some(effect);
        self
    }

    /// Expire the ticket after `ttl`.
    #[must_use]
    pub fn expires_in(mut self, ttl: Duration) -> Self {
        self.expires_in = Some(ttl);
        self
    }
}

/// What a step wants to happen next.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// Replace the run data and advance.
    Next(Value),
    /// Perform an effect; its result lands in `outputs[step]`.
    SideEffect(EffectRequest),
    /// Park the run on a ticket.
    NeedsApproval(ApprovalRequest),
}

impl StepOutcome {
    /// Shorthand for [`StepOutcome::SideEffect`].
    pub fn effect(action: impl Into<String>, params: Value) -> Self {
        Self::SideEffect(EffectRequest::new(action, params))
    }
}

/// Read-only view of the run handed to a step.
#[derive(Debug, Clone)]
pub struct StepContext {
    /// The run.
    pub run_id: RunId,
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Workflow being executed.
    pub workflow_id: WorkflowId,
    /// Name of the step being executed.
    pub step: String,
    /// Index of the step.
    pub position: usize,
    /// Attempt number, starting at 1.
    pub attempt: u32,
    /// Start payload.
    pub input: Value,
    /// Current run data.
    pub data: Value,
    /// Effect results by step name.
    pub outputs: BTreeMap<String, Value>,
    /// Approval decisions by step name.
    pub decisions: BTreeMap<String, DecisionRecord>,
}

impl StepContext {
    /// Effect result recorded by `step`.
    #[must_use]
    pub fn output(&self, step: &str) -> Option<&Value> {
        self.outputs.get(step)
    }

    /// Decision recorded for `step`.
    #[must_use]
    pub fn decision(&self, step: &str) -> Option<&DecisionRecord> {
        self.decisions.get(step)
    }
}

/// One unit of user task logic.
#[async_trait]
pub trait Step: Send + Sync {
    /// Name, unique within the workflow. Used as the effect stage.
    fn name(&self) -> &str;

    /// Retry policy for this step.
    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::NONE
    }

    /// Execute the step.
    async fn execute(&self, ctx: &StepContext) -> Result<StepOutcome, StepError>;
}

type StepFn = dyn Fn(&StepContext) -> Result<StepOutcome, StepError> + Send + Sync;

/// A [`Step`] backed by a synchronous closure.
pub struct FnStep {
    name: String,
    retry: RetryPolicy,
    f: Arc<StepFn>,
}

impl FnStep {
    /// Wrap `f` as a step called `name`.
    pub fn new<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&StepContext) -> Result<StepOutcome, StepError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            retry: RetryPolicy::NONE,
            f: Arc::new(f),
        }
    }

    /// Set the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

impl std::fmt::Debug for FnStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnStep")
            .field("name", &self.name)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Step for FnStep {
    fn name(&self) -> &str {
        &self.name
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    async fn execute(&self, ctx: &StepContext) -> Result<StepOutcome, StepError> {
        (self.f)(ctx)
    }
}
