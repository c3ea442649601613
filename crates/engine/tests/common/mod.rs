//! Shared fixtures for engine integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use spire_core::{RunId, TenantId, WorkflowId};
use spire_engine::{
    ActionCall, ActionError, ActionHandler, ApprovalRequest, Caller, EffectRequest, Engine,
    EngineConfig, FnStep, StartOptions, StepError, StepOutcome, Workflow,
};
use spire_execution::{Effect, EventKind, RiskLevel, Run, RunState};
use spire_ports::{CheckpointStore, EffectLedger, RunRepo, Store};
use spire_store_memory::MemoryStore;

/// Records every invocation; optionally fails them all.
#[derive(Default)]
pub struct CountingAction {
    calls: AtomicUsize,
    fail_with: Option<ActionError>,
}

impl CountingAction {
    pub fn failing(err: ActionError) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail_with: Some(err),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ActionHandler for CountingAction {
    async fn invoke(&self, call: &ActionCall) -> Result<Value, ActionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = &self.fail_with {
            return Err(err.clone());
        }
        Ok(json!({
            "receipt": format!("rc-{}", &call.effect_id.as_str()[..12]),
            "params": call.params,
        }))
    }
}

pub fn config() -> EngineConfig {
    EngineConfig {
        worker_name: "test".into(),
        workers: 4,
        poll_interval: Duration::from_millis(5),
        lease_ttl: Duration::from_secs(5),
        step_timeout: Duration::from_secs(2),
        action_timeout: Duration::from_secs(2),
        sweep_interval: Duration::from_millis(20),
        default_ticket_ttl: Some(Duration::from_secs(3600)),
        notification_capacity: 64,
    }
}

pub fn workflow_id(raw: &str) -> WorkflowId {
    WorkflowId::new(raw).unwrap()
}

/// validate_refund → approve_refund (gates issue_refund) → notify_customer.
pub fn refund_workflow() -> Workflow {
    Workflow::new(workflow_id("refund"))
        .step(FnStep::new("validate_refund", |ctx| {
            let amount = ctx.input["amount_cents"].as_i64().unwrap_or_default();
            if amount <= 0 {
                return Err(StepError::permanent("amount must be positive"));
            }
            Ok(StepOutcome::Next(json!({
                "order_id": ctx.input["order_id"].clone(),
                "amount_cents": amount,
            })))
        }))
        .step(FnStep::new("approve_refund", |ctx| {
            let params = json!({
                "order_id": ctx.data["order_id"].clone(),
                "amount_cents": ctx.data["amount_cents"].clone(),
            });
            Ok(StepOutcome::NeedsApproval(
                ApprovalRequest::new("refund_approval", RiskLevel::High)
                    .with_context(ctx.data.clone())
                    .gating(EffectRequest::new("issue_refund", params)),
            ))
        }))
        .step(FnStep::new("notify_customer", |ctx| {
            let refund = ctx.output("approve_refund").cloned().unwrap_or(Value::Null);
            Ok(StepOutcome::Next(json!({ "refund": refund, "notified": true })))
        }))
}

pub struct Harness {
    pub engine: Engine,
    pub store: Arc<dyn Store>,
    pub caller: Caller,
    pub refunds: Arc<CountingAction>,
}

pub fn harness() -> Harness {
    harness_with(config(), CountingAction::default())
}

pub fn harness_with(config: EngineConfig, refunds: CountingAction) -> Harness {
    harness_on(Arc::new(MemoryStore::new()), config, refunds)
}

pub fn harness_on(store: Arc<dyn Store>, config: EngineConfig, refunds: CountingAction) -> Harness {
    let engine = Engine::new(store.clone(), config).unwrap();
    let refunds = Arc::new(refunds);
    engine.register_workflow(refund_workflow()).unwrap();
    engine.register_action("issue_refund", refunds.clone());
    Harness {
        engine,
        store,
        caller: Caller::new(TenantId::v4(), "reviewer"),
        refunds,
    }
}

impl Harness {
    pub async fn start(&self, workflow: &str, input: Value) -> RunId {
        self.engine
            .control()
            .start_run(&self.caller, workflow, input, StartOptions::default())
            .await
            .unwrap()
    }

    pub async fn start_refund(&self) -> RunId {
        self.start("refund", json!({ "order_id": "o-1", "amount_cents": 4200 }))
            .await
    }

    pub async fn drain(&self) -> usize {
        self.engine.dispatcher().drain().await.unwrap()
    }

    pub async fn run(&self, run_id: RunId) -> Run {
        self.store.get_run(run_id).await.unwrap().unwrap()
    }

    pub async fn kinds(&self, run_id: RunId) -> Vec<EventKind> {
        self.engine
            .timeline()
            .collect(run_id)
            .await
            .unwrap()
            .into_iter()
            .map(|event| event.event_type)
            .collect()
    }

    pub async fn lifecycle(&self, run_id: RunId) -> Vec<EventKind> {
        self.kinds(run_id)
            .await
            .into_iter()
            .filter(EventKind::is_lifecycle)
            .collect()
    }

    pub async fn effects(&self, run_id: RunId) -> Vec<Effect> {
        self.store.effects_for_run(run_id).await.unwrap()
    }

    pub async fn final_state(&self, run_id: RunId) -> RunState {
        self.store
            .latest_checkpoint(run_id)
            .await
            .unwrap()
            .unwrap()
            .state()
            .unwrap()
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.engine.telemetry().metrics().counter(name).get()
    }
}
