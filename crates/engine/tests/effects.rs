//! Exactly-once effects, crash recovery and step failure handling.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use common::{CountingAction, Harness, config, harness, harness_with, workflow_id};
use pretty_assertions::assert_eq;
use serde_json::json;
use spire_core::WorkerId;
use spire_engine::{
    ActionError, FnStep, RetryPolicy, Step, StepContext, StepError, StepOutcome, Workflow,
};
use spire_execution::{
    EffectStatus, EventKind, PendingCommit, RunState, RunStatus, derive_effect_id,
};
use spire_ports::{CheckpointStore, EffectLedger, NewEffect, RunRepo};
use spire_telemetry::names;

fn charge_workflow() -> Workflow {
    Workflow::new(workflow_id("charge"))
        .step(FnStep::new("charge", |_| {
            Ok(StepOutcome::effect("charge_card", json!({ "amount_cents": 100 })))
        }))
        .step(FnStep::new("receipt", |ctx| {
            Ok(StepOutcome::Next(json!({ "charged": ctx.output("charge").cloned() })))
        }))
}

fn with_charges(h: &Harness, charges: CountingAction) -> Arc<CountingAction> {
    let charges = Arc::new(charges);
    h.engine.register_workflow(charge_workflow()).unwrap();
    h.engine.register_action("charge_card", charges.clone());
    charges
}

#[tokio::test]
async fn effects_run_once_and_land_in_outputs() {
    let h = harness();
    let charges = with_charges(&h, CountingAction::default());
    let run_id = h.start("charge", json!({})).await;

    h.drain().await;
    assert_eq!(h.run(run_id).await.status, RunStatus::Completed);
    assert_eq!(charges.calls(), 1);

    let effects = h.effects(run_id).await;
    assert_eq!(effects.len(), 1);
    assert_eq!(effects[0].status, EffectStatus::Committed);
    let expected = derive_effect_id(run_id, "charge_card", &json!({ "amount_cents": 100 }), "charge")
        .unwrap();
    assert_eq!(effects[0].effect_id, expected);

    let state = h.final_state(run_id).await;
    assert_eq!(Some(&state.outputs["charge"]), effects[0].result_payload.as_ref());
    assert_eq!(Some(&state.data["charged"]), effects[0].result_payload.as_ref());
    assert!(state.pending_commit.is_none());
    assert!(h.kinds(run_id).await.contains(&EventKind::EffectCommitted));
}

#[tokio::test]
async fn committed_effects_are_replayed_not_reinvoked() {
    let h = harness();
    let charges = with_charges(&h, CountingAction::default());
    let run_id = h.start("charge", json!({})).await;

    let params = json!({ "amount_cents": 100 });
    let effect_id = derive_effect_id(run_id, "charge_card", &params, "charge").unwrap();
    h.store
        .prepare_effect(NewEffect {
            effect_id: effect_id.clone(),
            run_id,
            action: "charge_card".into(),
            params,
            ticket_id: None,
        })
        .await
        .unwrap();
    h.store
        .commit_effect(&effect_id, json!({ "charge_id": "ch-1" }))
        .await
        .unwrap();

    h.drain().await;
    assert_eq!(h.run(run_id).await.status, RunStatus::Completed);
    assert_eq!(charges.calls(), 0);
    assert_eq!(h.counter(names::EFFECTS_REPLAYED), 1);
    assert_eq!(h.counter(names::EFFECTS_COMMITTED), 0);

    let kinds = h.kinds(run_id).await;
    assert!(kinds.contains(&EventKind::EffectReplayed));
    assert!(!kinds.contains(&EventKind::EffectCommitted));
    let state = h.final_state(run_id).await;
    assert_eq!(state.outputs["charge"], json!({ "charge_id": "ch-1" }));
}

#[tokio::test]
async fn pending_commit_is_settled_on_recovery() {
    let h = harness();
    let charges = with_charges(&h, CountingAction::default());
    let run_id = h.start("charge", json!({})).await;

    // A worker that checkpointed the result and died before committing.
    let crashed = WorkerId::new("crashed-0").unwrap();
    let claimed = h
        .store
        .claim_next(&crashed, Duration::from_secs(5), Utc::now())
        .await
        .unwrap()
        .unwrap();
    h.store
        .transition(&claimed.claim, RunStatus::Running, None, Utc::now())
        .await
        .unwrap();
    let params = json!({ "amount_cents": 100 });
    let effect_id = derive_effect_id(run_id, "charge_card", &params, "charge").unwrap();
    h.store
        .prepare_effect(NewEffect {
            effect_id: effect_id.clone(),
            run_id,
            action: "charge_card".into(),
            params,
            ticket_id: None,
        })
        .await
        .unwrap();
    let mut state = RunState::initial(json!({}));
    h.store
        .append_checkpoint(run_id, state.to_payload().unwrap())
        .await
        .unwrap();
    let result = json!({ "charge_id": "ch-9" });
    state.position = 1;
    state.outputs.insert("charge".into(), result.clone());
    state.pending_commit = Some(PendingCommit {
        effect_id: effect_id.clone(),
        step: "charge".into(),
        action: "charge_card".into(),
        result: result.clone(),
    });
    h.store
        .append_checkpoint(run_id, state.to_payload().unwrap())
        .await
        .unwrap();
    h.store.release_claim(&claimed.claim).await.unwrap();

    h.drain().await;
    assert_eq!(h.run(run_id).await.status, RunStatus::Completed);
    assert_eq!(charges.calls(), 0);
    let effect = h.store.lookup_effect(&effect_id).await.unwrap().unwrap();
    assert_eq!(effect.status, EffectStatus::Committed);
    assert_eq!(effect.result_payload, Some(result.clone()));
    assert_eq!(h.final_state(run_id).await.data["charged"], result);
    assert!(h.kinds(run_id).await.contains(&EventKind::EffectCommitted));
}

#[tokio::test]
async fn rejected_actions_abort_the_effect() {
    let h = harness();
    let charges = with_charges(
        &h,
        CountingAction::failing(ActionError::Rejected("card declined".into())),
    );
    let run_id = h.start("charge", json!({})).await;

    h.drain().await;
    let run = h.run(run_id).await;
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(
        run.last_error.as_deref(),
        Some("step: charge: action charge_card rejected: card declined")
    );
    assert_eq!(charges.calls(), 1);
    assert_eq!(h.effects(run_id).await[0].status, EffectStatus::Aborted);
}

#[tokio::test]
async fn ambiguous_actions_leave_the_effect_prepared() {
    let h = harness();
    with_charges(
        &h,
        CountingAction::failing(ActionError::Ambiguous("connection reset".into())),
    );
    let run_id = h.start("charge", json!({})).await;

    h.drain().await;
    let run = h.run(run_id).await;
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.last_error.unwrap().contains("outcome unknown"));
    assert_eq!(h.effects(run_id).await[0].status, EffectStatus::Prepared);
}

#[tokio::test]
async fn float_parameters_fail_the_step() {
    let h = harness();
    h.engine
        .register_workflow(Workflow::new(workflow_id("floaty")).step(FnStep::new("pay", |_| {
            Ok(StepOutcome::effect("charge_card", json!({ "amount": 1.5 })))
        })))
        .unwrap();
    let run_id = h.start("floaty", json!({})).await;

    h.drain().await;
    let run = h.run(run_id).await;
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.last_error.unwrap().starts_with("step: pay:"));
    assert!(h.effects(run_id).await.is_empty());
}

#[tokio::test]
async fn missing_action_handlers_are_fatal() {
    let h = harness();
    h.engine
        .register_workflow(Workflow::new(workflow_id("orphan")).step(FnStep::new("call", |_| {
            Ok(StepOutcome::effect("nobody_home", json!({})))
        })))
        .unwrap();
    let run_id = h.start("orphan", json!({})).await;

    h.drain().await;
    let run = h.run(run_id).await;
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.last_error.unwrap().starts_with("fatal:"));
    assert_eq!(h.counter(names::RUNS_FAILED), 1);
}

#[tokio::test]
async fn retryable_step_errors_are_retried() {
    let h = harness();
    let attempts = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&attempts);
    let flaky = FnStep::new("flaky", move |ctx| {
        let n = seen.fetch_add(1, Ordering::SeqCst) + 1;
        assert_eq!(ctx.attempt as usize, n);
        if n < 3 {
            Err(StepError::retryable(format!("attempt {n} failed")))
        } else {
            Ok(StepOutcome::Next(json!({ "attempts": n })))
        }
    })
    .with_retry(RetryPolicy::new(3, Duration::from_millis(1)));
    h.engine
        .register_workflow(Workflow::new(workflow_id("flaky")).step(flaky))
        .unwrap();
    let run_id = h.start("flaky", json!({})).await;

    h.drain().await;
    assert_eq!(h.run(run_id).await.status, RunStatus::Completed);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    let retries = h
        .kinds(run_id)
        .await
        .into_iter()
        .filter(|kind| *kind == EventKind::StepRetrying)
        .count();
    assert_eq!(retries, 2);
    assert_eq!(h.counter(names::STEPS_EXECUTED), 3);
}

#[tokio::test]
async fn permanent_errors_skip_the_retry_policy() {
    let h = harness();
    let attempts = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&attempts);
    let broken = FnStep::new("broken", move |_| {
        seen.fetch_add(1, Ordering::SeqCst);
        Err(StepError::permanent("bad input"))
    })
    .with_retry(RetryPolicy::new(5, Duration::from_millis(1)));
    h.engine
        .register_workflow(Workflow::new(workflow_id("broken")).step(broken))
        .unwrap();
    let run_id = h.start("broken", json!({})).await;

    h.drain().await;
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert_eq!(
        h.run(run_id).await.last_error.as_deref(),
        Some("step: broken: bad input")
    );
}

struct Sleepy;

#[async_trait]
impl Step for Sleepy {
    fn name(&self) -> &str {
        "sleepy"
    }

    async fn execute(&self, _ctx: &StepContext) -> Result<StepOutcome, StepError> {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(StepOutcome::Next(json!({})))
    }
}

#[tokio::test]
async fn step_timeouts_fail_the_run() {
    let h = harness_with(
        spire_engine::EngineConfig {
            step_timeout: Duration::from_millis(20),
            ..config()
        },
        CountingAction::default(),
    );
    h.engine
        .register_workflow(Workflow::new(workflow_id("sleepy")).step(Sleepy))
        .unwrap();
    let run_id = h.start("sleepy", json!({})).await;

    h.drain().await;
    let run = h.run(run_id).await;
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.last_error.unwrap().contains("timed out"));
}
