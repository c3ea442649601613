//! Bundled `refund` workflow for trying the server out.
//!
//! `validate_refund` checks the input, `approve_refund` parks on a high-risk
//! ticket that gates the `issue_refund` effect, `notify_customer` records the
//! receipt. The action only logs; swap in a real payments client to go live.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use spire_core::WorkflowId;
use spire_engine::{
    ActionCall, ActionError, ActionHandler, ApprovalRequest, EffectRequest, Engine, EngineError,
    FnStep, StepError, StepOutcome, Workflow,
};
use spire_execution::RiskLevel;
use tracing::info;

/// Logs the refund and returns a receipt keyed by the effect id.
#[derive(Debug, Default)]
pub struct LoggingRefunds;

#[async_trait]
impl ActionHandler for LoggingRefunds {
    async fn invoke(&self, call: &ActionCall) -> Result<Value, ActionError> {
        let Some(amount) = call.params["amount_cents"].as_i64() else {
            return Err(ActionError::Rejected("amount_cents missing".into()));
        };
        info!(
            run_id = %call.run_id,
            effect_id = %call.effect_id,
            amount,
            "refund issued"
        );
        Ok(json!({
            "refund_id": format!("rf_{}", &call.effect_id.as_str()[..16]),
            "amount_cents": amount,
        }))
    }
}

fn refund_workflow() -> Result<Workflow, EngineError> {
    let id = WorkflowId::new("refund").map_err(|e| EngineError::InvalidConfig(e.to_string()))?;
    Ok(Workflow::new(id)
        .step(FnStep::new("validate_refund", |ctx| {
            let Some(order_id) = ctx.input["order_id"].as_str() else {
                return Err(StepError::permanent("order_id is required"));
            };
            let amount = ctx.input["amount_cents"].as_i64().unwrap_or_default();
            if amount <= 0 {
                return Err(StepError::permanent("amount_cents must be positive"));
            }
            Ok(StepOutcome::Next(json!({
                "order_id": order_id,
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
            let receipt = ctx.output("approve_refund").cloned().unwrap_or(Value::Null);
            Ok(StepOutcome::Next(json!({ "receipt": receipt, "notified": true })))
        })))
}

/// Register the workflow and its action on `engine`.
pub fn register(engine: &Engine) -> Result<(), EngineError> {
    engine.register_workflow(refund_workflow()?)?;
    engine.register_action("issue_refund", Arc::new(LoggingRefunds));
    Ok(())
}
