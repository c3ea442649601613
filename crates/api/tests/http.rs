//! End-to-end HTTP tests against an in-memory store.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use spire_api::{PRINCIPAL_HEADER, REQUEST_ID_HEADER, TENANT_HEADER, app};
use spire_core::{TenantId, WorkflowId};
use spire_engine::{
    ActionCall, ActionError, ActionHandler, ApprovalRequest, EffectRequest, Engine, EngineConfig,
    FnStep, StepOutcome, Workflow,
};
use spire_execution::{Event, EventKind, RiskLevel};
use spire_store_memory::MemoryStore;
use tower::ServiceExt;

#[derive(Default)]
struct Payouts {
    calls: AtomicUsize,
}

#[async_trait]
impl ActionHandler for Payouts {
    async fn invoke(&self, call: &ActionCall) -> Result<Value, ActionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(json!({ "payout_id": format!("po-{}", &call.effect_id.as_str()[..8]) }))
    }
}

fn payout_workflow() -> Workflow {
    Workflow::new(WorkflowId::new("payout").unwrap())
        .step(FnStep::new("prepare", |ctx| {
            Ok(StepOutcome::Next(json!({ "amount_cents": ctx.input["amount_cents"].clone() })))
        }))
        .step(FnStep::new("review", |ctx| {
            Ok(StepOutcome::NeedsApproval(
                ApprovalRequest::new("payout_approval", RiskLevel::High)
                    .with_context(ctx.data.clone())
                    .gating(EffectRequest::new(
                        "send_payout",
                        json!({ "amount_cents": ctx.data["amount_cents"].clone() }),
                    )),
            ))
        }))
}

struct TestApi {
    engine: Engine,
    router: Router,
    tenant: TenantId,
    payouts: Arc<Payouts>,
}

impl TestApi {
    fn new() -> Self {
        let engine = Engine::new(Arc::new(MemoryStore::new()), EngineConfig::default()).unwrap();
        let payouts = Arc::new(Payouts::default());
        engine.register_workflow(payout_workflow()).unwrap();
        engine.register_action("send_payout", payouts.clone());
        Self {
            router: app(&engine),
            engine,
            tenant: TenantId::v4(),
            payouts,
        }
    }

    async fn call(&self, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        self.call_as(Some(self.tenant), method, uri, body).await
    }

    async fn call_as(
        &self,
        tenant: Option<TenantId>,
        method: Method,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut request = Request::builder()
            .method(method)
            .uri(uri)
            .header(PRINCIPAL_HEADER, "ops@example.com")
            .header(REQUEST_ID_HEADER, "req-test");
        if let Some(tenant) = tenant {
            request = request.header(TENANT_HEADER, tenant.to_string());
        }
        let request = match body {
            Some(body) => request
                .header("content-type", "application/json")
                .body(Body::from(body.to_string())),
            None => request.body(Body::empty()),
        }
        .unwrap();
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    async fn start(&self) -> String {
        let (status, body) = self
            .call(
                Method::POST,
                "/v1/runs",
                Some(json!({ "workflow_id": "payout", "input": { "amount_cents": 900 } })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        body["run_id"].as_str().unwrap().to_owned()
    }

    async fn drain(&self) {
        self.engine.dispatcher().drain().await.unwrap();
    }
}

#[tokio::test]
async fn healthz_needs_no_tenant() {
    let api = TestApi::new();
    let (status, body) = api.call_as(None, Method::GET, "/healthz", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "status": "ok" }));
}

#[tokio::test]
async fn missing_tenant_is_rejected_with_an_envelope() {
    let api = TestApi::new();
    let (status, body) = api.call_as(None, Method::GET, "/v1/inbox", None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["request_id"], "req-test");
    assert_eq!(body["error"]["code"], "unauthorized");
}

#[tokio::test]
async fn unknown_workflows_are_bad_requests() {
    let api = TestApi::new();
    let (status, body) = api
        .call(Method::POST, "/v1/runs", Some(json!({ "workflow_id": "nope" })))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "invalid_argument");
    assert!(body["error"]["message"].as_str().unwrap().contains("not registered"));

    let (status, _) = api
        .call(
            Method::POST,
            "/v1/runs",
            Some(json!({ "workflow_id": "payout", "input": [1, 2] })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn malformed_ids_are_bad_requests() {
    let api = TestApi::new();
    let (status, body) = api.call(Method::GET, "/v1/runs/not-a-uuid", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["request_id"], "req-test");
}

#[tokio::test]
async fn approval_flow_over_http() {
    let api = TestApi::new();
    let run_id = api.start().await;
    api.drain().await;

    let (status, snapshot) = api
        .call(Method::GET, &format!("/v1/runs/{run_id}/snapshot"), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(snapshot["status"], "waiting_approval");
    assert_eq!(snapshot["next_step"], "review");
    let ticket = &snapshot["pending_ticket"];
    assert_eq!(ticket["risk_level"], "high");
    assert_eq!(ticket["expected_checkpoint_id"], json!(2));
    let ticket_id = ticket["ticket_id"].as_str().unwrap().to_owned();

    let (status, inbox) = api
        .call(Method::GET, "/v1/inbox?status=pending&risk_level=high", None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(inbox.as_array().unwrap().len(), 1);
    assert_eq!(inbox[0]["ticket_id"], ticket_id.as_str());

    let (status, _) = api
        .call(
            Method::POST,
            &format!("/v1/tickets/{ticket_id}/decision"),
            Some(json!({ "decision": "approve", "expected_checkpoint_id": 1 })),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let resume = json!({ "payload": { "note": "ok" }, "expected_checkpoint_id": 2 });
    let (status, first) = api
        .call(Method::POST, &format!("/v1/runs/{run_id}/resume"), Some(resume.clone()))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["applied"], true);
    assert_eq!(first["ticket"]["status"], "approved");
    assert_eq!(first["ticket"]["decided_by"], "ops@example.com");

    let (status, again) = api
        .call(Method::POST, &format!("/v1/runs/{run_id}/resume"), Some(resume))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(again["applied"], false);

    api.drain().await;
    let (_, run) = api.call(Method::GET, &format!("/v1/runs/{run_id}"), None).await;
    assert_eq!(run["status"], "completed");
    assert_eq!(api.payouts.calls.load(Ordering::SeqCst), 1);

    let (status, metrics) = api.call_as(None, Method::GET, "/metrics", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(metrics["counters"]["spire_effects_committed_total"], json!(1));
    assert_eq!(metrics["counters"]["spire_runs_completed_total"], json!(1));

    let (status, events) = api
        .call(Method::GET, &format!("/v1/runs/{run_id}/events?after=0&limit=500"), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    let events: Vec<Event> = serde_json::from_value(events).unwrap();
    let lifecycle: Vec<EventKind> = events
        .iter()
        .map(|event| event.event_type)
        .filter(EventKind::is_lifecycle)
        .collect();
    assert_eq!(
        lifecycle,
        vec![
            EventKind::Started,
            EventKind::PausedForApproval,
            EventKind::Resumed,
            EventKind::Completed,
        ]
    );

    let (_, page) = api
        .call(Method::GET, &format!("/v1/runs/{run_id}/events?after=1&limit=2"), None)
        .await;
    assert_eq!(page.as_array().unwrap().len(), 2);
    assert_eq!(page[0]["sequence"], json!(2));

    let (_, checkpoints) = api
        .call(Method::GET, &format!("/v1/runs/{run_id}/checkpoints"), None)
        .await;
    let ids: Vec<u64> = checkpoints
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["checkpoint_id"].as_u64().unwrap())
        .collect();
    assert_eq!(ids, (1..=ids.len() as u64).collect::<Vec<_>>());
}

#[tokio::test]
async fn rejecting_a_ticket_fails_the_run() {
    let api = TestApi::new();
    let run_id = api.start().await;
    api.drain().await;
    let (_, snapshot) = api
        .call(Method::GET, &format!("/v1/runs/{run_id}/snapshot"), None)
        .await;
    let ticket_id = snapshot["pending_ticket"]["ticket_id"].as_str().unwrap().to_owned();

    let (status, decided) = api
        .call(
            Method::POST,
            &format!("/v1/tickets/{ticket_id}/decision"),
            Some(json!({ "decision": "reject", "expected_checkpoint_id": 2 })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(decided["ticket"]["status"], "rejected");

    let (status, _) = api
        .call(
            Method::POST,
            &format!("/v1/tickets/{ticket_id}/decision"),
            Some(json!({ "decision": "approve", "expected_checkpoint_id": 2 })),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);

    api.drain().await;
    let (_, run) = api.call(Method::GET, &format!("/v1/runs/{run_id}"), None).await;
    assert_eq!(run["status"], "failed");
    assert_eq!(api.payouts.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn other_tenants_see_nothing() {
    let api = TestApi::new();
    let run_id = api.start().await;
    api.drain().await;

    let stranger = Some(TenantId::v4());
    let (status, body) = api
        .call_as(stranger, Method::GET, &format!("/v1/runs/{run_id}"), None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "not_found");

    let (status, inbox) = api.call_as(stranger, Method::GET, "/v1/inbox", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(inbox, json!([]));

    let (status, _) = api
        .call_as(
            stranger,
            Method::POST,
            &format!("/v1/runs/{run_id}/resume"),
            Some(json!({ "expected_checkpoint_id": 2 })),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn cancel_accepts_an_empty_body() {
    let api = TestApi::new();
    let run_id = api.start().await;

    let (status, run) = api
        .call(Method::POST, &format!("/v1/runs/{run_id}/cancel"), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(run["cancel_requested_at"].is_string());

    api.drain().await;
    let (_, run) = api.call(Method::GET, &format!("/v1/runs/{run_id}"), None).await;
    assert_eq!(run["status"], "canceled");

    let (status, _) = api
        .call(
            Method::POST,
            &format!("/v1/runs/{run_id}/cancel"),
            Some(json!({ "reason": "again" })),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
}
