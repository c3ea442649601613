//! Axum handlers over the engine's control surface.

use axum::Json;
use axum::body::Bytes;
use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use spire_core::{CheckpointId, RunId, Sequence, TicketId};
use spire_engine::{ControlSurface, Snapshot, StartOptions};
use spire_execution::{Checkpoint, Decision, Event, RiskLevel, Run, Ticket, TicketStatus};
use spire_ports::{DecideOutcome, TicketFilter};
use spire_telemetry::{MetricsSnapshot, Telemetry};

use crate::error::ApiError;
use crate::extract::RequestContext;

/// Events returned per page when `limit` is absent.
pub const DEFAULT_EVENT_LIMIT: usize = 100;

/// Shared handler state.
#[derive(Clone, Debug)]
pub struct ApiState {
    control: ControlSurface,
    telemetry: Telemetry,
}

impl ApiState {
    /// Serve `control`, reporting metrics from `telemetry`.
    pub fn new(control: ControlSurface, telemetry: Telemetry) -> Self {
        Self { control, telemetry }
    }
}

fn empty_object() -> Value {
    json!({})
}

/// Body of `POST /v1/runs`.
#[derive(Debug, Deserialize)]
pub struct StartRunRequest {
    /// Registered workflow to run.
    pub workflow_id: String,
    /// Run input; must be a JSON object.
    #[serde(default = "empty_object")]
    pub input: Value,
    /// Priority, parent and caller-chosen id.
    #[serde(flatten)]
    pub options: StartOptions,
}

/// Response of `POST /v1/runs`.
#[derive(Debug, Serialize, Deserialize)]
pub struct StartRunResponse {
    /// The queued run.
    pub run_id: RunId,
}

/// Query of `GET /v1/runs/{run_id}/events`.
#[derive(Debug, Default, Deserialize)]
pub struct EventsQuery {
    /// Return events strictly after this sequence.
    pub after: Option<u64>,
    /// Page size.
    pub limit: Option<usize>,
}

/// Body of `POST /v1/runs/{run_id}/resume`.
#[derive(Debug, Deserialize)]
pub struct ResumeRequest {
    /// Reviewer payload stored on the ticket.
    #[serde(default)]
    pub payload: Value,
    /// Checkpoint the reviewer saw.
    pub expected_checkpoint_id: CheckpointId,
}

/// Body of `POST /v1/tickets/{ticket_id}/decision`.
#[derive(Debug, Deserialize)]
pub struct DecisionRequest {
    /// `approve` or `reject`.
    pub decision: Decision,
    /// Reviewer payload stored on the ticket.
    #[serde(default)]
    pub payload: Value,
    /// Checkpoint the reviewer saw.
    pub expected_checkpoint_id: CheckpointId,
}

/// Response of the decision endpoints.
#[derive(Debug, Serialize)]
pub struct DecisionResponse {
    /// `false` when the same decision had already been recorded.
    pub applied: bool,
    /// The ticket after the call.
    pub ticket: Ticket,
}

impl From<DecideOutcome> for DecisionResponse {
    fn from(outcome: DecideOutcome) -> Self {
        match outcome {
            DecideOutcome::Applied(ticket) => Self { applied: true, ticket },
            DecideOutcome::Unchanged(ticket) => Self { applied: false, ticket },
        }
    }
}

/// Optional body of `POST /v1/runs/{run_id}/cancel`.
#[derive(Debug, Default, Deserialize)]
pub struct CancelRequest {
    /// Recorded on the `cancel_requested` event.
    pub reason: Option<String>,
}

/// Query of `GET /v1/inbox`.
#[derive(Debug, Default, Deserialize)]
pub struct InboxQuery {
    /// Only tickets with this status.
    pub status: Option<TicketStatus>,
    /// Only tickets with this risk level.
    pub risk_level: Option<RiskLevel>,
    /// Only tickets of this run.
    pub run_id: Option<RunId>,
    /// Page size.
    pub limit: Option<usize>,
}

/// `GET /healthz`
pub async fn healthz() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// `GET /metrics`
pub async fn metrics(State(state): State<ApiState>) -> Json<MetricsSnapshot> {
    Json(state.telemetry.metrics().snapshot())
}

/// `POST /v1/runs`
pub async fn start_run(
    ctx: RequestContext,
    State(state): State<ApiState>,
    body: Result<Json<StartRunRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<StartRunResponse>), ApiError> {
    let Json(req) = body.map_err(|err| ctx.tag(err))?;
    let run_id = state
        .control
        .start_run(&ctx.caller, &req.workflow_id, req.input, req.options)
        .await
        .map_err(ctx.fail())?;
    Ok((StatusCode::CREATED, Json(StartRunResponse { run_id })))
}

/// `GET /v1/runs/{run_id}`
pub async fn get_run(
    ctx: RequestContext,
    State(state): State<ApiState>,
    run_id: Result<Path<RunId>, PathRejection>,
) -> Result<Json<Run>, ApiError> {
    let Path(run_id) = run_id.map_err(|err| ctx.tag(err))?;
    let run = state
        .control
        .get_run(&ctx.caller, run_id)
        .await
        .map_err(ctx.fail())?;
    Ok(Json(run))
}

/// `GET /v1/runs/{run_id}/events?after=&limit=`
pub async fn get_events(
    ctx: RequestContext,
    State(state): State<ApiState>,
    run_id: Result<Path<RunId>, PathRejection>,
    query: Result<Query<EventsQuery>, QueryRejection>,
) -> Result<Json<Vec<Event>>, ApiError> {
    let Path(run_id) = run_id.map_err(|err| ctx.tag(err))?;
    let Query(query) = query.map_err(|err| ctx.tag(err))?;
    let events = state
        .control
        .get_events(
            &ctx.caller,
            run_id,
            Sequence::new(query.after.unwrap_or_default()),
            query.limit.unwrap_or(DEFAULT_EVENT_LIMIT),
        )
        .await
        .map_err(ctx.fail())?;
    Ok(Json(events))
}

/// `GET /v1/runs/{run_id}/snapshot`
pub async fn get_snapshot(
    ctx: RequestContext,
    State(state): State<ApiState>,
    run_id: Result<Path<RunId>, PathRejection>,
) -> Result<Json<Snapshot>, ApiError> {
    let Path(run_id) = run_id.map_err(|err| ctx.tag(err))?;
    let snapshot = state
        .control
        .get_snapshot(&ctx.caller, run_id)
        .await
        .map_err(ctx.fail())?;
    Ok(Json(snapshot))
}

/// `GET /v1/runs/{run_id}/checkpoints`
pub async fn get_checkpoints(
    ctx: RequestContext,
    State(state): State<ApiState>,
    run_id: Result<Path<RunId>, PathRejection>,
) -> Result<Json<Vec<Checkpoint>>, ApiError> {
    let Path(run_id) = run_id.map_err(|err| ctx.tag(err))?;
    let checkpoints = state
        .control
        .get_checkpoints(&ctx.caller, run_id)
        .await
        .map_err(ctx.fail())?;
    Ok(Json(checkpoints))
}

/// `POST /v1/runs/{run_id}/resume`
pub async fn resume_run(
    ctx: RequestContext,
    State(state): State<ApiState>,
    run_id: Result<Path<RunId>, PathRejection>,
    body: Result<Json<ResumeRequest>, JsonRejection>,
) -> Result<Json<DecisionResponse>, ApiError> {
    let Path(run_id) = run_id.map_err(|err| ctx.tag(err))?;
    let Json(req) = body.map_err(|err| ctx.tag(err))?;
    let outcome = state
        .control
        .resume_run(&ctx.caller, run_id, req.payload, req.expected_checkpoint_id)
        .await
        .map_err(ctx.fail())?;
    Ok(Json(outcome.into()))
}

/// `POST /v1/runs/{run_id}/cancel`
///
/// The body is optional; an empty one cancels with a generic reason.
pub async fn cancel_run(
    ctx: RequestContext,
    State(state): State<ApiState>,
    run_id: Result<Path<RunId>, PathRejection>,
    body: Bytes,
) -> Result<Json<Run>, ApiError> {
    let Path(run_id) = run_id.map_err(|err| ctx.tag(err))?;
    let req: CancelRequest = if body.is_empty() {
        CancelRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|err| ctx.tag(ApiError::bad_request(format!("invalid cancel body: {err}"))))?
    };
    let reason = req.reason.as_deref().unwrap_or("canceled via api");
    let run = state
        .control
        .cancel_run(&ctx.caller, run_id, reason)
        .await
        .map_err(ctx.fail())?;
    Ok(Json(run))
}

/// `GET /v1/inbox?status=&risk_level=&run_id=&limit=`
pub async fn list_inbox(
    ctx: RequestContext,
    State(state): State<ApiState>,
    query: Result<Query<InboxQuery>, QueryRejection>,
) -> Result<Json<Vec<Ticket>>, ApiError> {
    let Query(query) = query.map_err(|err| ctx.tag(err))?;
    let filter = TicketFilter {
        tenant_id: None,
        status: query.status,
        risk_level: query.risk_level,
        run_id: query.run_id,
        limit: query.limit,
    };
    let tickets = state
        .control
        .list_inbox(&ctx.caller, filter)
        .await
        .map_err(ctx.fail())?;
    Ok(Json(tickets))
}

/// `GET /v1/tickets/{ticket_id}`
pub async fn get_ticket(
    ctx: RequestContext,
    State(state): State<ApiState>,
    ticket_id: Result<Path<TicketId>, PathRejection>,
) -> Result<Json<Ticket>, ApiError> {
    let Path(ticket_id) = ticket_id.map_err(|err| ctx.tag(err))?;
    let ticket = state
        .control
        .get_ticket(&ctx.caller, ticket_id)
        .await
        .map_err(ctx.fail())?;
    Ok(Json(ticket))
}

/// `POST /v1/tickets/{ticket_id}/decision`
pub async fn decide_ticket(
    ctx: RequestContext,
    State(state): State<ApiState>,
    ticket_id: Result<Path<TicketId>, PathRejection>,
    body: Result<Json<DecisionRequest>, JsonRejection>,
) -> Result<Json<DecisionResponse>, ApiError> {
    let Path(ticket_id) = ticket_id.map_err(|err| ctx.tag(err))?;
    let Json(req) = body.map_err(|err| ctx.tag(err))?;
    let outcome = state
        .control
        .decide_ticket(
            &ctx.caller,
            ticket_id,
            req.decision,
            req.payload,
            req.expected_checkpoint_id,
        )
        .await
        .map_err(ctx.fail())?;
    Ok(Json(outcome.into()))
}
