//! Route table.

use axum::Router;
use axum::routing::{get, post};
use tower_http::trace::TraceLayer;

use crate::handlers::{
    ApiState, cancel_run, decide_ticket, get_checkpoints, get_events, get_run, get_snapshot,
    get_ticket, healthz, list_inbox, metrics, resume_run, start_run,
};

/// Build the `/v1` router with request tracing.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/v1/runs", post(start_run))
        .route("/v1/runs/{run_id}", get(get_run))
        .route("/v1/runs/{run_id}/events", get(get_events))
        .route("/v1/runs/{run_id}/snapshot", get(get_snapshot))
        .route("/v1/runs/{run_id}/checkpoints", get(get_checkpoints))
        .route("/v1/runs/{run_id}/resume", post(resume_run))
        .route("/v1/runs/{run_id}/cancel", post(cancel_run))
        .route("/v1/inbox", get(list_inbox))
        .route("/v1/tickets/{ticket_id}", get(get_ticket))
        .route("/v1/tickets/{ticket_id}/decision", post(decide_ticket))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
