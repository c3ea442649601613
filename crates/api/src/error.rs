//! HTTP error envelope.
//!
//! Every failure is rendered as
//! `{"request_id": "...", "error": {"code": "...", "message": "...", "details": ...}}`.

use axum::Json;
use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use serde_json::{Value, json};
use spire_engine::EngineError;
use tracing::error;

/// Message, request id and optional structured details of an [`ApiError`].
#[derive(Clone, Debug, Default)]
pub struct ErrorState {
    /// Human-readable message.
    pub message: String,
    /// Correlation id; generated when the request carried none.
    pub request_id: Option<String>,
    /// Extra machine-readable context.
    pub details: Option<Value>,
}

impl ErrorState {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }
}

/// Errors returned by API handlers.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// 400: malformed ids, bodies or query strings; rejected validation.
    #[error("bad request: {}", .0.message)]
    BadRequest(ErrorState),
    /// 401: no tenant on the request.
    #[error("unauthorized: {}", .0.message)]
    Unauthorized(ErrorState),
    /// 404: unknown or foreign entity.
    #[error("not found: {}", .0.message)]
    NotFound(ErrorState),
    /// 409: stale checkpoint, decided ticket or disallowed state.
    #[error("conflict: {}", .0.message)]
    Conflict(ErrorState),
    /// 500: storage or configuration failure.
    #[error("internal: {}", .0.message)]
    Internal(ErrorState),
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    code: &'static str,
    message: &'a str,
    details: &'a Option<Value>,
}

#[derive(Serialize)]
struct ErrorEnvelope<'a> {
    request_id: &'a str,
    error: ErrorBody<'a>,
}

impl ApiError {
    /// 400 with `message`.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(ErrorState::new(message))
    }

    /// 401 with `message`.
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized(ErrorState::new(message))
    }

    /// 404 with `message`.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(ErrorState::new(message))
    }

    /// 409 with `message`.
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(ErrorState::new(message))
    }

    /// 500 with `message`.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(ErrorState::new(message))
    }

    fn state_mut(&mut self) -> &mut ErrorState {
        match self {
            Self::BadRequest(s)
            | Self::Unauthorized(s)
            | Self::NotFound(s)
            | Self::Conflict(s)
            | Self::Internal(s) => s,
        }
    }

    /// Attach the request's correlation id.
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.state_mut().request_id = Some(request_id.into());
        self
    }

    /// Attach structured details.
    pub fn with_details(mut self, details: Value) -> Self {
        self.state_mut().details = Some(details);
        self
    }

    /// HTTP status and stable error code.
    #[must_use]
    pub fn status(&self) -> (StatusCode, &'static str) {
        match self {
            Self::BadRequest(_) => (StatusCode::BAD_REQUEST, "invalid_argument"),
            Self::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "unauthorized"),
            Self::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            Self::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
            Self::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        let message = err.to_string();
        match err {
            EngineError::Validation(_) => Self::bad_request(message),
            EngineError::NotFound { entity, id } => {
                Self::not_found(message).with_details(json!({ "entity": entity, "id": id }))
            }
            EngineError::Conflict(_) | EngineError::InvalidState(_) => Self::conflict(message),
            EngineError::InvalidConfig(_) => Self::internal(message),
            EngineError::Store(ref source) => {
                let retryable = source.is_retryable();
                Self::internal(message).with_details(json!({ "retryable": retryable }))
            }
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(mut self) -> Response {
        let (status, code) = self.status();
        if status.is_server_error() {
            error!(error = %self, "request failed");
        }
        let state = std::mem::take(self.state_mut());
        let request_id = state
            .request_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let body = ErrorEnvelope {
            request_id: &request_id,
            error: ErrorBody {
                code,
                message: &state.message,
                details: &state.details,
            },
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use spire_ports::PortsError;

    #[test]
    fn engine_errors_map_to_statuses() {
        let cases = [
            (EngineError::Validation("bad".into()), StatusCode::BAD_REQUEST),
            (EngineError::not_found("run", "r-1"), StatusCode::NOT_FOUND),
            (EngineError::Conflict("stale".into()), StatusCode::CONFLICT),
            (EngineError::InvalidState("done".into()), StatusCode::CONFLICT),
            (
                EngineError::Store(PortsError::Internal("disk".into())),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(ApiError::from(err).status().0, expected);
        }
    }

    #[tokio::test]
    async fn envelope_carries_request_id_and_details() {
        let response = ApiError::from(EngineError::not_found("ticket", "t-9"))
            .with_request_id("req-1")
            .into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(
            body,
            json!({
                "request_id": "req-1",
                "error": {
                    "code": "not_found",
                    "message": "ticket not found: t-9",
                    "details": { "entity": "ticket", "id": "t-9" },
                },
            })
        );
    }
}
