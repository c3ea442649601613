//! Request extractors.

use axum::extract::FromRequestParts;
use axum::http::HeaderMap;
use axum::http::request::Parts;
use spire_core::TenantId;
use spire_engine::{Caller, EngineError};

use crate::error::ApiError;

/// Tenant the request acts for. Set by the upstream auth layer.
pub const TENANT_HEADER: &str = "x-spire-tenant";
/// Principal recorded on decisions and cancel requests.
pub const PRINCIPAL_HEADER: &str = "x-spire-principal";
/// Correlation id echoed in error envelopes.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

const ANONYMOUS: &str = "anonymous";

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

/// The request id from `x-request-id`, or a fresh one.
pub fn request_id(headers: &HeaderMap) -> String {
    header(headers, REQUEST_ID_HEADER)
        .map_or_else(|| uuid::Uuid::new_v4().to_string(), str::to_owned)
}

/// Who is calling and how to correlate the call.
///
/// Rejects with 401 when the tenant header is missing and 400 when it is
/// not a UUID.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Tenant and principal handed to the control surface.
    pub caller: Caller,
    /// Correlation id for the error envelope.
    pub request_id: String,
}

impl RequestContext {
    /// Convert an engine error into an [`ApiError`] tagged with this request.
    pub fn fail(&self) -> impl Fn(EngineError) -> ApiError + '_ {
        |err| ApiError::from(err).with_request_id(self.request_id.clone())
    }

    /// Tag an already-built error with this request.
    pub fn tag(&self, err: impl Into<ApiError>) -> ApiError {
        err.into().with_request_id(self.request_id.clone())
    }
}

impl<S> FromRequestParts<S> for RequestContext
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let request_id = request_id(&parts.headers);
        let Some(raw) = header(&parts.headers, TENANT_HEADER) else {
            return Err(ApiError::unauthorized(format!("missing {TENANT_HEADER} header"))
                .with_request_id(request_id));
        };
        let tenant_id = TenantId::parse(raw).map_err(|err| {
            ApiError::bad_request(format!("invalid {TENANT_HEADER} header: {err}"))
                .with_request_id(request_id.clone())
        })?;
        let principal = header(&parts.headers, PRINCIPAL_HEADER).unwrap_or(ANONYMOUS);
        Ok(Self {
            caller: Caller::new(tenant_id, principal),
            request_id,
        })
    }
}
