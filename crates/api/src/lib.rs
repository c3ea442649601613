#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! # Spire API
//!
//! HTTP front for [`spire_engine::ControlSurface`]. Tenancy comes from the
//! `x-spire-tenant` header set by an upstream auth layer; this crate does no
//! authentication of its own.

pub mod error;
pub mod extract;
pub mod handlers;
pub mod router;

pub use error::ApiError;
pub use extract::{PRINCIPAL_HEADER, REQUEST_ID_HEADER, RequestContext, TENANT_HEADER};
pub use handlers::ApiState;
pub use router::router;

use spire_engine::Engine;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Router over `engine`'s control surface.
pub fn app(engine: &Engine) -> axum::Router {
    router(ApiState::new(engine.control(), engine.telemetry().clone()))
}

/// Serve `app` on `listener` until `shutdown` fires.
pub async fn serve(
    listener: TcpListener,
    app: axum::Router,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "api listening");
    }
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}
