//! HTTP surface: thin axum routing over the gateway engine.
//!
//! All bodies are JSON; `POST /v1/threads` and `POST /v1/threads/{id}`
//! additionally stream Server-Sent Events when the caller asks for
//! `text/event-stream`.

pub mod routes;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::gateway::GatewayEngine;
use crate::{AppError, Result};

/// Build the gateway router.
#[must_use]
pub fn router(engine: Arc<GatewayEngine>) -> Router {
    Router::new()
        .route("/v1/health", get(routes::health))
        .route("/v1/threads", get(routes::list_threads))
        .route("/v1/threads", post(routes::create_thread))
        .route("/v1/threads/{id}", get(routes::get_thread))
        .route("/v1/threads/{id}", post(routes::continue_thread))
        .route("/v1/threads/{id}/interrupt", post(routes::interrupt_thread))
        .route("/webhooks/{name}", post(routes::webhook))
        .with_state(engine)
}

/// Bind and serve until `shutdown` fires, then drain.
///
/// # Errors
///
/// Returns [`AppError::Config`] when the port cannot be bound and
/// [`AppError::Io`] on fatal serve errors.
pub async fn serve(engine: Arc<GatewayEngine>, shutdown: CancellationToken) -> Result<()> {
    let port = engine.options().port;
    let bind = SocketAddr::from(([0, 0, 0, 0], port));

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .map_err(|err| AppError::Config(format!("failed to bind {bind}: {err}")))?;

    info!(%bind, "gateway HTTP listening");

    let app = router(engine);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|err| AppError::Io(format!("http server error: {err}")))?;

    info!("gateway HTTP shut down");
    Ok(())
}
