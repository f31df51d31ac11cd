//! HTTP server setup

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::app::options::ServerOptions;
use crate::errors::HookError;
use crate::server::handlers::{health_handler, version_handler, webhook_handler};
use crate::server::state::ServerState;

/// Largest accepted webhook body, matching the sender's own payload cap
pub const MAX_WEBHOOK_BODY_BYTES: usize = 25 * 1024 * 1024;

/// Build the router serving the webhook and status endpoints
pub fn build_router(state: Arc<ServerState>) -> Router {
    Router::new()
        // Webhook
        .route("/webhook", post(webhook_handler))
        .route("/backend-webhook", post(webhook_handler))
        // Health and version
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        // State and middleware
        .with_state(state)
        .layer(DefaultBodyLimit::max(MAX_WEBHOOK_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
}

/// Start the HTTP server
pub async fn serve(
    options: &ServerOptions,
    state: Arc<ServerState>,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<JoinHandle<Result<(), HookError>>, HookError> {
    let app = build_router(state);

    let addr = format!("{}:{}", options.host, options.port);
    info!("Starting HTTP server on {}", addr);

    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| HookError::ServerError(format!("unable to bind {}: {}", addr, e)))?;

    let handle = tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal)
        .await
        .map_err(|e| HookError::ServerError(e.to_string()))
    });

    Ok(handle)
}
