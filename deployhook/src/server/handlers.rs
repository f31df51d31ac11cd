//! HTTP request handlers

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{ConnectInfo, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::authn::signature::{FailureReason, VerificationResult};
use crate::deploy::executor::RunContext;
use crate::deploy::gate::decide;
use crate::models::deployment::{CommandFailure, RunOutcome};
use crate::models::event::{InboundEvent, MalformedEvent};
use crate::server::state::ServerState;
use crate::storage::settings::ExecutionPolicy;
use crate::utils::version_info;

/// Why a webhook request was not turned into a successful deployment
#[derive(Error, Debug)]
pub enum WebhookError {
    #[error("{0}")]
    MalformedRequest(#[from] MalformedEvent),

    #[error("signature verification failed for {peer}: {reason}")]
    AuthFailure {
        reason: FailureReason,
        peer: SocketAddr,
    },

    #[error("deployment already in progress")]
    ExecutionRejected,

    #[error("deployment command failed: {0}")]
    CommandFailed(CommandFailure),
}

impl WebhookError {
    pub fn status(&self) -> StatusCode {
        match self {
            WebhookError::MalformedRequest(_) => StatusCode::BAD_REQUEST,
            WebhookError::AuthFailure { .. } => StatusCode::UNAUTHORIZED,
            WebhookError::ExecutionRejected => StatusCode::CONFLICT,
            WebhookError::CommandFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let body = match &self {
            WebhookError::MalformedRequest(e) => {
                debug!("Rejecting webhook: {}", e);
                "Malformed webhook payload"
            }
            WebhookError::AuthFailure { reason, peer } => {
                warn!(
                    source_ip = %peer.ip(),
                    reason = reason.code(),
                    "Webhook signature verification failed"
                );
                "Invalid signature"
            }
            WebhookError::ExecutionRejected => {
                warn!("Webhook rejected, a deployment is already in progress");
                "Deployment already in progress"
            }
            WebhookError::CommandFailed(reason) => {
                error!("Webhook deployment failed: {}", reason);
                "Deployment failed"
            }
        };
        (self.status(), body).into_response()
    }
}

/// Push webhook handler
///
/// Parses, verifies, gates and then runs the deployment per the configured
/// execution policy.
pub async fn webhook_handler(
    State(state): State<Arc<ServerState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, String), WebhookError> {
    let event = InboundEvent::parse(&headers, body)?;

    if let VerificationResult::Failed(reason) =
        state.verifier.verify(event.raw_body(), event.signature())
    {
        return Err(WebhookError::AuthFailure { reason, peer });
    }

    let decision = decide(&event, &state.gate.target_ref, &state.gate.skip_tag);
    if !decision.should_run() {
        info!("{}", decision);
        return Ok((StatusCode::OK, decision.to_string()));
    }
    info!(
        delivery = event.delivery_id().unwrap_or("-"),
        source_ip = %peer.ip(),
        "{}",
        decision
    );

    let context = RunContext::from_event(&event);
    let executor = state.executor.clone();
    match state.policy {
        ExecutionPolicy::Wait => {
            // Run on its own task so a client disconnect does not kill the command
            let run = tokio::spawn(async move { executor.execute(&context).await })
                .await
                .map_err(|e| WebhookError::CommandFailed(CommandFailure::Wait(e.to_string())))?;

            match run.outcome {
                RunOutcome::Success => Ok((
                    StatusCode::OK,
                    "Deployment completed successfully".to_string(),
                )),
                RunOutcome::Rejected => Err(WebhookError::ExecutionRejected),
                RunOutcome::CommandFailed(reason) => Err(WebhookError::CommandFailed(reason)),
            }
        }
        ExecutionPolicy::Detach => {
            let permit = executor
                .try_begin()
                .ok_or(WebhookError::ExecutionRejected)?;
            tokio::spawn(async move {
                executor.run(permit, &context).await;
            });
            Ok((StatusCode::ACCEPTED, "Deployment started".to_string()))
        }
    }
}

/// Health check response
///
/// Served without authentication. `deploying` only says whether the
/// deployment slot is taken; it never carries the ref, commit or output.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
    pub deploying: bool,
}

/// Health check handler
pub async fn health_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let version = version_info();
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: "deployhook".to_string(),
        version: version.version,
        deploying: state.executor.coordinator().is_busy(),
    })
}

/// Version response
#[derive(Debug, Serialize)]
pub struct VersionResponse {
    pub version: String,
    pub git_hash: String,
    pub build_time: String,
}

/// Version handler
pub async fn version_handler() -> impl IntoResponse {
    let version = version_info();
    Json(VersionResponse {
        version: version.version,
        git_hash: version.git_hash,
        build_time: version.build_time,
    })
}
