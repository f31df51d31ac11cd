//! Application state management

use std::sync::Arc;

use tracing::info;

use crate::app::options::WebhookOptions;
use crate::authn::signature::SignatureVerifier;
use crate::deploy::coordinator::DeploymentCoordinator;
use crate::deploy::executor::{DeploymentExecutor, ExecutorOptions};
use crate::errors::HookError;

/// Main application state
pub struct AppState {
    /// Single deployment slot shared by every request
    pub coordinator: Arc<DeploymentCoordinator>,

    /// Webhook signature verifier
    pub verifier: Arc<SignatureVerifier>,

    /// Deployment command runner
    pub executor: Arc<DeploymentExecutor>,
}

impl AppState {
    /// Initialize application state
    pub fn init(webhook: WebhookOptions, executor: ExecutorOptions) -> Self {
        info!("Initializing application state...");

        let coordinator = Arc::new(DeploymentCoordinator::new());
        let verifier = Arc::new(SignatureVerifier::new(
            webhook.secret,
            webhook.allow_legacy_sha1,
        ));
        let executor = Arc::new(DeploymentExecutor::new(executor, coordinator.clone()));

        Self {
            coordinator,
            verifier,
            executor,
        }
    }

    /// Wait for a detached deployment, if any, to finish
    pub async fn shutdown(&self) -> Result<(), HookError> {
        info!("Shutting down application state...");
        if self.coordinator.is_busy() {
            info!("Waiting for the running deployment to finish...");
        }
        self.coordinator.wait_idle().await;
        Ok(())
    }
}
