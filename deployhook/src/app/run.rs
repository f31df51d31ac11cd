//! Main application run loop

use std::future::Future;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::app::options::{AppOptions, LifecycleOptions, ServerOptions};
use crate::app::state::AppState;
use crate::deploy::gate::GateOptions;
use crate::errors::HookError;
use crate::server::serve::serve;
use crate::server::state::ServerState;
use crate::storage::settings::ExecutionPolicy;

/// Run the deploy hook until `shutdown_signal` resolves
pub async fn run(
    options: AppOptions,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<(), HookError> {
    info!("Initializing deploy hook...");

    let AppOptions {
        lifecycle,
        server,
        webhook,
        gate,
        executor,
        policy,
    } = options;

    // Create shutdown channel
    let (shutdown_tx, _shutdown_rx): (broadcast::Sender<()>, _) = broadcast::channel(1);
    let mut shutdown_manager = ShutdownManager::new(shutdown_tx.clone(), lifecycle);

    let app_state = Arc::new(AppState::init(webhook, executor));
    shutdown_manager.with_app_state(app_state.clone())?;

    if let Err(e) = init_socket_server(
        &server,
        gate,
        policy,
        app_state,
        &mut shutdown_manager,
        shutdown_tx.subscribe(),
    )
    .await
    {
        error!("Failed to start deploy hook: {}", e);
        shutdown_manager.shutdown().await?;
        return Err(e);
    }

    shutdown_signal.await;
    info!("Shutdown signal received, shutting down...");

    drop(shutdown_tx);
    shutdown_manager.shutdown().await
}

// =============================== INITIALIZATION ================================== //

async fn init_socket_server(
    options: &ServerOptions,
    gate: GateOptions,
    policy: ExecutionPolicy,
    app_state: Arc<AppState>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), HookError> {
    info!(
        "Initializing webhook server (deploys {}, policy {:?})...",
        gate.target_ref, policy
    );

    let server_state = ServerState::new(
        app_state.verifier.clone(),
        gate,
        policy,
        app_state.executor.clone(),
    );

    let server_handle = serve(options, Arc::new(server_state), async move {
        let _ = shutdown_rx.recv().await;
    })
    .await?;

    shutdown_manager.with_socket_server_handle(server_handle)?;
    Ok(())
}

// ================================= SHUTDOWN ===================================== //

struct ShutdownManager {
    shutdown_tx: broadcast::Sender<()>,
    lifecycle_options: LifecycleOptions,
    app_state: Option<Arc<AppState>>,
    socket_server_handle: Option<JoinHandle<Result<(), HookError>>>,
}

impl ShutdownManager {
    pub fn new(shutdown_tx: broadcast::Sender<()>, lifecycle_options: LifecycleOptions) -> Self {
        Self {
            shutdown_tx,
            lifecycle_options,
            app_state: None,
            socket_server_handle: None,
        }
    }

    pub fn with_app_state(&mut self, state: Arc<AppState>) -> Result<(), HookError> {
        if self.app_state.is_some() {
            return Err(HookError::ShutdownError("app_state already set".to_string()));
        }
        self.app_state = Some(state);
        Ok(())
    }

    pub fn with_socket_server_handle(
        &mut self,
        handle: JoinHandle<Result<(), HookError>>,
    ) -> Result<(), HookError> {
        if self.socket_server_handle.is_some() {
            return Err(HookError::ShutdownError("server_handle already set".to_string()));
        }
        self.socket_server_handle = Some(handle);
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), HookError> {
        let _ = self.shutdown_tx.send(());

        match tokio::time::timeout(
            self.lifecycle_options.max_shutdown_delay,
            self.shutdown_impl(),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                error!(
                    "Shutdown timed out after {:?}, abandoning in-flight work",
                    self.lifecycle_options.max_shutdown_delay
                );
                Err(HookError::ShutdownError(format!(
                    "timed out after {:?}",
                    self.lifecycle_options.max_shutdown_delay
                )))
            }
        }
    }

    async fn shutdown_impl(&mut self) -> Result<(), HookError> {
        info!("Shutting down deploy hook...");

        // 1. Socket server, drains in-flight requests
        if let Some(handle) = self.socket_server_handle.take() {
            handle
                .await
                .map_err(|e| HookError::ShutdownError(e.to_string()))??;
        }

        // 2. App state, waits for detached deployments
        if let Some(app_state) = self.app_state.take() {
            app_state.shutdown().await?;
        }

        info!("Shutdown complete");
        Ok(())
    }
}
