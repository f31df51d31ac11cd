//! Application configuration options

use std::time::Duration;

use secrecy::SecretString;

use crate::deploy::executor::ExecutorOptions;
use crate::deploy::gate::GateOptions;
use crate::errors::HookError;
use crate::storage::settings::{ExecutionPolicy, Settings};

/// Headroom on top of the deployment timeout for output draining and the response
const SHUTDOWN_MARGIN: Duration = Duration::from_secs(10);

/// Main application options
#[derive(Debug)]
pub struct AppOptions {
    /// Lifecycle configuration
    pub lifecycle: LifecycleOptions,

    /// Server configuration
    pub server: ServerOptions,

    /// Signature verification
    pub webhook: WebhookOptions,

    /// Branch and skip-marker gate
    pub gate: GateOptions,

    /// Deployment command
    pub executor: ExecutorOptions,

    /// Whether requests wait for the deployment
    pub policy: ExecutionPolicy,
}

impl AppOptions {
    /// Build validated runtime options from settings
    pub fn from_settings(settings: Settings) -> Result<Self, HookError> {
        let Settings {
            server,
            webhook,
            deploy,
            ..
        } = settings;

        if webhook.secret.is_empty() {
            return Err(HookError::ConfigError(
                "webhook secret is required (webhook.secret or DEPLOYHOOK_SECRET)".to_string(),
            ));
        }
        if deploy.command.trim().is_empty() {
            return Err(HookError::ConfigError(
                "deployment command is required (deploy.command or DEPLOYHOOK_COMMAND)"
                    .to_string(),
            ));
        }
        if webhook.target_ref.is_empty() {
            return Err(HookError::ConfigError(
                "webhook.target_ref must not be empty".to_string(),
            ));
        }

        let timeout =
            (deploy.timeout_secs > 0).then(|| Duration::from_secs(deploy.timeout_secs));

        Ok(Self {
            lifecycle: LifecycleOptions {
                max_shutdown_delay: shutdown_delay(
                    Duration::from_secs(server.max_shutdown_delay_secs),
                    timeout,
                ),
            },
            server: ServerOptions {
                host: server.host,
                port: server.port,
            },
            webhook: WebhookOptions {
                secret: SecretString::from(webhook.secret),
                allow_legacy_sha1: webhook.allow_legacy_sha1,
            },
            gate: GateOptions {
                target_ref: webhook.target_ref,
                skip_tag: webhook.skip_tag,
            },
            executor: ExecutorOptions {
                command: deploy.command,
                args: deploy.args,
                working_dir: deploy.working_dir,
                env: deploy.env,
                timeout,
                output_limit: deploy.output_limit_bytes,
            },
            policy: deploy.policy,
        })
    }
}

/// Shutdown must outlast a running deployment, otherwise tearing down the
/// runtime kills it. Without a deployment timeout the configured delay is
/// used as is.
fn shutdown_delay(configured: Duration, deploy_timeout: Option<Duration>) -> Duration {
    match deploy_timeout {
        Some(timeout) => configured.max(timeout + SHUTDOWN_MARGIN),
        None => configured,
    }
}

/// Lifecycle options
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// Maximum delay for graceful shutdown
    pub max_shutdown_delay: Duration,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            max_shutdown_delay: Duration::from_secs(30),
        }
    }
}

/// HTTP server options
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9001,
        }
    }
}

/// Signature verification options
#[derive(Debug)]
pub struct WebhookOptions {
    /// Shared HMAC secret
    pub secret: SecretString,

    /// Accept deprecated sha1 signatures
    pub allow_legacy_sha1: bool,
}
