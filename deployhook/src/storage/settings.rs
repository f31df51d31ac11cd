//! Settings file management

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::HookError;
use crate::filesys::file::File;
use crate::logs::LogLevel;

/// Environment variables that override settings file values
pub const ENV_SECRET: &str = "DEPLOYHOOK_SECRET";
pub const ENV_PORT: &str = "DEPLOYHOOK_PORT";
pub const ENV_TARGET_REF: &str = "DEPLOYHOOK_TARGET_REF";
pub const ENV_SKIP_TAG: &str = "DEPLOYHOOK_SKIP_TAG";
pub const ENV_COMMAND: &str = "DEPLOYHOOK_COMMAND";
pub const ENV_LOG_LEVEL: &str = "DEPLOYHOOK_LOG_LEVEL";

/// Deploy hook settings.
///
/// Deliberately not `Debug`: it carries the webhook secret in clear text.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Emit JSON log lines
    #[serde(default)]
    pub log_json: bool,

    /// Directory for daily rolling log files
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerSettings,

    /// Webhook verification and gating
    #[serde(default)]
    pub webhook: WebhookSettings,

    /// Deployment command
    #[serde(default)]
    pub deploy: DeploySettings,
}

/// HTTP server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Seconds to wait for in-flight work on shutdown
    #[serde(default = "default_shutdown_secs")]
    pub max_shutdown_delay_secs: u64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    9001
}

fn default_shutdown_secs() -> u64 {
    30
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_shutdown_delay_secs: default_shutdown_secs(),
        }
    }
}

/// Webhook settings
#[derive(Clone, Serialize, Deserialize)]
pub struct WebhookSettings {
    /// Shared HMAC secret, required
    #[serde(default)]
    pub secret: String,

    /// Only pushes to this ref deploy
    #[serde(default = "default_target_ref")]
    pub target_ref: String,

    /// Commit message marker that suppresses a deployment
    #[serde(default = "default_skip_tag")]
    pub skip_tag: String,

    /// Accept deprecated `X-Hub-Signature: sha1=` signatures
    #[serde(default)]
    pub allow_legacy_sha1: bool,
}

fn default_target_ref() -> String {
    "refs/heads/main".to_string()
}

fn default_skip_tag() -> String {
    "[LOGS_UPDATE]".to_string()
}

impl Default for WebhookSettings {
    fn default() -> Self {
        Self {
            secret: String::new(),
            target_ref: default_target_ref(),
            skip_tag: default_skip_tag(),
            allow_legacy_sha1: false,
        }
    }
}

/// When the HTTP response is sent relative to the deployment
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionPolicy {
    /// Hold the request until the command finishes
    #[default]
    Wait,

    /// Respond 202 immediately and run in the background
    Detach,
}

/// Deployment command settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploySettings {
    /// Path to the deployment command, required
    #[serde(default)]
    pub command: String,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// 0 disables the timeout
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_output_limit")]
    pub output_limit_bytes: usize,

    #[serde(default)]
    pub policy: ExecutionPolicy,
}

fn default_timeout_secs() -> u64 {
    600
}

fn default_output_limit() -> usize {
    1024 * 1024
}

impl Default for DeploySettings {
    fn default() -> Self {
        Self {
            command: String::new(),
            args: Vec::new(),
            working_dir: None,
            env: BTreeMap::new(),
            timeout_secs: default_timeout_secs(),
            output_limit_bytes: default_output_limit(),
            policy: ExecutionPolicy::default(),
        }
    }
}

impl Settings {
    /// Read settings from `file`. A missing file yields the defaults so that
    /// everything can come from the environment.
    pub async fn load(file: &File) -> Result<Self, HookError> {
        if !file.exists().await {
            debug!("Settings file {:?} not found, using defaults", file.path());
            return Ok(Self::default());
        }
        file.read_json::<Settings>().await
    }

    /// Apply overrides from the process environment
    pub fn apply_env_overrides(&mut self) -> Result<(), HookError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup`, keyed by the `ENV_*` names
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), HookError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(secret) = lookup(ENV_SECRET) {
            self.webhook.secret = secret;
        }
        if let Some(port) = lookup(ENV_PORT) {
            self.server.port = port.trim().parse().map_err(|_| {
                HookError::ConfigError(format!("{} is not a valid port: {}", ENV_PORT, port))
            })?;
        }
        if let Some(target_ref) = lookup(ENV_TARGET_REF) {
            self.webhook.target_ref = target_ref;
        }
        if let Some(skip_tag) = lookup(ENV_SKIP_TAG) {
            self.webhook.skip_tag = skip_tag;
        }
        if let Some(command) = lookup(ENV_COMMAND) {
            self.deploy.command = command;
        }
        if let Some(level) = lookup(ENV_LOG_LEVEL) {
            self.log_level = level.parse().map_err(HookError::ConfigError)?;
        }
        Ok(())
    }
}
