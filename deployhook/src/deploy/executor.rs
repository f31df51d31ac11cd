//! Deployment executor
//!
//! Runs the configured deployment command under the [`DeploymentCoordinator`],
//! captures its output and classifies the outcome. Failed runs are reported,
//! never retried.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::deploy::coordinator::{DeploymentCoordinator, DeploymentPermit};
use crate::deploy::launcher::{
    CommandLauncher, CommandSpec, ExitState, LaunchLimits, ProcessLauncher,
};
use crate::models::deployment::{CommandFailure, DeploymentRun, RunOutcome};
use crate::models::event::InboundEvent;

/// Executor options
#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    /// Deployment command
    pub command: String,

    /// Arguments passed to the command
    pub args: Vec<String>,

    /// Working directory, inherited when `None`
    pub working_dir: Option<PathBuf>,

    /// Extra environment variables
    pub env: BTreeMap<String, String>,

    /// Kill the command after this long, `None` waits forever
    pub timeout: Option<Duration>,

    /// Bytes of stdout and of stderr kept per run
    pub output_limit: usize,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            command: String::new(),
            args: Vec::new(),
            working_dir: None,
            env: BTreeMap::new(),
            timeout: Some(Duration::from_secs(600)),
            output_limit: 1024 * 1024,
        }
    }
}

/// What triggered a run, exported to the command's environment
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    pub target_ref: Option<String>,
    pub delivery_id: Option<String>,
}

impl RunContext {
    pub fn from_event(event: &InboundEvent) -> Self {
        Self {
            target_ref: Some(event.target_ref().to_string()),
            delivery_id: event.delivery_id().map(str::to_string),
        }
    }
}

/// Deployment executor
pub struct DeploymentExecutor {
    options: ExecutorOptions,
    coordinator: Arc<DeploymentCoordinator>,
    launcher: Arc<dyn CommandLauncher>,
}

impl DeploymentExecutor {
    /// Create an executor that spawns real processes
    pub fn new(options: ExecutorOptions, coordinator: Arc<DeploymentCoordinator>) -> Self {
        Self::with_launcher(options, coordinator, Arc::new(ProcessLauncher))
    }

    pub fn with_launcher(
        options: ExecutorOptions,
        coordinator: Arc<DeploymentCoordinator>,
        launcher: Arc<dyn CommandLauncher>,
    ) -> Self {
        Self {
            options,
            coordinator,
            launcher,
        }
    }

    pub fn options(&self) -> &ExecutorOptions {
        &self.options
    }

    pub fn coordinator(&self) -> &Arc<DeploymentCoordinator> {
        &self.coordinator
    }

    /// Take the deployment slot without starting anything
    pub fn try_begin(&self) -> Option<DeploymentPermit> {
        self.coordinator.try_acquire()
    }

    /// Run the deployment command, or reject immediately if one is already running
    pub async fn execute(&self, context: &RunContext) -> DeploymentRun {
        match self.try_begin() {
            Some(permit) => self.run(permit, context).await,
            None => {
                warn!("Deployment already in progress, rejecting new run");
                DeploymentRun::rejected(&self.options.command, &self.options.args)
            }
        }
    }

    /// Run the deployment command while holding `permit`. The slot is released
    /// once the command has terminated, or if this future is dropped.
    pub async fn run(&self, permit: DeploymentPermit, context: &RunContext) -> DeploymentRun {
        let id = Uuid::new_v4();
        let span = info_span!(
            "deployment",
            run_id = %id,
            target_ref = context.target_ref.as_deref().unwrap_or("-"),
        );
        self.run_inner(id, permit, context).instrument(span).await
    }

    async fn run_inner(
        &self,
        id: Uuid,
        permit: DeploymentPermit,
        context: &RunContext,
    ) -> DeploymentRun {
        let spec = self.command_spec(id, context);
        let limits = LaunchLimits {
            timeout: self.options.timeout,
            output_limit: self.options.output_limit,
        };

        info!("Starting deployment: {} {}", spec.program, spec.args.join(" "));
        let started_at = Utc::now();
        let clock = Instant::now();
        let report = self.launcher.launch(&spec, limits).await;
        let duration = clock.elapsed();
        drop(permit);

        let (exit_code, outcome) = classify(&report.exit);
        let run = DeploymentRun {
            id,
            started_at,
            duration,
            command: spec.program,
            args: spec.args,
            stdout: report.stdout,
            stderr: report.stderr,
            output_truncated: report.truncated,
            exit_code,
            outcome,
        };
        log_run(&run);
        run
    }

    fn command_spec(&self, id: Uuid, context: &RunContext) -> CommandSpec {
        let mut env: Vec<(String, String)> = self
            .options
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        env.push(("DEPLOYHOOK_RUN_ID".to_string(), id.to_string()));
        if let Some(target_ref) = &context.target_ref {
            env.push(("DEPLOYHOOK_REF".to_string(), target_ref.clone()));
        }
        if let Some(delivery_id) = &context.delivery_id {
            env.push(("DEPLOYHOOK_DELIVERY".to_string(), delivery_id.clone()));
        }

        CommandSpec {
            program: self.options.command.clone(),
            args: self.options.args.clone(),
            working_dir: self.options.working_dir.clone(),
            env,
        }
    }
}

fn classify(exit: &ExitState) -> (Option<i32>, RunOutcome) {
    match exit {
        ExitState::Exited(0) => (Some(0), RunOutcome::Success),
        ExitState::Exited(code) => (
            Some(*code),
            RunOutcome::CommandFailed(CommandFailure::ExitCode(*code)),
        ),
        ExitState::Signaled => (None, RunOutcome::CommandFailed(CommandFailure::Signal)),
        ExitState::SpawnFailed(e) => (
            None,
            RunOutcome::CommandFailed(CommandFailure::Spawn(e.clone())),
        ),
        ExitState::WaitFailed(e) => (
            None,
            RunOutcome::CommandFailed(CommandFailure::Wait(e.clone())),
        ),
        ExitState::TimedOut(limit) => (
            None,
            RunOutcome::CommandFailed(CommandFailure::Timeout(*limit)),
        ),
    }
}

fn log_run(run: &DeploymentRun) {
    for line in run.stdout_lossy().lines() {
        info!("stdout: {}", line);
    }
    let stderr = run.stderr_lossy();
    if run.output_truncated {
        warn!("Deployment output exceeded the capture limit and was truncated");
    }

    match &run.outcome {
        RunOutcome::Success => {
            for line in stderr.lines() {
                warn!("stderr: {}", line);
            }
            info!("Deployment succeeded in {:?}", run.duration);
        }
        RunOutcome::CommandFailed(reason) => {
            for line in stderr.lines() {
                error!("stderr: {}", line);
            }
            error!("Deployment failed after {:?}: {}", run.duration, reason);
        }
        RunOutcome::Rejected => {}
    }
}
