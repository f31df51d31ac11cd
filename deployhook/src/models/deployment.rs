//! Deployment run models

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Why the deployment command did not succeed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandFailure {
    /// Exited with a non-zero code
    ExitCode(i32),

    /// Terminated without an exit code (killed by a signal)
    Signal,

    /// The process could not be started
    Spawn(String),

    /// Waiting on the process failed
    Wait(String),

    /// Killed after running longer than the configured timeout
    Timeout(Duration),
}

impl fmt::Display for CommandFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandFailure::ExitCode(code) => write!(f, "exited with code {}", code),
            CommandFailure::Signal => write!(f, "terminated by signal"),
            CommandFailure::Spawn(e) => write!(f, "failed to spawn: {}", e),
            CommandFailure::Wait(e) => write!(f, "failed to wait: {}", e),
            CommandFailure::Timeout(limit) => write!(f, "timed out after {:?}", limit),
        }
    }
}

/// Terminal classification of a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Success,
    CommandFailed(CommandFailure),
    /// Another deployment held the lock, nothing was started
    Rejected,
}

/// One execution (or rejected attempt) of the deployment command
#[derive(Debug, Clone)]
pub struct DeploymentRun {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    pub command: String,
    pub args: Vec<String>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Set when either stream exceeded the capture limit
    pub output_truncated: bool,
    pub exit_code: Option<i32>,
    pub outcome: RunOutcome,
}

impl DeploymentRun {
    /// A run that never started because a deployment was already in progress
    pub fn rejected(command: &str, args: &[String]) -> Self {
        Self {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            duration: Duration::ZERO,
            command: command.to_string(),
            args: args.to_vec(),
            stdout: Vec::new(),
            stderr: Vec::new(),
            output_truncated: false,
            exit_code: None,
            outcome: RunOutcome::Rejected,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == RunOutcome::Success
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}
