//! External command launcher

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::time::Instant;
use tracing::{debug, warn};

/// How long to keep reading output after the process exited. A script that
/// backgrounds a server can leave the pipes open indefinitely.
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_secs(2);

const READ_CHUNK: usize = 8 * 1024;

/// What to run
#[derive(Debug, Clone, Default)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

/// Bounds applied to a launch
#[derive(Debug, Clone, Copy)]
pub struct LaunchLimits {
    /// Kill the process after this long, `None` waits forever
    pub timeout: Option<Duration>,

    /// Bytes kept per output stream
    pub output_limit: usize,
}

/// How the process ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitState {
    Exited(i32),
    Signaled,
    SpawnFailed(String),
    WaitFailed(String),
    TimedOut(Duration),
}

/// Result of one launch
#[derive(Debug, Clone)]
pub struct LaunchReport {
    pub exit: ExitState,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub truncated: bool,
}

impl LaunchReport {
    pub fn spawn_failed(error: impl ToString) -> Self {
        Self {
            exit: ExitState::SpawnFailed(error.to_string()),
            stdout: Vec::new(),
            stderr: Vec::new(),
            truncated: false,
        }
    }
}

/// Starts the deployment command and waits for it
#[async_trait]
pub trait CommandLauncher: Send + Sync {
    async fn launch(&self, spec: &CommandSpec, limits: LaunchLimits) -> LaunchReport;
}

/// Launches real child processes through tokio
#[derive(Debug, Default)]
pub struct ProcessLauncher;

#[async_trait]
impl CommandLauncher for ProcessLauncher {
    async fn launch(&self, spec: &CommandSpec, limits: LaunchLimits) -> LaunchReport {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.working_dir {
            command.current_dir(dir);
        }
        // Own process group, so a timeout can stop everything the script started
        #[cfg(unix)]
        command.process_group(0);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => return LaunchReport::spawn_failed(e),
        };
        debug!("Spawned {} (pid {:?})", spec.program, child.id());

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let mut stdout_buf = Vec::new();
        let mut stderr_buf = Vec::new();
        let mut stdout_truncated = false;
        let mut stderr_truncated = false;

        let exit = {
            let drain = async {
                tokio::join!(
                    capture(stdout, &mut stdout_buf, limits.output_limit),
                    capture(stderr, &mut stderr_buf, limits.output_limit),
                )
            };
            tokio::pin!(drain);
            let expiry = expire_at(limits.timeout.map(|t| Instant::now() + t));
            tokio::pin!(expiry);

            let mut drained = None;
            let exit = loop {
                tokio::select! {
                    truncated = &mut drain, if drained.is_none() => {
                        drained = Some(truncated);
                    }
                    status = child.wait() => {
                        break match status {
                            Ok(status) => match status.code() {
                                Some(code) => ExitState::Exited(code),
                                None => ExitState::Signaled,
                            },
                            Err(e) => ExitState::WaitFailed(e.to_string()),
                        };
                    }
                    _ = &mut expiry => {
                        let limit = limits.timeout.unwrap_or_default();
                        warn!("{} exceeded {:?}, killing it", spec.program, limit);
                        kill_process_group(child.id());
                        if let Err(e) = child.kill().await {
                            warn!("Failed to kill {}: {}", spec.program, e);
                        }
                        break ExitState::TimedOut(limit);
                    }
                }
            };

            if drained.is_none() {
                drained = tokio::time::timeout(OUTPUT_DRAIN_GRACE, &mut drain).await.ok();
                if drained.is_none() {
                    warn!(
                        "{} left its output open after exiting, output may be incomplete",
                        spec.program
                    );
                }
            }
            if let Some((out, err)) = drained {
                stdout_truncated = out;
                stderr_truncated = err;
            }
            exit
        };

        LaunchReport {
            exit,
            stdout: stdout_buf,
            stderr: stderr_buf,
            truncated: stdout_truncated || stderr_truncated,
        }
    }
}

/// SIGKILL the process group led by `pid`
#[cfg(unix)]
fn kill_process_group(pid: Option<u32>) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pid) = pid.and_then(|pid| i32::try_from(pid).ok()) else {
        return;
    };
    if let Err(e) = killpg(Pid::from_raw(pid), Signal::SIGKILL) {
        debug!("Failed to kill process group {}: {}", pid, e);
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: Option<u32>) {}

async fn expire_at(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Read `reader` to EOF, keeping at most `limit` bytes. Returns whether
/// anything was dropped. Reading continues past the limit so the child never
/// blocks on a full pipe.
async fn capture<R: AsyncRead + Unpin>(
    reader: Option<R>,
    buf: &mut Vec<u8>,
    limit: usize,
) -> bool {
    let Some(mut reader) = reader else {
        return false;
    };
    let mut chunk = vec![0u8; READ_CHUNK];
    let mut truncated = false;
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                let room = limit.saturating_sub(buf.len());
                if n > room {
                    truncated = true;
                }
                buf.extend_from_slice(&chunk[..n.min(room)]);
            }
            Err(e) => {
                debug!("Stopped reading command output: {}", e);
                break;
            }
        }
    }
    truncated
}
