//! External command execution with timeout, cancellation and output capture.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::cancel::CancelSignal;

/// How long to wait for pipe readers after the process tree was killed.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// A fully resolved command invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    /// Executable followed by its arguments.
    pub argv: Vec<String>,

    /// Directory the process starts in.
    pub working_dir: PathBuf,

    /// Variables added on top of the inherited environment.
    pub env: BTreeMap<String, String>,

    /// Wall-clock limit for this invocation.
    pub timeout: Duration,
}

impl Invocation {
    pub fn display(&self) -> String {
        self.argv.join(" ")
    }
}

/// Captured result of an invocation.
///
/// A non-zero exit code is a normal result, not an error.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when the process was killed (timeout, cancel or signal).
    pub exit_code: Option<i32>,

    pub stdout: String,

    pub stderr: String,

    /// The timeout expired and the process tree was terminated.
    pub timed_out: bool,

    /// Cancellation was requested and the process tree was terminated.
    pub cancelled: bool,

    pub duration_ms: u64,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0) && !self.timed_out && !self.cancelled
    }
}

/// Errors starting a command. Exit status never produces one of these.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("empty command")]
    EmptyCommand,

    #[error("executable not found: {program}")]
    ToolMissing { program: String },

    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("io error while waiting for {program}: {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Executes external commands.
///
/// Implementations must terminate the whole process tree on timeout or
/// cancellation and must not leak processes when the returned future is
/// dropped.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(
        &self,
        invocation: &Invocation,
        cancel: &CancelSignal,
    ) -> Result<CommandOutput, RunnerError>;
}

/// Runs commands as local child processes, each in its own process group.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRunner;

impl ProcessRunner {
    pub fn new() -> Self {
        Self
    }

    fn build_command(invocation: &Invocation) -> Command {
        let mut cmd = Command::new(&invocation.argv[0]);
        cmd.args(&invocation.argv[1..])
            .current_dir(&invocation.working_dir)
            .envs(&invocation.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(
        &self,
        invocation: &Invocation,
        cancel: &CancelSignal,
    ) -> Result<CommandOutput, RunnerError> {
        if invocation.argv.is_empty() || invocation.argv[0].is_empty() {
            return Err(RunnerError::EmptyCommand);
        }
        let program = invocation.argv[0].clone();
        let start = Instant::now();

        debug!(command = %invocation.display(), timeout_ms = invocation.timeout.as_millis() as u64, "spawning");

        // spawn() reports a missing cwd as NotFound too; keep it apart from a missing binary.
        if !invocation.working_dir.is_dir() {
            return Err(RunnerError::Spawn {
                program,
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!(
                        "working directory {} does not exist",
                        invocation.working_dir.display()
                    ),
                ),
            });
        }

        let mut child = Self::build_command(invocation).spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                RunnerError::ToolMissing {
                    program: program.clone(),
                }
            } else {
                RunnerError::Spawn {
                    program: program.clone(),
                    source: e,
                }
            }
        })?;

        let mut group = ProcessGroupGuard::new(child.id());
        let stdout_task = spawn_reader(child.stdout.take());
        let stderr_task = spawn_reader(child.stderr.take());

        enum Ended {
            Exited(std::io::Result<std::process::ExitStatus>),
            TimedOut,
            Cancelled,
        }

        let ended = tokio::select! {
            status = child.wait() => Ended::Exited(status),
            _ = tokio::time::sleep(invocation.timeout) => Ended::TimedOut,
            _ = cancel.cancelled() => Ended::Cancelled,
        };

        let (exit_code, timed_out, cancelled) = match ended {
            Ended::Exited(status) => {
                let status = status.map_err(|source| RunnerError::Wait {
                    program: program.clone(),
                    source,
                })?;
                // The leader exited; stray members of its group still get reaped below.
                group.kill();
                (status.code(), false, false)
            }
            Ended::TimedOut => {
                warn!(command = %invocation.display(), "timed out, terminating process tree");
                terminate(&mut child, &mut group).await;
                (None, true, false)
            }
            Ended::Cancelled => {
                warn!(command = %invocation.display(), "cancelled, terminating process tree");
                terminate(&mut child, &mut group).await;
                (None, false, true)
            }
        };

        let stdout = drain(stdout_task).await;
        let stderr = drain(stderr_task).await;

        Ok(CommandOutput {
            exit_code,
            stdout,
            stderr,
            timed_out,
            cancelled,
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }
}

/// Kills the child's process group when dropped, unless already done.
struct ProcessGroupGuard {
    pid: Option<u32>,
}

impl ProcessGroupGuard {
    fn new(pid: Option<u32>) -> Self {
        Self { pid }
    }

    fn kill(&mut self) {
        if let Some(pid) = self.pid.take() {
            kill_group(pid);
        }
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        self.kill();
    }
}

#[cfg(unix)]
fn kill_group(pid: u32) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        debug!(pgid = pid, error = %e, "process group already gone");
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: u32) {}

async fn terminate(child: &mut Child, group: &mut ProcessGroupGuard) {
    group.kill();
    if let Err(e) = child.kill().await {
        debug!(error = %e, "child already gone");
    }
}

fn spawn_reader<R>(pipe: Option<R>) -> JoinHandle<Vec<u8>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            if let Err(e) = pipe.read_to_end(&mut buf).await {
                debug!(error = %e, "pipe read ended with error");
            }
        }
        buf
    })
}

async fn drain(task: JoinHandle<Vec<u8>>) -> String {
    let abort = task.abort_handle();
    match tokio::time::timeout(DRAIN_GRACE, task).await {
        Ok(Ok(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
        Ok(Err(_)) => String::new(),
        Err(_) => {
            abort.abort();
            warn!("output pipe still open after process exit, truncating capture");
            String::new()
        }
    }
}

/// Locate an executable the way a shell would.
///
/// Names containing a path separator are checked directly.
pub fn find_on_path(tool: &str) -> Option<PathBuf> {
    if tool.is_empty() {
        return None;
    }
    if tool.contains(std::path::MAIN_SEPARATOR) || tool.contains('/') {
        let path = PathBuf::from(tool);
        return is_executable(&path).then_some(path);
    }
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(tool))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
