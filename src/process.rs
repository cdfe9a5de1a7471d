//! Process supervisor
//!
//! Two modes: `run_blocking` executes short-lived build commands and fails on
//! non-zero exit or timeout; `start_daemon` spawns the long-running app
//! process, watches a short grace window for crash-on-start and hands back a
//! [`DaemonHandle`]. `DaemonHandle::terminate` is the only path that may end
//! a supervised process: graceful request, bounded wait, forced kill.

use crate::logs::LogSink;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Lines of output kept for failure diagnostics
const OUTPUT_TAIL_LINES: usize = 40;

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to start {command}: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },

    #[error("error waiting for {command}: {source}")]
    Wait {
        command: String,
        source: std::io::Error,
    },

    #[error("exit code {code} returned from {command}\n{tail}")]
    NonZeroExit {
        command: String,
        code: i32,
        tail: String,
    },

    #[error("timed out waiting for {command}")]
    TimedOut { command: String },

    #[error("the process in {dir} started but exited all too soon\n{tail}")]
    CrashedOnStart { dir: String, tail: String },
}

/// A command plus the working directory and extra env vars to run it with
#[derive(Debug, Clone)]
pub struct CommandSpec {
    program: String,
    args: Vec<String>,
    cwd: PathBuf,
    env: HashMap<String, String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: cwd.into(),
            env: HashMap::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn envs(mut self, vars: &HashMap<String, String>) -> Self {
        self.env
            .extend(vars.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    /// Human-readable command line for logs and errors
    pub fn command_line(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }

    fn build(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .current_dir(&self.cwd)
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

/// Spawn a child with stdout and stderr merged into one line channel
fn spawn_merged(spec: &CommandSpec) -> Result<(Child, mpsc::UnboundedReceiver<String>), ProcessError> {
    let mut child = spec.build().spawn().map_err(|e| ProcessError::Spawn {
        command: spec.command_line(),
        source: e,
    })?;

    let (tx, rx) = mpsc::unbounded_channel();
    if let Some(stdout) = child.stdout.take() {
        pump_lines(stdout, tx.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        pump_lines(stderr, tx);
    }
    Ok((child, rx))
}

fn pump_lines<R>(stream: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(line).is_err() {
                break;
            }
        }
    });
}

fn push_tail(tail: &mut VecDeque<String>, line: String) {
    if tail.len() == OUTPUT_TAIL_LINES {
        tail.pop_front();
    }
    tail.push_back(line);
}

fn join_tail(tail: &VecDeque<String>) -> String {
    tail.iter().map(String::as_str).collect::<Vec<_>>().join("\n")
}

/// Run a short-lived command to completion, streaming merged output to the
/// build log. Non-zero exit or timeout is a failure carrying the output tail.
pub async fn run_blocking(
    spec: &CommandSpec,
    sink: &LogSink,
    timeout: Duration,
) -> Result<(), ProcessError> {
    sink.build_line(&format!("{}> {}", spec.cwd.display(), spec.command_line()));
    let start = std::time::Instant::now();

    let (mut child, mut lines) = spawn_merged(spec)?;
    let mut tail: VecDeque<String> = VecDeque::new();

    let waited = tokio::time::timeout(timeout, async {
        while let Some(line) = lines.recv().await {
            sink.build_line(&line);
            push_tail(&mut tail, line);
        }
        child.wait().await
    })
    .await;

    match waited {
        Ok(Ok(status)) if status.success() => {
            debug!(
                command = %spec.command_line(),
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Command completed"
            );
            Ok(())
        }
        Ok(Ok(status)) => Err(ProcessError::NonZeroExit {
            command: spec.command_line(),
            code: status.code().unwrap_or(-1),
            tail: join_tail(&tail),
        }),
        Ok(Err(e)) => Err(ProcessError::Wait {
            command: spec.command_line(),
            source: e,
        }),
        Err(_) => {
            let _ = child.kill().await;
            Err(ProcessError::TimedOut {
                command: spec.command_line(),
            })
        }
    }
}

/// Run a command and return its trimmed stdout. Used for version probes.
pub async fn run_capture(spec: &CommandSpec, timeout: Duration) -> Result<String, ProcessError> {
    let output = tokio::time::timeout(timeout, spec.build().output())
        .await
        .map_err(|_| ProcessError::TimedOut {
            command: spec.command_line(),
        })?
        .map_err(|e| ProcessError::Spawn {
            command: spec.command_line(),
            source: e,
        })?;

    if !output.status.success() {
        return Err(ProcessError::NonZeroExit {
            command: spec.command_line(),
            code: output.status.code().unwrap_or(-1),
            tail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Teardown progress of a supervised daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TeardownState {
    Running,
    TermRequested,
    Killed,
}

/// Handle to a long-running supervised process
pub struct DaemonHandle {
    child: Child,
    command: String,
    state: TeardownState,
}

impl std::fmt::Debug for DaemonHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DaemonHandle")
            .field("command", &self.command)
            .field("pid", &self.pid())
            .finish_non_exhaustive()
    }
}

impl DaemonHandle {
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Whether the process is still running (without blocking)
    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Graceful-then-forced teardown: request termination, wait up to
    /// `grace`, escalate to a forced kill with a second bounded wait.
    /// Never fails; calling it on an already-dead handle is a no-op.
    pub async fn terminate(&mut self, grace: Duration) {
        if self.state == TeardownState::Killed {
            return;
        }
        if let Ok(Some(status)) = self.child.try_wait() {
            debug!(command = %self.command, ?status, "Process already exited");
            return;
        }

        if let Some(pid) = self.child.id() {
            info!(command = %self.command, pid, "Requesting process termination");
            #[cfg(unix)]
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
            #[cfg(not(unix))]
            {
                let _ = self.child.start_kill();
            }
        }
        self.state = TeardownState::TermRequested;

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                info!(command = %self.command, ?status, "Process exited gracefully");
                self.state = TeardownState::Killed;
            }
            Ok(Err(e)) => {
                warn!(command = %self.command, error = %e, "Error waiting for process to exit");
                self.state = TeardownState::Killed;
            }
            Err(_) => {
                warn!(
                    command = %self.command,
                    grace_secs = grace.as_secs(),
                    "Did not shut down cleanly, killing process forcibly"
                );
                match tokio::time::timeout(grace, self.child.kill()).await {
                    Ok(Ok(())) => info!(command = %self.command, "Process killed"),
                    Ok(Err(e)) => warn!(command = %self.command, error = %e, "Error killing process"),
                    Err(_) => warn!(command = %self.command, "Process still not reaped after kill"),
                }
                self.state = TeardownState::Killed;
            }
        }
    }
}

/// Spawn a long-running process with merged output streamed to the console
/// log. The process is watched for `grace`: if it exits inside the window
/// the start fails fast with recent output, otherwise a live handle is
/// returned.
pub async fn start_daemon(
    spec: &CommandSpec,
    sink: &LogSink,
    grace: Duration,
) -> Result<DaemonHandle, ProcessError> {
    sink.console_line(&format!("{}> {}", spec.cwd.display(), spec.command_line()));

    let (mut child, mut lines) = spawn_merged(spec)?;
    let pid = child.id().unwrap_or(0);
    info!(command = %spec.command_line(), pid, "Daemon process spawned");

    let tail = Arc::new(Mutex::new(VecDeque::new()));
    let tail_writer = Arc::clone(&tail);
    let console = sink.clone();
    tokio::spawn(async move {
        while let Some(line) = lines.recv().await {
            console.console_line(&line);
            push_tail(&mut tail_writer.lock(), line);
        }
    });

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            debug!(command = %spec.command_line(), ?status, "Daemon exited during grace window");
            Err(ProcessError::CrashedOnStart {
                dir: spec.cwd.display().to_string(),
                tail: join_tail(&tail.lock()),
            })
        }
        Ok(Err(e)) => Err(ProcessError::Wait {
            command: spec.command_line(),
            source: e,
        }),
        Err(_) => Ok(DaemonHandle {
            child,
            command: spec.command_line(),
            state: TeardownState::Running,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sink() -> LogSink {
        let s = LogSink::new();
        s.reset(None);
        s
    }

    #[tokio::test]
    async fn test_run_blocking_success_streams_output() {
        let log = sink();
        let spec = CommandSpec::new("echo", ".").arg("hello world");
        run_blocking(&spec, &log, Duration::from_secs(10))
            .await
            .unwrap();

        let build = log.build_log();
        assert!(build.contains("> echo hello world"));
        assert!(build.contains("hello world"));
    }

    #[tokio::test]
    async fn test_run_blocking_nonzero_exit_carries_tail() {
        let log = sink();
        let spec = CommandSpec::new("sh", ".").arg("-c").arg("echo oops >&2; exit 3");
        let err = run_blocking(&spec, &log, Duration::from_secs(10))
            .await
            .unwrap_err();

        match err {
            ProcessError::NonZeroExit { code, tail, .. } => {
                assert_eq!(code, 3);
                assert!(tail.contains("oops"));
            }
            other => panic!("expected NonZeroExit, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_run_blocking_times_out() {
        let log = sink();
        let spec = CommandSpec::new("sleep", ".").arg("30");
        let err = run_blocking(&spec, &log, Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::TimedOut { .. }));
    }

    #[tokio::test]
    async fn test_run_capture_returns_trimmed_stdout() {
        let spec = CommandSpec::new("echo", ".").arg("v1.2.3");
        let out = run_capture(&spec, Duration::from_secs(10)).await.unwrap();
        assert_eq!(out, "v1.2.3");
    }

    #[tokio::test]
    async fn test_start_daemon_detects_crash_on_start() {
        let log = sink();
        let spec = CommandSpec::new("sh", ".").arg("-c").arg("echo dying; exit 1");
        let err = start_daemon(&spec, &log, Duration::from_secs(5))
            .await
            .unwrap_err();

        match err {
            ProcessError::CrashedOnStart { tail, .. } => assert!(tail.contains("dying")),
            other => panic!("expected CrashedOnStart, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_start_daemon_returns_live_handle() {
        let log = sink();
        let spec = CommandSpec::new("sleep", ".").arg("30");
        let mut handle = start_daemon(&spec, &log, Duration::from_millis(300))
            .await
            .unwrap();

        assert!(handle.is_alive());
        handle.terminate(Duration::from_secs(5)).await;
        assert!(!handle.is_alive());
    }

    #[tokio::test]
    async fn test_terminate_twice_is_a_noop() {
        let log = sink();
        let spec = CommandSpec::new("sleep", ".").arg("30");
        let mut handle = start_daemon(&spec, &log, Duration::from_millis(300))
            .await
            .unwrap();

        handle.terminate(Duration::from_secs(5)).await;
        // Second call must neither error nor block
        let second = tokio::time::timeout(Duration::from_secs(1), handle.terminate(Duration::from_secs(5))).await;
        assert!(second.is_ok());
    }

    #[test]
    fn test_command_line_rendering() {
        let spec = CommandSpec::new("npm", "/tmp").arg("install");
        assert_eq!(spec.command_line(), "npm install");

        let bare = CommandSpec::new("ls", "/tmp");
        assert_eq!(bare.command_line(), "ls");
    }
}
