//! Starting worker processes.
//!
//! [`Launcher`] is the seam between the supervisor and the operating
//! system. [`ProcessLauncher`] spawns real child processes through
//! [`tokio::process::Command`]; tests substitute an in-memory launcher
//! backed by [`tokio::io::duplex`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use lingosub_core::error::ErrorCode;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::{Child, Command};

/// How to launch one worker process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerCommand {
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub working_directory: Option<PathBuf>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: HashMap::new(),
            working_directory: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// How a worker process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitInfo {
    /// Exit code, `None` when killed by a signal or unknown.
    pub code: Option<i32>,
    pub description: String,
}

impl std::fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.description)
    }
}

/// Control over a launched process.
#[async_trait]
pub trait ProcessHandle: Send {
    /// Wait for the process to exit. Must be cancel safe.
    async fn wait(&mut self) -> ExitInfo;

    /// Force-terminate the process and reap it.
    async fn kill(&mut self);
}

/// A freshly started worker: its pipes and a handle to the process.
pub struct LaunchedWorker {
    pub pid: Option<u32>,
    /// The worker's stdout, carrying responses, notifications and heartbeats.
    pub output: Box<dyn AsyncRead + Send + Unpin>,
    /// The worker's stdin, carrying requests and notifications.
    pub input: Box<dyn AsyncWrite + Send + Unpin>,
    pub process: Box<dyn ProcessHandle>,
}

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("worker process has no {0} pipe")]
    MissingPipe(&'static str),

    #[error("launch refused: {0}")]
    Refused(String),
}

impl LaunchError {
    pub fn code(&self) -> ErrorCode {
        ErrorCode::ProcessStartFailed
    }
}

/// Starts worker processes.
#[async_trait]
pub trait Launcher: Send + Sync {
    /// Launch one worker. `label` identifies it in logs.
    async fn launch(
        &self,
        command: &WorkerCommand,
        label: &str,
    ) -> Result<LaunchedWorker, LaunchError>;
}

/// Launches workers as OS child processes.
///
/// The child's stderr is forwarded line by line to `tracing` under the
/// `lingosub_sidecar::worker` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessLauncher;

#[async_trait]
impl Launcher for ProcessLauncher {
    async fn launch(
        &self,
        command: &WorkerCommand,
        label: &str,
    ) -> Result<LaunchedWorker, LaunchError> {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .envs(&command.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // A child whose handle is dropped must not outlive the coordinator.
            .kill_on_drop(true);

        if let Some(dir) = &command.working_directory {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|source| LaunchError::Spawn {
            program: command.program.display().to_string(),
            source,
        })?;

        let input = child.stdin.take().ok_or(LaunchError::MissingPipe("stdin"))?;
        let output = child.stdout.take().ok_or(LaunchError::MissingPipe("stdout"))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(stderr, label.to_string()));
        }

        let pid = child.id();
        tracing::info!(worker = label, pid = ?pid, program = %command.program.display(), "Worker process spawned");

        Ok(LaunchedWorker {
            pid,
            output: Box::new(output),
            input: Box::new(input),
            process: Box::new(ChildProcess { child }),
        })
    }
}

struct ChildProcess {
    child: Child,
}

#[async_trait]
impl ProcessHandle for ChildProcess {
    async fn wait(&mut self) -> ExitInfo {
        match self.child.wait().await {
            Ok(status) => ExitInfo {
                code: status.code(),
                description: status.to_string(),
            },
            Err(e) => ExitInfo {
                code: None,
                description: format!("failed to wait for process: {e}"),
            },
        }
    }

    async fn kill(&mut self) {
        if let Err(e) = self.child.kill().await {
            tracing::warn!(error = %e, "Failed to kill worker process");
        }
    }
}

async fn forward_stderr<R: AsyncRead + Unpin>(stderr: R, label: String) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                tracing::info!(target: "lingosub_sidecar::worker", worker = %label, "{line}");
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(worker = %label, error = %e, "Stopped reading worker stderr");
                break;
            }
        }
    }
}
