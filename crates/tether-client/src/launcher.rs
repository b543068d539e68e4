//! Agent subprocess launching
//!
//! The client core never spawns processes directly; it goes through the
//! [`AgentLauncher`] trait so tests can substitute in-process transports.
//! [`ProcessLauncher`] is the production implementation: it spawns the agent
//! executable with piped stdio, tails stderr into a bounded ring buffer for
//! restart diagnostics, and reports process exit through a one-shot signal.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::Command;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::{ClientError, Result};

/// Boxed byte stream halves of a launched agent.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// How an agent process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessExit {
    /// Exit code, when the process exited normally
    pub code: Option<i32>,
    /// Terminating signal, when killed (unix only)
    pub signal: Option<i32>,
}

impl From<std::process::ExitStatus> for ProcessExit {
    fn from(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

impl std::fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code),
            (None, Some(signal)) => write!(f, "terminated by signal {}", signal),
            (None, None) => write!(f, "unknown exit status"),
        }
    }
}

/// Handle to a launched agent's lifetime.
///
/// Dropping the guard must terminate the underlying process; the slot also
/// calls [`terminate`](AgentGuard::terminate) explicitly before replacing a
/// dead connection.
pub trait AgentGuard: Send + Sync {
    /// Terminate the underlying process. Idempotent.
    fn terminate(&self);

    /// Snapshot of recent diagnostic output (the stderr tail for real
    /// subprocesses). Surfaces in the restart event.
    fn diagnostic_tail(&self) -> Vec<String>;
}

/// A running agent as seen by the connection layer: a duplex byte stream,
/// an exit signal, and a guard that owns the process.
pub struct LaunchedAgent {
    pub reader: BoxedReader,
    pub writer: BoxedWriter,
    /// Fires once when the process exits, with its status.
    pub exit: oneshot::Receiver<ProcessExit>,
    pub guard: Box<dyn AgentGuard>,
}

impl std::fmt::Debug for LaunchedAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LaunchedAgent").finish_non_exhaustive()
    }
}

/// Creates a fresh agent instance for each (re)connection.
#[async_trait]
pub trait AgentLauncher: Send + Sync {
    async fn launch(&self) -> Result<LaunchedAgent>;
}

/// Launch parameters for a real agent subprocess.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchConfig {
    /// Path to the agent executable
    pub program: PathBuf,

    /// Command-line arguments to pass to the agent
    #[serde(default)]
    pub args: Vec<String>,

    /// Working directory for the agent process
    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    /// Environment variables to set for the agent
    #[serde(default)]
    pub env: Vec<(String, String)>,

    /// How many trailing stderr lines to retain for diagnostics
    #[serde(default = "default_stderr_tail")]
    pub stderr_tail_lines: usize,
}

fn default_stderr_tail() -> usize {
    20
}

impl LaunchConfig {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            env: Vec::new(),
            stderr_tail_lines: default_stderr_tail(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Spawns the configured agent executable with piped stdio.
pub struct ProcessLauncher {
    config: LaunchConfig,
}

impl ProcessLauncher {
    pub fn new(config: LaunchConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &LaunchConfig {
        &self.config
    }
}

#[async_trait]
impl AgentLauncher for ProcessLauncher {
    async fn launch(&self) -> Result<LaunchedAgent> {
        let mut cmd = Command::new(&self.config.program);
        cmd.args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(ref dir) = self.config.working_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in &self.config.env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|e| {
            ClientError::Spawn(format!(
                "failed to spawn {}: {}",
                self.config.program.display(),
                e
            ))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ClientError::Spawn("agent stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ClientError::Spawn("agent stdout not captured".to_string()))?;
        let stderr = child.stderr.take();

        info!(
            program = %self.config.program.display(),
            pid = child.id().unwrap_or(0),
            "agent process spawned"
        );

        // Stderr tail: bounded ring buffer shared with the guard.
        let tail = Arc::new(Mutex::new(VecDeque::with_capacity(
            self.config.stderr_tail_lines,
        )));
        if let Some(stderr) = stderr {
            let tail = Arc::clone(&tail);
            let limit = self.config.stderr_tail_lines.max(1);
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    trace!(target: "tether::agent_stderr", "{}", line);
                    let mut tail = tail.lock();
                    if tail.len() >= limit {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
            });
        }

        // The wait task owns the child; kills are requested through the
        // token so the guard never needs `&mut` access to the process.
        let kill = CancellationToken::new();
        let (exit_tx, exit_rx) = oneshot::channel();
        let wait_kill = kill.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = wait_kill.cancelled() => {
                    debug!("terminating agent process");
                    if let Err(e) = child.start_kill() {
                        warn!("failed to kill agent process: {}", e);
                    }
                    child.wait().await
                }
            };
            match status {
                Ok(status) => {
                    let exit = ProcessExit::from(status);
                    debug!(%exit, "agent process exited");
                    let _ = exit_tx.send(exit);
                }
                Err(e) => {
                    warn!("failed to reap agent process: {}", e);
                }
            }
        });

        Ok(LaunchedAgent {
            reader: Box::new(stdout),
            writer: Box::new(stdin),
            exit: exit_rx,
            guard: Box::new(ProcessGuard { kill, tail }),
        })
    }
}

struct ProcessGuard {
    kill: CancellationToken,
    tail: Arc<Mutex<VecDeque<String>>>,
}

impl AgentGuard for ProcessGuard {
    fn terminate(&self) {
        self.kill.cancel();
    }

    fn diagnostic_tail(&self) -> Vec<String> {
        self.tail.lock().iter().cloned().collect()
    }
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        self.kill.cancel();
    }
}
