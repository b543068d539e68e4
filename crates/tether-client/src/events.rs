//! Caller-facing event types

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::launcher::ProcessExit;

/// An asynchronous notification pushed by the agent.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub method: String,
    pub params: Value,
}

/// One item of the client's event stream.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// An application notification from the agent, delivered unchanged.
    Notification(Notification),
    /// Synthetic marker: the underlying connection was replaced. Emitted
    /// only when `emit_restart_marker` is enabled.
    Restarted(RestartEvent),
}

/// What prompted a restart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestartReason {
    /// The watcher saw the agent process exit on its own.
    ProcessExited,
    /// An operation hit a dead connection; carries the operation kind.
    Operation(String),
    /// The notification stream ended mid-iteration.
    EventStream,
    /// `force_restart` was called.
    Manual,
}

impl std::fmt::Display for RestartReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RestartReason::ProcessExited => write!(f, "process exited"),
            RestartReason::Operation(kind) => write!(f, "operation {}", kind),
            RestartReason::EventStream => write!(f, "notification stream"),
            RestartReason::Manual => write!(f, "manual"),
        }
    }
}

/// Details of the most recent successful restart.
#[derive(Debug, Clone)]
pub struct RestartEvent {
    /// Total successful restarts over the slot's lifetime (1-based).
    pub restarts: u64,
    /// When the replacement connection came up.
    pub at: DateTime<Utc>,
    /// Exit status of the previous agent process, when the watcher saw it.
    pub previous_exit: Option<ProcessExit>,
    /// What prompted the restart.
    pub reason: RestartReason,
    /// Trailing diagnostic output of the previous process.
    pub stderr_tail: Vec<String>,
}
