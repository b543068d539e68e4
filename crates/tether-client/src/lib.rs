//! # Tether Client - Resilient RPC over a supervised subprocess
//!
//! This crate keeps a logical session usable across repeated start/stop
//! cycles of an agent subprocess reachable only through its stdin/stdout.
//! Callers issue call-style requests and consume a continuous stream of
//! notifications; the agent may also issue requests back (approval prompts)
//! that the configured handler answers. When the agent dies, in-flight
//! operations resolve with a well-defined disconnect failure and future
//! operations transparently resume on a freshly spawned process, bounded by
//! a restart budget.
//!
//! ## Architecture
//!
//! - [`launcher`]: spawns agent processes and reports their exit
//! - `wire` / `connection`: frames messages and correlates calls by id
//! - `slot`: owns the one live connection and enforces the restart budget
//! - `executor` / `relay`: route operations and notifications across
//!   restarts
//! - [`AgentClient`]: the caller-facing facade
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tether_client::{AgentClient, LaunchConfig, RetryLimit};
//! use std::time::Duration;
//!
//! let client = AgentClient::for_process(LaunchConfig::new("my-agent").arg("--stdio"))
//!     .retry_policy(RetryLimit::new(1).with_delay(Duration::from_millis(100)))
//!     .emit_restart_marker(true)
//!     .build();
//!
//! let result = client.call("session/prompt", serde_json::json!({"text": "hi"})).await?;
//! ```

mod client;
mod connection;
mod error;
mod events;
mod executor;
pub mod launcher;
mod options;
pub mod policy;
mod relay;
mod slot;
mod wire;

pub use client::{AgentClient, AgentClientBuilder};
pub use connection::{RejectAllRequests, ServerRequestHandler};
pub use error::{ClientError, DisconnectReason, Result};
pub use events::{AgentEvent, Notification, RestartEvent, RestartReason};
pub use launcher::{
    AgentGuard, AgentLauncher, LaunchConfig, LaunchedAgent, ProcessExit, ProcessLauncher,
};
pub use options::{ClientOptions, RestartCallback};
pub use policy::{NoRetry, RestartPolicy, RetryContext, RetryDecision, RetryLimit, RetryPolicy};
pub use slot::ConnectionState;

// Re-export the wire message types alongside the client API.
pub use tether_protocol::{Message, RequestId, RpcError};
