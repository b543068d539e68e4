//! Error types for the tether client

use std::time::Duration;

use thiserror::Error;

use crate::launcher::ProcessExit;
use tether_protocol::RpcError;

/// Result type alias for client operations
pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors surfaced by client operations.
///
/// The executor and the notification relay only ever interpret
/// [`ClientError::is_disconnect`]; every other classification is for the
/// caller. Application errors ([`ClientError::Rpc`]) are the agent speaking
/// and are never treated as a transport problem.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The agent sent a frame that cannot belong to the protocol. Terminal
    /// for the current connection.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The channel to the agent closed or the process exited. Recoverable
    /// via restart.
    #[error("connection lost: {0}")]
    Disconnected(DisconnectReason),

    /// The agent answered a call with an error result.
    #[error("agent error: {0}")]
    Rpc(RpcError),

    /// The restart budget is exhausted; the slot is permanently faulted.
    #[error("agent unavailable: {0}")]
    Unavailable(String),

    /// Operation attempted after the client was disposed.
    #[error("client disposed")]
    Disposed,

    /// The launcher failed to produce a running agent.
    #[error("failed to launch agent: {0}")]
    Spawn(String),

    /// A configured per-call deadline elapsed.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// IO errors (pipe handling, stream shutdown)
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ClientError {
    /// Whether this failure means the current connection is gone.
    ///
    /// A protocol violation counts: the stream is no longer decodable, so
    /// the connection is as dead as it is after a process exit, and the
    /// restart controller is the only recovery path.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            ClientError::Disconnected(_) | ClientError::Protocol(_)
        )
    }
}

/// Why a connection stopped being usable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The agent closed its output stream.
    ChannelClosed,
    /// The agent process exited.
    ProcessExited(ProcessExit),
    /// A frame could not be written to the agent.
    WriteFailed(String),
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DisconnectReason::ChannelClosed => write!(f, "channel closed by agent"),
            DisconnectReason::ProcessExited(exit) => write!(f, "agent process exited: {}", exit),
            DisconnectReason::WriteFailed(detail) => write!(f, "write failed: {}", detail),
        }
    }
}
