//! Client configuration

use std::sync::Arc;
use std::time::Duration;

use crate::connection::{RejectAllRequests, ServerRequestHandler};
use crate::events::RestartEvent;
use crate::policy::{NoRetry, RestartPolicy, RetryPolicy};

/// Observer hook invoked after each successful restart.
///
/// Runs inside the restart critical section: keep it short and do not call
/// back into the client from it.
pub type RestartCallback = Arc<dyn Fn(&RestartEvent) + Send + Sync>;

/// Recognized client options.
///
/// Built through [`AgentClient::builder`](crate::AgentClient::builder);
/// the struct itself is plain data so hosts can assemble one directly.
#[derive(Clone)]
pub struct ClientOptions {
    /// Replace a dead connection automatically when an operation or the
    /// watcher detects a disconnect. On by default.
    pub auto_restart: bool,

    /// Keep the notification stream alive across restarts. On by default;
    /// when off, a disconnect ends the stream with the triggering failure.
    pub continuity: bool,

    /// Emit a synthetic [`AgentEvent::Restarted`](crate::AgentEvent)
    /// marker into the notification stream after each observed restart.
    pub emit_restart_marker: bool,

    /// Per-call deadline. Elapsing surfaces
    /// [`ClientError::Timeout`](crate::ClientError) and does not trigger a
    /// restart.
    pub request_timeout: Option<Duration>,

    /// Bounds on restart rate and backoff shape.
    pub restart_policy: RestartPolicy,

    /// Decides whether a disconnected operation runs again.
    pub retry_policy: Arc<dyn RetryPolicy>,

    /// Invoked after each successful restart with the restart event.
    pub on_restart: Option<RestartCallback>,

    /// Answers call-style requests the agent sends to the client.
    pub server_handler: Arc<dyn ServerRequestHandler>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            auto_restart: true,
            continuity: true,
            emit_restart_marker: false,
            request_timeout: None,
            restart_policy: RestartPolicy::default(),
            retry_policy: Arc::new(NoRetry),
            on_restart: None,
            server_handler: Arc::new(RejectAllRequests),
        }
    }
}

impl std::fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientOptions")
            .field("auto_restart", &self.auto_restart)
            .field("continuity", &self.continuity)
            .field("emit_restart_marker", &self.emit_restart_marker)
            .field("request_timeout", &self.request_timeout)
            .field("restart_policy", &self.restart_policy)
            .field("on_restart", &self.on_restart.is_some())
            .finish()
    }
}
