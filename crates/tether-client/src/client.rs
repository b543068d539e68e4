//! High-level client for a supervised agent subprocess
//!
//! [`AgentClient`] is the main entry point: it owns the connection slot and
//! routes every operation through the restart/retry executor, so callers
//! never see a half-dead connection unless policy says so.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::Either;
use futures::{stream, Stream};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::connection::ServerRequestHandler;
use crate::events::{AgentEvent, RestartEvent, RestartReason};
use crate::executor::execute;
use crate::launcher::{AgentLauncher, LaunchConfig, ProcessLauncher};
use crate::options::ClientOptions;
use crate::policy::{RestartPolicy, RetryPolicy};
use crate::relay::relay_stream;
use crate::slot::{ConnectionSlot, ConnectionState};
use crate::{ClientError, Result};

/// A resilient RPC client for one logical agent session.
///
/// The client lazily spawns the agent on first use and transparently
/// replaces it when it dies, within the configured restart budget. Clones
/// share the same underlying slot.
///
/// # Example
///
/// ```rust,ignore
/// use tether_client::{AgentClient, LaunchConfig};
///
/// let client = AgentClient::for_process(LaunchConfig::new("my-agent").arg("--stdio")).build();
/// let pong = client.call("ping", serde_json::json!({})).await?;
/// client.dispose().await;
/// ```
#[derive(Clone)]
pub struct AgentClient {
    slot: ConnectionSlot,
    relay_claimed: Arc<AtomicBool>,
}

impl std::fmt::Debug for AgentClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentClient")
            .field("state", &self.slot.state())
            .field("version", &self.slot.current_version())
            .field("restarts", &self.slot.restart_count())
            .finish()
    }
}

impl AgentClient {
    /// Create a client with default options.
    pub fn new(launcher: impl AgentLauncher + 'static) -> Self {
        Self::builder(launcher).build()
    }

    /// Create a builder over a custom launcher.
    pub fn builder(launcher: impl AgentLauncher + 'static) -> AgentClientBuilder {
        AgentClientBuilder {
            launcher: Arc::new(launcher),
            options: ClientOptions::default(),
        }
    }

    /// Create a builder over a real agent subprocess.
    pub fn for_process(config: LaunchConfig) -> AgentClientBuilder {
        Self::builder(ProcessLauncher::new(config))
    }

    /// Issue a call and await its result, subject to the restart/retry
    /// policy. The method name doubles as the operation kind shown to the
    /// retry policy.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        execute(&self.slot, method, |connection| {
            let method = method.to_string();
            let params = params.clone();
            async move { connection.call(&method, params).await }
        })
        .await
    }

    /// [`call`](Self::call), with the result deserialized into `T`.
    pub async fn call_typed<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        let value = self.call(method, params).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Send a notification to the agent. No response is expected.
    pub async fn notify(&self, method: &str, params: Value) -> Result<()> {
        execute(&self.slot, method, |connection| {
            let method = method.to_string();
            let params = params.clone();
            async move { connection.notify(&method, params).await }
        })
        .await
    }

    /// The continuous event stream: agent notifications, plus restarted
    /// markers when configured.
    ///
    /// At most one stream per client; a second call yields an immediate
    /// error. The stream ends silently after [`dispose`](Self::dispose),
    /// and with the triggering failure when continuity is disabled or the
    /// restart budget runs out.
    pub fn events(&self) -> impl Stream<Item = Result<AgentEvent>> + Send + 'static {
        if self.relay_claimed.swap(true, Ordering::SeqCst) {
            return Either::Left(stream::once(async {
                Err(ClientError::Unavailable(
                    "event stream already consumed".to_string(),
                ))
            }));
        }
        Either::Right(relay_stream(self.slot.clone()))
    }

    /// Manually replace the current connection, whatever its health.
    pub async fn force_restart(&self) -> Result<()> {
        let version = self.slot.current_version();
        self.slot
            .restart(version, RestartReason::Manual, None)
            .await
    }

    /// Current lifecycle state of the underlying slot.
    pub fn state(&self) -> ConnectionState {
        self.slot.state()
    }

    /// Version of the current connection (0 before the first connect).
    pub fn connection_version(&self) -> u64 {
        self.slot.current_version()
    }

    /// Total successful restarts over the client's lifetime.
    pub fn restart_count(&self) -> u64 {
        self.slot.restart_count()
    }

    /// The most recent restart event, if any.
    pub fn last_restart(&self) -> Option<RestartEvent> {
        self.slot.last_restart()
    }

    /// Terminal shutdown: kill the agent, cancel every in-flight wait, and
    /// reject all future operations with `Disposed`.
    pub async fn dispose(&self) {
        self.slot.dispose().await;
    }
}

/// Fluent builder for [`AgentClient`].
pub struct AgentClientBuilder {
    launcher: Arc<dyn AgentLauncher>,
    options: ClientOptions,
}

impl AgentClientBuilder {
    /// Replace dead connections automatically (default: on).
    pub fn auto_restart(mut self, enabled: bool) -> Self {
        self.options.auto_restart = enabled;
        self
    }

    /// Keep the event stream alive across restarts (default: on).
    pub fn notification_continuity(mut self, enabled: bool) -> Self {
        self.options.continuity = enabled;
        self
    }

    /// Emit a synthetic restarted marker into the event stream after each
    /// observed restart (default: off).
    pub fn emit_restart_marker(mut self, enabled: bool) -> Self {
        self.options.emit_restart_marker = enabled;
        self
    }

    /// Per-call deadline; elapsing surfaces `ClientError::Timeout`.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.options.request_timeout = Some(timeout);
        self
    }

    /// Bounds on restart rate and backoff shape.
    pub fn restart_policy(mut self, policy: RestartPolicy) -> Self {
        self.options.restart_policy = policy;
        self
    }

    /// Decide whether disconnected operations run again (default: never).
    pub fn retry_policy(mut self, policy: impl RetryPolicy + 'static) -> Self {
        self.options.retry_policy = Arc::new(policy);
        self
    }

    /// Observer invoked after each successful restart.
    pub fn on_restart(mut self, callback: impl Fn(&RestartEvent) + Send + Sync + 'static) -> Self {
        self.options.on_restart = Some(Arc::new(callback));
        self
    }

    /// Answer call-style requests the agent sends back to the client.
    pub fn server_handler(mut self, handler: impl ServerRequestHandler + 'static) -> Self {
        self.options.server_handler = Arc::new(handler);
        self
    }

    pub fn build(self) -> AgentClient {
        AgentClient {
            slot: ConnectionSlot::new(self.launcher, self.options),
            relay_claimed: Arc::new(AtomicBool::new(false)),
        }
    }
}
