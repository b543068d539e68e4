//! Connection slot and restart controller
//!
//! ## Responsibilities
//!
//! - Own at most one live [`RpcConnection`], tagged with a version
//! - Lazily create, and single-flight re-create, that connection
//! - Enforce the restart budget (sliding window + backoff + fault caps)
//! - Watch each live agent process and restart proactively when it dies
//!
//! All creation and replacement happens under one async mutex; callers
//! outside the lock read an atomic snapshot (version, state) and tolerate
//! racing with an in-progress restart by re-querying.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::connection::{CloseCause, RpcConnection};
use crate::events::{Notification, RestartEvent, RestartReason};
use crate::launcher::{AgentLauncher, ProcessExit};
use crate::options::ClientOptions;
use crate::{ClientError, DisconnectReason, Result};

/// Lifecycle state of the connection slot.
///
/// `Restarting` doubles as "not connected yet": the slot starts there and
/// the first operation creates connection #1 on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Restarting,
    Faulted,
    Disposed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Connected => "connected",
            ConnectionState::Restarting => "restarting",
            ConnectionState::Faulted => "faulted",
            ConnectionState::Disposed => "disposed",
        };
        f.write_str(s)
    }
}

/// Holder of the one live connection plus its version.
#[derive(Clone)]
pub(crate) struct ConnectionSlot {
    shared: Arc<SlotShared>,
}

struct SlotShared {
    launcher: Arc<dyn AgentLauncher>,
    options: ClientOptions,
    cancel: CancellationToken,
    inner: tokio::sync::Mutex<SlotInner>,
    status: parking_lot::Mutex<StatusInner>,
    version: AtomicU64,
    restarts: AtomicU64,
}

struct SlotInner {
    active: Option<ActiveConnection>,
    /// Timestamps of successful restarts still inside the rate window.
    restart_log: VecDeque<Instant>,
    consecutive_failures: u32,
}

struct ActiveConnection {
    connection: Arc<RpcConnection>,
    /// Taken once by the notification relay.
    notifications: Option<mpsc::UnboundedReceiver<Notification>>,
    version: u64,
    watcher: JoinHandle<()>,
}

struct StatusInner {
    state: ConnectionState,
    fault: Option<String>,
    last_restart: Option<RestartEvent>,
}

/// Diagnostics carried into the restart event when a dead occupant is
/// replaced.
struct ReplacementContext {
    reason: RestartReason,
    previous_exit: Option<ProcessExit>,
    stderr_tail: Vec<String>,
}

impl ConnectionSlot {
    pub(crate) fn new(launcher: Arc<dyn AgentLauncher>, options: ClientOptions) -> Self {
        Self {
            shared: Arc::new(SlotShared {
                launcher,
                options,
                cancel: CancellationToken::new(),
                inner: tokio::sync::Mutex::new(SlotInner {
                    active: None,
                    restart_log: VecDeque::new(),
                    consecutive_failures: 0,
                }),
                status: parking_lot::Mutex::new(StatusInner {
                    state: ConnectionState::Restarting,
                    fault: None,
                    last_restart: None,
                }),
                version: AtomicU64::new(0),
                restarts: AtomicU64::new(0),
            }),
        }
    }

    pub(crate) fn options(&self) -> &ClientOptions {
        &self.shared.options
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.shared.status.lock().state
    }

    pub(crate) fn current_version(&self) -> u64 {
        self.shared.version.load(Ordering::SeqCst)
    }

    pub(crate) fn restart_count(&self) -> u64 {
        self.shared.restarts.load(Ordering::SeqCst)
    }

    pub(crate) fn last_restart(&self) -> Option<RestartEvent> {
        self.shared.status.lock().last_restart.clone()
    }

    pub(crate) fn cancellation(&self) -> CancellationToken {
        self.shared.cancel.clone()
    }

    /// Current (connection, version), creating connection #1 on demand.
    ///
    /// Never replaces a dead occupant; that is [`restart`]'s job, so a
    /// caller holding a closed connection fails fast and the executor
    /// decides what happens next.
    pub(crate) async fn ensure_connected(&self) -> Result<(Arc<RpcConnection>, u64)> {
        self.shared.check_terminal()?;
        let mut inner = self.shared.inner.lock().await;
        self.shared.check_terminal()?;

        if let Some(active) = &inner.active {
            return Ok((Arc::clone(&active.connection), active.version));
        }
        connect_loop(&self.shared, &mut inner, None).await
    }

    /// Replace the connection that was current at `expected_version`.
    ///
    /// The sole place replacement happens. No-ops when another caller
    /// already restarted (version moved on), so concurrent detections of
    /// the same death collapse into one recreation.
    pub(crate) async fn restart(
        &self,
        expected_version: u64,
        reason: RestartReason,
        previous_exit: Option<ProcessExit>,
    ) -> Result<()> {
        let shared = &self.shared;
        shared.check_terminal()?;
        let mut inner = shared.inner.lock().await;
        // Re-check: a restart that faulted or a dispose may have completed
        // while this caller waited on the lock.
        shared.check_terminal()?;
        if shared.version.load(Ordering::SeqCst) != expected_version {
            debug!(
                expected_version,
                current = shared.version.load(Ordering::SeqCst),
                "restart already handled by another caller"
            );
            return Ok(());
        }

        let mut ctx = ReplacementContext {
            reason,
            previous_exit,
            stderr_tail: Vec::new(),
        };
        if let Some(active) = inner.active.take() {
            active.watcher.abort();
            ctx.stderr_tail = active.connection.diagnostic_tail();
            active
                .connection
                .shutdown(CloseCause::Disconnect(DisconnectReason::ChannelClosed));
        }
        {
            let mut status = shared.status.lock();
            status.state = ConnectionState::Restarting;
        }
        match &ctx.previous_exit {
            Some(exit) => info!(%exit, reason = %ctx.reason, "agent died; restarting"),
            None => info!(reason = %ctx.reason, "restarting agent connection"),
        }

        connect_loop(shared, &mut inner, Some(ctx)).await.map(|_| ())
    }

    /// Hand the current connection's notification channel to the relay.
    /// Returns `None` when already taken or when `version` is stale.
    pub(crate) async fn take_notifications(
        &self,
        version: u64,
    ) -> Option<mpsc::UnboundedReceiver<Notification>> {
        let mut inner = self.shared.inner.lock().await;
        inner
            .active
            .as_mut()
            .filter(|active| active.version == version)
            .and_then(|active| active.notifications.take())
    }

    /// Terminal shutdown: cancel every wait, kill the live agent, reject
    /// all future operations with `Disposed`.
    pub(crate) async fn dispose(&self) {
        {
            let mut status = self.shared.status.lock();
            if status.state == ConnectionState::Disposed {
                return;
            }
            status.state = ConnectionState::Disposed;
        }
        self.shared.cancel.cancel();
        let mut inner = self.shared.inner.lock().await;
        if let Some(active) = inner.active.take() {
            active.watcher.abort();
            active.connection.shutdown(CloseCause::Disposed);
        }
        info!("connection slot disposed");
    }
}

impl SlotShared {
    fn check_terminal(&self) -> Result<()> {
        let status = self.status.lock();
        match status.state {
            ConnectionState::Disposed => Err(ClientError::Disposed),
            ConnectionState::Faulted => Err(ClientError::Unavailable(
                status
                    .fault
                    .clone()
                    .unwrap_or_else(|| "restart budget exhausted".to_string()),
            )),
            _ => Ok(()),
        }
    }

    /// Transition to Faulted and return the error every waiter observes.
    fn fault(&self, message: String) -> ClientError {
        error!("connection slot faulted: {}", message);
        let mut status = self.status.lock();
        if status.state != ConnectionState::Disposed {
            status.state = ConnectionState::Faulted;
            status.fault = Some(message.clone());
        }
        ClientError::Unavailable(message)
    }
}

/// Budgeted connection creation, shared by lazy creation and restart.
///
/// Loops: evict expired restart records, fault when the window budget is
/// spent, wait the computed backoff, attempt creation. Only successful
/// restarts append records; creation failures count against the separate
/// consecutive-failure cap.
async fn connect_loop(
    shared: &Arc<SlotShared>,
    inner: &mut SlotInner,
    mut replacement: Option<ReplacementContext>,
) -> Result<(Arc<RpcConnection>, u64)> {
    let policy = &shared.options.restart_policy;
    loop {
        let now = Instant::now();
        while inner
            .restart_log
            .front()
            .is_some_and(|t| now.duration_since(*t) >= policy.window)
        {
            inner.restart_log.pop_front();
        }
        let window_count = inner.restart_log.len() as u32;
        if replacement.is_some() && window_count >= policy.max_restarts_per_window {
            return Err(shared.fault(format!(
                "restart rate limit exceeded: {} restarts within {:?}",
                window_count, policy.window
            )));
        }

        let attempt = window_count + inner.consecutive_failures + 1;
        let delay = policy.backoff_delay(attempt);
        if !delay.is_zero() {
            debug!(attempt, ?delay, "backing off before connection attempt");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shared.cancel.cancelled() => return Err(ClientError::Disposed),
            }
        }

        match create_connection(shared, inner).await {
            Ok((connection, version)) => {
                inner.consecutive_failures = 0;
                if let Some(ctx) = replacement.take() {
                    inner.restart_log.push_back(Instant::now());
                    let restarts = shared.restarts.fetch_add(1, Ordering::SeqCst) + 1;
                    let event = RestartEvent {
                        restarts,
                        at: Utc::now(),
                        previous_exit: ctx.previous_exit,
                        reason: ctx.reason,
                        stderr_tail: ctx.stderr_tail,
                    };
                    shared.status.lock().last_restart = Some(event.clone());
                    info!(restarts, version, "agent connection restarted");
                    if let Some(callback) = &shared.options.on_restart {
                        callback(&event);
                    }
                }
                return Ok((connection, version));
            }
            Err(e) => {
                inner.consecutive_failures += 1;
                warn!(
                    failures = inner.consecutive_failures,
                    "connection attempt failed: {}", e
                );
                if inner.consecutive_failures >= policy.max_consecutive_failures {
                    return Err(shared.fault(format!(
                        "agent failed to start after {} consecutive attempts: {}",
                        inner.consecutive_failures, e
                    )));
                }
            }
        }
    }
}

/// One creation attempt: launch, wire up the connection, bump the version,
/// attach the exit watcher.
async fn create_connection(
    shared: &Arc<SlotShared>,
    inner: &mut SlotInner,
) -> Result<(Arc<RpcConnection>, u64)> {
    let agent = shared.launcher.launch().await?;
    let (connection, notifications, exit) = RpcConnection::spawn(
        agent,
        Arc::clone(&shared.options.server_handler),
        shared.cancel.child_token(),
    );
    let connection = Arc::new(connection);
    let version = shared.version.fetch_add(1, Ordering::SeqCst) + 1;
    let watcher = spawn_watcher(Arc::downgrade(shared), exit, version);
    inner.active = Some(ActiveConnection {
        connection: Arc::clone(&connection),
        notifications: Some(notifications),
        version,
        watcher,
    });
    {
        let mut status = shared.status.lock();
        if status.state != ConnectionState::Disposed {
            status.state = ConnectionState::Connected;
        }
    }
    info!(version, "agent connection established");
    Ok((connection, version))
}

/// Waits on one connection's termination signal and proactively runs the
/// restart procedure, so a future caller does not have to discover the dead
/// connection reactively.
///
/// Holds only a `Weak` slot reference; connections and their watchers never
/// keep the slot alive.
fn spawn_watcher(
    shared: Weak<SlotShared>,
    exit: oneshot::Receiver<ProcessExit>,
    version: u64,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        // Err means the launcher's wait task is gone; treat it as an exit
        // with unknown status.
        let exit_status = exit.await.ok();
        let Some(shared) = shared.upgrade() else {
            return;
        };
        if shared.cancel.is_cancelled() {
            return;
        }
        if !shared.options.auto_restart {
            debug!(version, "agent exited; auto-restart disabled");
            return;
        }
        let slot = ConnectionSlot { shared };
        match slot
            .restart(version, RestartReason::ProcessExited, exit_status)
            .await
        {
            Ok(()) => {}
            Err(ClientError::Disposed) => {}
            Err(e) => warn!(version, "proactive restart failed: {}", e),
        }
    })
}
