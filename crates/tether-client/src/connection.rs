//! RPC connection over one agent instance
//!
//! ## Responsibilities
//!
//! - Correlate outgoing calls with responses by request id
//! - Dispatch inbound notifications and agent-initiated requests
//! - Fail every pending call when the channel closes
//!
//! One [`RpcConnection`] wraps exactly one launched agent. The background
//! read loop is the sole resolver of pending calls; callers only insert and
//! remove their own table entries, so calls may complete in any order and
//! are matched by id, not arrival.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::events::Notification;
use crate::launcher::{AgentGuard, LaunchedAgent, ProcessExit};
use crate::wire::{MessageReader, MessageWriter};
use crate::{ClientError, DisconnectReason, Result};
use tether_protocol::{Message, RequestId, RpcError};

/// Answers call-style requests the agent sends back to the client
/// (approval prompts and the like).
///
/// Unknown methods should return [`RpcError::method_not_found`]; the
/// default handler does exactly that, so an agent probing for optional
/// capabilities gets a well-formed refusal instead of silence.
#[async_trait]
pub trait ServerRequestHandler: Send + Sync {
    async fn handle(&self, method: &str, params: Value) -> std::result::Result<Value, RpcError>;
}

/// Default handler: every agent-initiated method is unknown.
pub struct RejectAllRequests;

#[async_trait]
impl ServerRequestHandler for RejectAllRequests {
    async fn handle(&self, method: &str, _params: Value) -> std::result::Result<Value, RpcError> {
        Err(RpcError::method_not_found(method))
    }
}

/// Why the connection became terminal.
#[derive(Debug, Clone)]
pub(crate) enum CloseCause {
    Protocol(String),
    Disconnect(DisconnectReason),
    Disposed,
}

impl CloseCause {
    pub(crate) fn to_error(&self) -> ClientError {
        match self {
            CloseCause::Protocol(detail) => ClientError::Protocol(detail.clone()),
            CloseCause::Disconnect(reason) => ClientError::Disconnected(reason.clone()),
            CloseCause::Disposed => ClientError::Disposed,
        }
    }
}

type PendingTable = Mutex<HashMap<RequestId, oneshot::Sender<Result<Value>>>>;

struct ConnShared {
    writer: tokio::sync::Mutex<MessageWriter>,
    pending: PendingTable,
    closed: watch::Sender<Option<CloseCause>>,
    guard: Box<dyn AgentGuard>,
}

impl ConnShared {
    /// Mark the connection terminal. First cause wins; later calls no-op.
    /// Every pending call resolves with the close failure.
    fn close_with(&self, cause: CloseCause) {
        let first = self.closed.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(cause.clone());
                true
            } else {
                false
            }
        });
        if !first {
            return;
        }

        let drained: Vec<_> = {
            let mut pending = self.pending.lock();
            pending.drain().collect()
        };
        if !drained.is_empty() {
            debug!(count = drained.len(), "failing pending calls on close");
        }
        for (_, tx) in drained {
            let _ = tx.send(Err(cause.to_error()));
        }
        self.guard.terminate();
    }

    fn close_cause(&self) -> Option<CloseCause> {
        self.closed.borrow().clone()
    }
}

/// One live connection to one agent instance. Terminal once closed; the
/// slot replaces it rather than reviving it.
pub struct RpcConnection {
    shared: Arc<ConnShared>,
    next_id: AtomicU64,
    read_task: JoinHandle<()>,
}

impl RpcConnection {
    /// Wire up a launched agent: spawn the read loop, return the connection
    /// plus the notification channel and the process exit signal (consumed
    /// by the slot's watcher).
    pub(crate) fn spawn(
        agent: LaunchedAgent,
        handler: Arc<dyn ServerRequestHandler>,
        cancel: CancellationToken,
    ) -> (
        Self,
        mpsc::UnboundedReceiver<Notification>,
        oneshot::Receiver<ProcessExit>,
    ) {
        let (closed, _) = watch::channel(None);
        let shared = Arc::new(ConnShared {
            writer: tokio::sync::Mutex::new(MessageWriter::new(agent.writer)),
            pending: Mutex::new(HashMap::new()),
            closed,
            guard: agent.guard,
        });

        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let reader = MessageReader::new(agent.reader);
        let read_task = tokio::spawn(read_loop(
            reader,
            Arc::clone(&shared),
            notify_tx,
            handler,
            cancel,
        ));

        let connection = Self {
            shared,
            next_id: AtomicU64::new(1),
            read_task,
        };
        (connection, notify_rx, agent.exit)
    }

    /// Send a call and await its response.
    ///
    /// Cancellation-safe: dropping the returned future abandons the pending
    /// entry, and a later response for that id is discarded by the read
    /// loop. The remote call itself is not cancelled.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        if let Some(cause) = self.shared.close_cause() {
            return Err(cause.to_error());
        }

        let id = RequestId::Number(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().insert(id.clone(), tx);
        let entry = PendingEntry {
            shared: Arc::clone(&self.shared),
            id: id.clone(),
            armed: true,
        };

        let request = Message::request(id, method, params);
        if let Err(e) = self.write(&request).await {
            drop(entry);
            return Err(e);
        }

        match rx.await {
            Ok(outcome) => {
                entry.disarm();
                outcome
            }
            // Sender dropped without resolving: the read task was torn down
            // before close_with ran (dispose-time abort).
            Err(_) => {
                entry.disarm();
                Err(self
                    .shared
                    .close_cause()
                    .map(|c| c.to_error())
                    .unwrap_or(ClientError::Disposed))
            }
        }
    }

    /// Send a notification to the agent. No response is expected.
    pub async fn notify(&self, method: &str, params: Value) -> Result<()> {
        if let Some(cause) = self.shared.close_cause() {
            return Err(cause.to_error());
        }
        self.write(&Message::notification(method, params)).await
    }

    async fn write(&self, message: &Message) -> Result<()> {
        let mut writer = self.shared.writer.lock().await;
        match writer.write_message(message).await {
            Ok(()) => Ok(()),
            Err(ClientError::Io(e)) => {
                let reason = DisconnectReason::WriteFailed(e.to_string());
                Err(ClientError::Disconnected(reason))
            }
            Err(other) => Err(other),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.close_cause().is_some()
    }

    /// The failure a caller would observe on this connection right now.
    pub(crate) fn close_cause(&self) -> Option<CloseCause> {
        self.shared.close_cause()
    }

    /// Resolves once the connection is terminal.
    pub(crate) async fn closed(&self) -> CloseCause {
        let mut rx = self.shared.closed.subscribe();
        loop {
            {
                let current = rx.borrow_and_update();
                if let Some(cause) = current.clone() {
                    return cause;
                }
            }
            if rx.changed().await.is_err() {
                return CloseCause::Disconnect(DisconnectReason::ChannelClosed);
            }
        }
    }

    /// Terminate the connection: kill the agent, stop the read loop, and
    /// fail anything still pending with `cause`.
    pub(crate) fn shutdown(&self, cause: CloseCause) {
        self.shared.close_with(cause);
        self.read_task.abort();
    }

    /// Stderr tail of the underlying process, for restart diagnostics.
    pub(crate) fn diagnostic_tail(&self) -> Vec<String> {
        self.shared.guard.diagnostic_tail()
    }
}

impl Drop for RpcConnection {
    fn drop(&mut self) {
        self.shared
            .close_with(CloseCause::Disconnect(DisconnectReason::ChannelClosed));
        self.read_task.abort();
    }
}

/// Removes the pending entry when a caller abandons the wait.
struct PendingEntry {
    shared: Arc<ConnShared>,
    id: RequestId,
    armed: bool,
}

impl PendingEntry {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingEntry {
    fn drop(&mut self) {
        if self.armed {
            self.shared.pending.lock().remove(&self.id);
        }
    }
}

async fn read_loop(
    mut reader: MessageReader,
    shared: Arc<ConnShared>,
    notify_tx: mpsc::UnboundedSender<Notification>,
    handler: Arc<dyn ServerRequestHandler>,
    cancel: CancellationToken,
) {
    let cause = loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break CloseCause::Disposed,
            next = reader.next_message() => next,
        };
        match next {
            Ok(Some(Message::Response { id, result })) => {
                let waiter = shared.pending.lock().remove(&id);
                match waiter {
                    Some(tx) => {
                        let outcome = result.map_err(ClientError::Rpc);
                        let _ = tx.send(outcome);
                    }
                    // Caller cancelled its wait; the late response is noise.
                    None => debug!(%id, "discarding response for abandoned call"),
                }
            }
            Ok(Some(Message::Notification { method, params })) => {
                // Receiver dropped means nobody is listening; keep draining
                // so responses still flow.
                let _ = notify_tx.send(Notification { method, params });
            }
            Ok(Some(Message::Request { id, method, params })) => {
                let handler = Arc::clone(&handler);
                let shared = Arc::clone(&shared);
                tokio::spawn(async move {
                    let reply = match handler.handle(&method, params).await {
                        Ok(value) => Message::response_ok(id, value),
                        Err(error) => Message::response_err(id, error),
                    };
                    let mut writer = shared.writer.lock().await;
                    if let Err(e) = writer.write_message(&reply).await {
                        warn!(%method, "failed to answer agent request: {}", e);
                    }
                });
            }
            Ok(None) => break CloseCause::Disconnect(DisconnectReason::ChannelClosed),
            Err(ClientError::Protocol(detail)) => {
                warn!("closing connection on protocol violation: {}", detail);
                break CloseCause::Protocol(detail);
            }
            Err(e) => {
                debug!("read loop ending: {}", e);
                break CloseCause::Disconnect(DisconnectReason::ChannelClosed);
            }
        }
    };
    shared.close_with(cause);
    // notify_tx drops here, completing the notification stream.
}
