//! Notification relay: one lazy event sequence spanning many connections
//!
//! The relay pulls from the current connection's notification channel; when
//! that channel ends because the connection died, it runs the same restart
//! procedure as the executor and resumes from the replacement, optionally
//! yielding a synthetic restarted marker. Consumers observe no gap other
//! than the marker. Ordering across the restart boundary relative to
//! retried in-flight calls is not guaranteed.

use async_stream::stream;
use futures::Stream;
use tracing::debug;

use crate::connection::CloseCause;
use crate::events::{AgentEvent, RestartReason};
use crate::slot::ConnectionSlot;
use crate::{ClientError, Result};

/// Build the event stream for `slot`.
///
/// Ends silently after dispose; ends with the triggering failure when
/// continuity is disabled or the restart budget runs out.
pub(crate) fn relay_stream(slot: ConnectionSlot) -> impl Stream<Item = Result<AgentEvent>> {
    stream! {
        // Markers are only emitted for restarts observed by this stream,
        // not ones that predate it.
        let mut seen_restarts = slot.restart_count();

        loop {
            let (connection, version) = match slot.ensure_connected().await {
                Ok(current) => current,
                Err(ClientError::Disposed) => return,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };

            if slot.options().emit_restart_marker {
                if let Some(event) = slot.last_restart() {
                    if event.restarts > seen_restarts {
                        seen_restarts = event.restarts;
                        yield Ok(AgentEvent::Restarted(event));
                    }
                }
            }

            let Some(mut notifications) = slot.take_notifications(version).await else {
                // Lost a race with a concurrent restart: re-query the slot.
                if slot.current_version() != version {
                    continue;
                }
                yield Err(ClientError::Unavailable(
                    "notification stream already consumed".to_string(),
                ));
                return;
            };

            while let Some(notification) = notifications.recv().await {
                yield Ok(AgentEvent::Notification(notification));
            }

            // Channel closed: the connection is terminal.
            let cause = connection
                .close_cause()
                .unwrap_or(CloseCause::Disconnect(crate::DisconnectReason::ChannelClosed));
            if matches!(cause, CloseCause::Disposed) {
                return;
            }
            if !slot.options().continuity {
                debug!("notification stream ending: continuity disabled");
                yield Err(cause.to_error());
                return;
            }

            match slot.restart(version, RestartReason::EventStream, None).await {
                Ok(()) => {}
                Err(ClientError::Disposed) => return,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            }
        }
    }
}
