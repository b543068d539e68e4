//! Uniform detect-disconnect / restart / retry wrapper
//!
//! Every caller-facing operation goes through [`execute`], so disconnect
//! handling lives in exactly one place: obtain the live connection, run the
//! operation, and on a recognized disconnect trigger a restart (when
//! auto-restart is on) and consult the caller's retry policy. Anything that
//! is not a disconnect propagates untouched.

use std::future::Future;
use std::sync::Arc;

use tracing::debug;

use crate::connection::RpcConnection;
use crate::events::RestartReason;
use crate::policy::RetryContext;
use crate::slot::ConnectionSlot;
use crate::{ClientError, Result};

pub(crate) async fn execute<T, F, Fut>(
    slot: &ConnectionSlot,
    operation: &str,
    op: F,
) -> Result<T>
where
    F: Fn(Arc<RpcConnection>) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let options = slot.options();
    let mut attempt: u32 = 0;

    loop {
        let (connection, version) = slot.ensure_connected().await?;

        let outcome = match options.request_timeout {
            Some(limit) => match tokio::time::timeout(limit, op(connection)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(ClientError::Timeout(limit)),
            },
            None => op(connection).await,
        };

        let error = match outcome {
            Ok(value) => return Ok(value),
            Err(error) if error.is_disconnect() => error,
            Err(error) => return Err(error),
        };

        attempt += 1;
        debug!(operation, attempt, %error, "operation hit a dead connection");

        if options.auto_restart {
            // Version-guarded: if another caller (or the watcher) already
            // replaced the connection, this is a no-op.
            slot.restart(version, RestartReason::Operation(operation.to_string()), None)
                .await?;
        }

        let decision = options.retry_policy.decide(&RetryContext {
            operation,
            attempt,
            error: &error,
        });
        if !decision.retry {
            return Err(error);
        }

        if let Some(delay) = decision.delay {
            let cancel = slot.cancellation();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return Err(ClientError::Disposed),
            }
        }
        if let Some(hook) = decision.before_retry {
            hook().await?;
        }
        debug!(operation, attempt, "retrying after restart");
    }
}
