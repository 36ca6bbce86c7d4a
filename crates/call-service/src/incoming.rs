//! Incoming call watcher.
//!
//! Watches the whole registry and reports every record that is ringing for
//! the local user. Records already ringing when the watcher starts are
//! reported first.
//!
//! Notifications are not deduplicated: any write to a ringing record (the
//! caller's offer landing, for example) reports it again. Consumers that
//! prompt the user should key their prompt on the call id.
//!
//! The watcher stops on [`IncomingCallWatcher::stop`], on drop, or when the
//! registry change feed closes. [`IncomingCallWatcher::stopped`] resolves in
//! every case, so the owner can react to a feed that went away.

use crate::errors::CallError;
use crate::observability::metrics;
use crate::store::{CallStore, WatchScope};
use common::{CallRecord, UserId};
use std::sync::Arc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::{debug, info, warn};

/// Live registry watch for one user.
///
/// Dropping the watcher stops it.
#[derive(Debug)]
pub struct IncomingCallWatcher {
    user: UserId,
    cancel_token: CancellationToken,
    /// Cancelled when the watch task exits.
    exited: CancellationToken,
}

impl IncomingCallWatcher {
    /// Start watching for calls addressed to `user`.
    ///
    /// The change feed is opened before the registry is listed, so a call
    /// created during startup is reported (possibly twice) rather than
    /// missed. `on_incoming` runs on the watcher's own task, one call at a
    /// time.
    ///
    /// # Errors
    ///
    /// Returns `CallError::Transport` if the registry cannot be watched or
    /// listed.
    pub async fn start<F>(
        store: Arc<dyn CallStore>,
        user: UserId,
        cancel_token: CancellationToken,
        on_incoming: F,
    ) -> Result<Self, CallError>
    where
        F: Fn(CallRecord) + Send + Sync + 'static,
    {
        let mut changes = store.watch(WatchScope::Registry).await?;
        let existing = store.list_records().await?;

        let task_user = user.clone();
        let task_cancel = cancel_token.clone();
        let exited = CancellationToken::new();
        let exit_guard = exited.clone().drop_guard();

        tokio::spawn(async move {
            let _exit_guard = exit_guard;
            let notify = |record: CallRecord| {
                debug!(
                    target: "call.watcher",
                    call_id = %record.call_id,
                    caller_id = %record.caller_id,
                    "Incoming call"
                );
                metrics::record_incoming_notification();
                on_incoming(record);
            };

            for record in existing {
                if record.is_ringing_for(&task_user) {
                    notify(record);
                }
            }

            loop {
                tokio::select! {
                    biased;

                    () = task_cancel.cancelled() => break,

                    change = changes.recv() => {
                        let Some(change) = change else {
                            warn!(
                                target: "call.watcher",
                                user = %task_user,
                                "Registry change feed closed, incoming calls will not be reported"
                            );
                            break;
                        };
                        if change.record.is_ringing_for(&task_user) {
                            notify(change.record);
                        }
                    }
                }
            }

            debug!(target: "call.watcher", user = %task_user, "Incoming call watcher stopped");
        });

        info!(target: "call.watcher", user = %user, "Watching for incoming calls");

        Ok(Self {
            user,
            cancel_token,
            exited,
        })
    }

    #[must_use]
    pub fn user(&self) -> &UserId {
        &self.user
    }

    /// Stop reporting calls. Idempotent.
    pub fn stop(&self) {
        self.cancel_token.cancel();
    }

    /// Whether calls are still being reported. `false` once stopped or once
    /// the change feed has closed.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.cancel_token.is_cancelled() && !self.exited.is_cancelled()
    }

    /// Resolves once the watch task has exited, for whatever reason.
    #[must_use]
    pub fn stopped(&self) -> WaitForCancellationFutureOwned {
        self.exited.clone().cancelled_owned()
    }
}

impl Drop for IncomingCallWatcher {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}
