//! Signaling channel over the call registry.
//!
//! Participants exchange negotiation payloads by writing fields of the shared
//! call record and subscribing to each other's writes. No polling is involved:
//! subscriptions ride on the store's change feed.
//!
//! # Delivery
//!
//! `subscribe` registers on the change feed before reading the current
//! value, so a write racing with the subscription is never lost. The price is
//! that such a write may be delivered twice; consumers already tolerate this
//! because status writes are last-write-wins and payload fields are write-once.
//!
//! Multiple subscriptions to the same field are independent and all fire.
//! No ordering is promised across fields.

use crate::errors::CallError;
use crate::observability::metrics;
use crate::store::{CallStore, ChangeKind, FieldWrite, WatchScope, WriteOutcome};
use common::{CallId, CallRecord, RecordField};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

/// A field value delivered to a subscriber.
#[derive(Debug, Clone)]
pub struct FieldUpdate {
    pub call_id: CallId,
    pub field: RecordField,
    /// The record as read after the write.
    pub record: CallRecord,
}

/// Publish/subscribe access to call record fields.
#[derive(Clone)]
pub struct SignalingChannel {
    store: Arc<dyn CallStore>,
}

impl SignalingChannel {
    #[must_use]
    pub fn new(store: Arc<dyn CallStore>) -> Self {
        Self { store }
    }

    /// The backing registry store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn CallStore> {
        &self.store
    }

    /// Write one field of a call record.
    ///
    /// Idempotent from the caller's perspective: a repeated offer or answer
    /// write is ignored by the store and reported as [`WriteOutcome::Ignored`].
    ///
    /// # Errors
    ///
    /// Returns `CallError::Transport` if the store is unreachable and
    /// `CallError::CallNotFound` if the record does not exist. Callers inside
    /// a session treat either as session-ending.
    #[instrument(skip_all, fields(call_id = %call_id, field = %write.field()))]
    pub async fn publish(
        &self,
        call_id: &CallId,
        write: &FieldWrite,
    ) -> Result<WriteOutcome, CallError> {
        let field = write.field();
        let start = Instant::now();
        let result = self.store.write_field(call_id, write).await;

        let status = match &result {
            Ok(WriteOutcome::Written) => "written",
            Ok(WriteOutcome::Ignored) => {
                warn!(
                    target: "call.signaling",
                    call_id = %call_id,
                    field = %field,
                    "Field already written, keeping original value"
                );
                "ignored"
            }
            Err(_) => "error",
        };
        metrics::record_signaling_write(field.wire_name(), status, start.elapsed());

        result
    }

    /// Subscribe to one field of a call record.
    ///
    /// `on_change` receives the current value immediately if the field is
    /// set, then every subsequent write. Callbacks run on the subscription's
    /// own task, one at a time.
    ///
    /// # Errors
    ///
    /// Returns `CallError::Transport` if the change feed cannot be opened or
    /// the current value cannot be read.
    pub async fn subscribe<F>(
        &self,
        call_id: CallId,
        field: RecordField,
        on_change: F,
    ) -> Result<Subscription, CallError>
    where
        F: Fn(FieldUpdate) + Send + Sync + 'static,
    {
        self.subscribe_until_lost(call_id, field, on_change, || {})
            .await
    }

    /// Like [`subscribe`](Self::subscribe), and runs `on_lost` if the store's
    /// change feed closes while the subscription is still active. Nothing is
    /// delivered afterwards.
    ///
    /// # Errors
    ///
    /// Returns `CallError::Transport` if the change feed cannot be opened or
    /// the current value cannot be read.
    pub async fn subscribe_until_lost<F, L>(
        &self,
        call_id: CallId,
        field: RecordField,
        on_change: F,
        on_lost: L,
    ) -> Result<Subscription, CallError>
    where
        F: Fn(FieldUpdate) + Send + Sync + 'static,
        L: FnOnce() + Send + 'static,
    {
        let mut changes = self.store.watch(WatchScope::Call(call_id)).await?;
        let current = self.store.get_record(&call_id).await?;

        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();

        tokio::spawn(async move {
            if let Some(record) = current {
                if record.field_value(field).is_some() {
                    on_change(FieldUpdate {
                        call_id,
                        field,
                        record,
                    });
                }
            }

            loop {
                tokio::select! {
                    biased;

                    () = task_cancel.cancelled() => break,

                    change = changes.recv() => {
                        let Some(change) = change else {
                            if task_cancel.is_cancelled() {
                                break;
                            }
                            warn!(
                                target: "call.signaling",
                                call_id = %call_id,
                                field = %field,
                                "Change feed closed under an active subscription"
                            );
                            task_cancel.cancel();
                            on_lost();
                            break;
                        };
                        if change.change != ChangeKind::Field(field) {
                            continue;
                        }
                        if change.record.field_value(field).is_none() {
                            continue;
                        }
                        on_change(FieldUpdate {
                            call_id,
                            field,
                            record: change.record,
                        });
                    }
                }
            }
        });

        debug!(
            target: "call.signaling",
            call_id = %call_id,
            field = %field,
            "Subscribed to field"
        );

        Ok(Subscription {
            call_id,
            field,
            cancel,
        })
    }
}

/// A live field subscription.
///
/// Dropping the subscription unsubscribes it.
#[derive(Debug)]
pub struct Subscription {
    call_id: CallId,
    field: RecordField,
    cancel: CancellationToken,
}

impl Subscription {
    /// Stop delivering changes.
    ///
    /// Returns `true` the first time; later calls are no-ops returning `false`.
    pub fn unsubscribe(&self) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        self.cancel.cancel();
        debug!(
            target: "call.signaling",
            call_id = %self.call_id,
            field = %self.field,
            "Unsubscribed from field"
        );
        true
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    #[must_use]
    pub fn field(&self) -> RecordField {
        self.field
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
