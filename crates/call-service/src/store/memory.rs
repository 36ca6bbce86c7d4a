//! Process-local call store.
//!
//! Records live in a map guarded by a `tokio::sync::RwLock`; every successful
//! write is published on a broadcast feed while the write lock is held, so
//! watchers observe changes in write order.

use super::{
    CallStore, ChangeKind, ChangeStream, FieldWrite, RecordChange, WatchScope, WriteOutcome,
    CHANGE_STREAM_BUFFER,
};
use crate::errors::CallError;
use async_trait::async_trait;
use common::{CallId, CallRecord};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{debug, warn};

/// Capacity of the shared change feed.
const CHANGE_FEED_CAPACITY: usize = 1024;

/// In-memory call store.
///
/// Cheaply cloneable; clones share the same records and change feed.
#[derive(Clone)]
pub struct InMemoryCallStore {
    records: Arc<RwLock<HashMap<CallId, CallRecord>>>,
    changes: broadcast::Sender<RecordChange>,
}

impl Default for InMemoryCallStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCallStore {
    #[must_use]
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self {
            records: Arc::new(RwLock::new(HashMap::new())),
            changes,
        }
    }

    /// Number of stored records.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    fn publish(&self, change: RecordChange) {
        // No receivers is fine: nobody is watching yet.
        let _ = self.changes.send(change);
    }
}

#[async_trait]
impl CallStore for InMemoryCallStore {
    async fn create_record(&self, record: &CallRecord) -> Result<(), CallError> {
        let mut records = self.records.write().await;
        if records.contains_key(&record.call_id) {
            return Err(CallError::Conflict("Call record already exists".to_string()));
        }
        records.insert(record.call_id, record.clone());
        self.publish(RecordChange {
            call_id: record.call_id,
            change: ChangeKind::Created,
            record: record.clone(),
        });

        debug!(
            target: "call.store.memory",
            call_id = %record.call_id,
            "Call record created"
        );
        Ok(())
    }

    async fn get_record(&self, call_id: &CallId) -> Result<Option<CallRecord>, CallError> {
        Ok(self.records.read().await.get(call_id).cloned())
    }

    async fn list_records(&self) -> Result<Vec<CallRecord>, CallError> {
        Ok(self.records.read().await.values().cloned().collect())
    }

    async fn write_field(
        &self,
        call_id: &CallId,
        write: &FieldWrite,
    ) -> Result<WriteOutcome, CallError> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(call_id)
            .ok_or_else(|| CallError::CallNotFound(call_id.to_string()))?;

        let outcome = write.apply_to(record);
        if outcome == WriteOutcome::Written {
            let snapshot = record.clone();
            self.publish(RecordChange {
                call_id: *call_id,
                change: ChangeKind::Field(write.field()),
                record: snapshot,
            });
        }
        Ok(outcome)
    }

    async fn watch(&self, scope: WatchScope) -> Result<ChangeStream, CallError> {
        let mut feed = self.changes.subscribe();
        let (tx, rx) = mpsc::channel(CHANGE_STREAM_BUFFER);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = tx.closed() => break,

                    change = feed.recv() => match change {
                        Ok(change) => {
                            if !scope.matches(&change.call_id) {
                                continue;
                            }
                            if tx.send(change).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(
                                target: "call.store.memory",
                                skipped,
                                "Change watcher lagged, notifications dropped"
                            );
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });

        Ok(rx)
    }
}
