//! Registry store with switchable transport failures.
//!
//! Wraps an [`InMemoryCallStore`]; each operation class can be made to fail
//! with `CallError::Transport` as if the store had become unreachable, and
//! open change feeds can be cut as if the store connection dropped.

use async_trait::async_trait;
use call_service::errors::CallError;
use call_service::store::{
    CallStore, ChangeStream, FieldWrite, InMemoryCallStore, WatchScope, WriteOutcome,
    CHANGE_STREAM_BUFFER,
};
use common::{CallId, CallRecord, RecordField};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn unreachable_store() -> CallError {
    CallError::Transport("store unreachable".to_string())
}

/// `CallStore` that fails on demand.
#[derive(Default)]
pub struct FailingCallStore {
    inner: InMemoryCallStore,
    fail_creates: AtomicBool,
    fail_writes: AtomicBool,
    /// Only fail writes to this field, if set.
    fail_field: Mutex<Option<RecordField>>,
    fail_watches: AtomicBool,
    /// Cancelled to close every feed opened so far.
    sever: Mutex<CancellationToken>,
    failed_ops: AtomicUsize,
}

impl FailingCallStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The wrapped store, for reading back state.
    pub fn inner(&self) -> &InMemoryCallStore {
        &self.inner
    }

    pub fn set_fail_creates(&self, fail: bool) {
        self.fail_creates.store(fail, Ordering::SeqCst);
    }

    /// Fail every field write.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Fail writes to one field only.
    pub fn fail_writes_to(&self, field: RecordField) {
        *self.fail_field.lock().unwrap() = Some(field);
    }

    pub fn set_fail_watches(&self, fail: bool) {
        self.fail_watches.store(fail, Ordering::SeqCst);
    }

    /// Close every change feed opened so far. Feeds opened afterwards work.
    pub fn sever_watches(&self) {
        let mut sever = self.sever.lock().unwrap();
        sever.cancel();
        *sever = CancellationToken::new();
    }

    /// Number of operations that were failed on purpose.
    pub fn failed_ops(&self) -> usize {
        self.failed_ops.load(Ordering::SeqCst)
    }

    fn fail(&self) -> CallError {
        self.failed_ops.fetch_add(1, Ordering::SeqCst);
        unreachable_store()
    }
}

#[async_trait]
impl CallStore for FailingCallStore {
    async fn create_record(&self, record: &CallRecord) -> Result<(), CallError> {
        if self.fail_creates.load(Ordering::SeqCst) {
            return Err(self.fail());
        }
        self.inner.create_record(record).await
    }

    async fn get_record(&self, call_id: &CallId) -> Result<Option<CallRecord>, CallError> {
        self.inner.get_record(call_id).await
    }

    async fn list_records(&self) -> Result<Vec<CallRecord>, CallError> {
        self.inner.list_records().await
    }

    async fn write_field(
        &self,
        call_id: &CallId,
        write: &FieldWrite,
    ) -> Result<WriteOutcome, CallError> {
        let field_fails = *self.fail_field.lock().unwrap() == Some(write.field());
        if self.fail_writes.load(Ordering::SeqCst) || field_fails {
            return Err(self.fail());
        }
        self.inner.write_field(call_id, write).await
    }

    async fn watch(&self, scope: WatchScope) -> Result<ChangeStream, CallError> {
        if self.fail_watches.load(Ordering::SeqCst) {
            return Err(self.fail());
        }
        let mut upstream = self.inner.watch(scope).await?;
        let severed = self.sever.lock().unwrap().clone();
        let (tx, rx) = mpsc::channel(CHANGE_STREAM_BUFFER);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;

                    () = severed.cancelled() => break,

                    change = upstream.recv() => {
                        let Some(change) = change else { break };
                        if tx.send(change).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Ok(rx)
    }
}
