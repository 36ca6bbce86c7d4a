//! Call registry storage.
//!
//! The registry holds one [`CallRecord`] per call id and doubles as the
//! signaling transport: participants write negotiation payloads and status
//! into the record and observe each other's writes through change feeds.
//!
//! # Field ownership
//!
//! | Field | Writer | Write rule |
//! |-------|--------|------------|
//! | `offerPayload` | initiator | once; later writes are ignored |
//! | `answerPayload` | responder | once; later writes are ignored |
//! | `status` | either side | last write wins |
//!
//! # Implementations
//!
//! - [`InMemoryCallStore`] - process-local, broadcast change feed
//! - [`RedisCallStore`] - Redis hash per call, pub/sub change notifications

pub mod lua_scripts;
pub mod memory;
pub mod redis;

pub use self::memory::InMemoryCallStore;
pub use self::redis::RedisCallStore;

use crate::errors::CallError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{CallId, CallRecord, CallStatus, RecordField, SignalPayload};
use tokio::sync::mpsc;

/// Buffer for per-subscriber change streams.
pub const CHANGE_STREAM_BUFFER: usize = 64;

/// A single field write against a call record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldWrite {
    Offer(SignalPayload),
    Answer(SignalPayload),
    Status {
        status: CallStatus,
        ended_at: Option<DateTime<Utc>>,
    },
}

impl FieldWrite {
    /// Status write without an end timestamp.
    #[must_use]
    pub fn status(status: CallStatus) -> Self {
        FieldWrite::Status {
            status,
            ended_at: None,
        }
    }

    /// `status=ended` together with `endedAt`.
    #[must_use]
    pub fn ended(at: DateTime<Utc>) -> Self {
        FieldWrite::Status {
            status: CallStatus::Ended,
            ended_at: Some(at),
        }
    }

    #[must_use]
    pub fn field(&self) -> RecordField {
        match self {
            FieldWrite::Offer(_) => RecordField::Offer,
            FieldWrite::Answer(_) => RecordField::Answer,
            FieldWrite::Status { .. } => RecordField::Status,
        }
    }

    /// Apply the write to an in-memory record.
    ///
    /// Returns [`WriteOutcome::Ignored`] when a write-once field is already set.
    pub fn apply_to(&self, record: &mut CallRecord) -> WriteOutcome {
        match self {
            FieldWrite::Offer(payload) => write_once(&mut record.offer_payload, payload),
            FieldWrite::Answer(payload) => write_once(&mut record.answer_payload, payload),
            FieldWrite::Status { status, ended_at } => {
                record.status = *status;
                if ended_at.is_some() {
                    record.ended_at = *ended_at;
                }
                WriteOutcome::Written
            }
        }
    }
}

fn write_once(slot: &mut Option<SignalPayload>, payload: &SignalPayload) -> WriteOutcome {
    if slot.is_some() {
        return WriteOutcome::Ignored;
    }
    *slot = Some(payload.clone());
    WriteOutcome::Written
}

/// Result of a field write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    /// Write-once field already held a value; the store kept the original.
    Ignored,
}

/// What changed in a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Field(RecordField),
}

impl ChangeKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Created => "created",
            ChangeKind::Field(field) => field.wire_name(),
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(ChangeKind::Created),
            "offerPayload" => Some(ChangeKind::Field(RecordField::Offer)),
            "answerPayload" => Some(ChangeKind::Field(RecordField::Answer)),
            "status" => Some(ChangeKind::Field(RecordField::Status)),
            _ => None,
        }
    }
}

/// A change notification carrying the record as it was after the write.
#[derive(Debug, Clone)]
pub struct RecordChange {
    pub call_id: CallId,
    pub change: ChangeKind,
    pub record: CallRecord,
}

/// Which records a watcher is interested in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchScope {
    /// Every record in the registry.
    Registry,
    /// One call's record.
    Call(CallId),
}

impl WatchScope {
    #[must_use]
    pub fn matches(&self, call_id: &CallId) -> bool {
        match self {
            WatchScope::Registry => true,
            WatchScope::Call(id) => id == call_id,
        }
    }
}

/// Stream of changes for one watcher. Dropping the receiver ends the watch.
pub type ChangeStream = mpsc::Receiver<RecordChange>;

/// Storage backend for call records.
///
/// Implementations must deliver every change that happens after `watch`
/// returns. No ordering is promised across different fields.
#[async_trait]
pub trait CallStore: Send + Sync {
    /// Create a record. Fails with `Conflict` if the call id is taken.
    async fn create_record(&self, record: &CallRecord) -> Result<(), CallError>;

    /// Read a record.
    async fn get_record(&self, call_id: &CallId) -> Result<Option<CallRecord>, CallError>;

    /// Read every record in the registry.
    async fn list_records(&self) -> Result<Vec<CallRecord>, CallError>;

    /// Write a single field. Fails with `CallNotFound` if no record exists.
    async fn write_field(
        &self,
        call_id: &CallId,
        write: &FieldWrite,
    ) -> Result<WriteOutcome, CallError>;

    /// Start watching for record changes.
    async fn watch(&self, scope: WatchScope) -> Result<ChangeStream, CallError>;
}
