//! Redis-backed call store.
//!
//! # Key Patterns
//!
//! - `call:{id}` - Call record (HASH, camelCase wire field names)
//! - `calls` - Registry index of call ids (SET)
//! - `call:{id}:changes` - Per-call change notifications (pub/sub channel)
//! - `calls:changes` - Registry-wide change notifications (pub/sub channel)
//!
//! Notifications carry only `{call_id, change}`; subscribers re-read the hash
//! so they always see the record as it is now, not as it was when published.
//!
//! # Connection Pattern
//!
//! The redis-rs `MultiplexedConnection` is cheap to clone and safe to use
//! concurrently, so every operation clones it instead of locking. Each watch
//! opens its own pub/sub connection, which closes when the watch is dropped.

use super::{
    lua_scripts, CallStore, ChangeKind, ChangeStream, FieldWrite, RecordChange, WatchScope,
    WriteOutcome, CHANGE_STREAM_BUFFER,
};
use crate::errors::CallError;
use async_trait::async_trait;
use common::types::format_timestamp;
use common::{CallId, CallRecord};
use ::redis::aio::MultiplexedConnection;
use ::redis::{AsyncCommands, Client, Script};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tracing::{debug, error, instrument, warn};

/// Registry index set.
const REGISTRY_INDEX_KEY: &str = "calls";

/// Registry-wide change channel.
const REGISTRY_CHANNEL: &str = "calls:changes";

/// Change notification published by the write scripts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeNotice {
    pub call_id: String,
    pub change: String,
}

impl ChangeNotice {
    fn new(call_id: &CallId, change: ChangeKind) -> Self {
        Self {
            call_id: call_id.to_string(),
            change: change.as_str().to_string(),
        }
    }

    fn encode(&self) -> Result<String, CallError> {
        serde_json::to_string(self)
            .map_err(|e| CallError::Internal(format!("notice serialization failed: {e}")))
    }
}

/// Hash key holding a call record.
#[must_use]
pub fn record_key(call_id: &CallId) -> String {
    format!("call:{call_id}")
}

/// Channel carrying one call's change notifications.
#[must_use]
pub fn call_channel(call_id: &CallId) -> String {
    format!("call:{call_id}:changes")
}

/// Redis call store.
///
/// Cheaply cloneable. Clone it into each task rather than sharing it behind
/// a lock.
#[derive(Clone)]
pub struct RedisCallStore {
    /// Client used to open dedicated pub/sub connections.
    client: Client,
    /// Multiplexed connection for commands and scripts.
    connection: MultiplexedConnection,
    create_script: Script,
    write_once_script: Script,
    write_status_script: Script,
}

impl RedisCallStore {
    /// Connect to Redis.
    ///
    /// # Errors
    ///
    /// Returns `CallError::Transport` if the connection cannot be established.
    pub async fn connect(redis_url: &str) -> Result<Self, CallError> {
        let client = Client::open(redis_url).map_err(|e| {
            // Do NOT log redis_url: it may carry credentials
            error!(
                target: "call.store.redis",
                error = %e,
                "Failed to open Redis client"
            );
            CallError::Transport(format!("Failed to open Redis client: {e}"))
        })?;

        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| {
                error!(
                    target: "call.store.redis",
                    error = %e,
                    "Failed to connect to Redis"
                );
                CallError::Transport(format!("Failed to connect to Redis: {e}"))
            })?;

        Ok(Self {
            client,
            connection,
            create_script: Script::new(lua_scripts::CREATE_CALL),
            write_once_script: Script::new(lua_scripts::WRITE_ONCE),
            write_status_script: Script::new(lua_scripts::WRITE_STATUS),
        })
    }

    async fn read_record(&self, call_id: &CallId) -> Result<Option<CallRecord>, CallError> {
        let mut conn = self.connection.clone();
        let fields: HashMap<String, String> =
            conn.hgetall(record_key(call_id)).await.map_err(|e| {
                warn!(
                    target: "call.store.redis",
                    error = %e,
                    call_id = %call_id,
                    "Failed to read call record"
                );
                CallError::Transport(format!("Failed to read call record: {e}"))
            })?;

        if fields.is_empty() {
            return Ok(None);
        }
        Ok(Some(CallRecord::from_fields(&fields)?))
    }
}

/// Interpret a script return code.
fn script_outcome(code: i64, call_id: &CallId) -> Result<WriteOutcome, CallError> {
    match code {
        1 => Ok(WriteOutcome::Written),
        0 => Ok(WriteOutcome::Ignored),
        -1 => Err(CallError::CallNotFound(call_id.to_string())),
        other => Err(CallError::Internal(format!(
            "unexpected script result: {other}"
        ))),
    }
}

#[async_trait]
impl CallStore for RedisCallStore {
    #[instrument(skip_all, fields(call_id = %record.call_id))]
    async fn create_record(&self, record: &CallRecord) -> Result<(), CallError> {
        let mut conn = self.connection.clone();
        let notice = ChangeNotice::new(&record.call_id, ChangeKind::Created).encode()?;

        let mut invocation = self.create_script.prepare_invoke();
        invocation
            .key(record_key(&record.call_id))
            .key(REGISTRY_INDEX_KEY)
            .key(call_channel(&record.call_id))
            .key(REGISTRY_CHANNEL)
            .arg(record.call_id.to_string())
            .arg(notice);
        for (name, value) in record.to_fields() {
            invocation.arg(name).arg(value);
        }

        let code: i64 = invocation.invoke_async(&mut conn).await.map_err(|e| {
            warn!(
                target: "call.store.redis",
                error = %e,
                "Failed to create call record"
            );
            CallError::Transport(format!("Failed to create call record: {e}"))
        })?;

        match script_outcome(code, &record.call_id)? {
            WriteOutcome::Written => {
                debug!(target: "call.store.redis", "Call record created");
                Ok(())
            }
            WriteOutcome::Ignored => Err(CallError::Conflict(
                "Call record already exists".to_string(),
            )),
        }
    }

    async fn get_record(&self, call_id: &CallId) -> Result<Option<CallRecord>, CallError> {
        self.read_record(call_id).await
    }

    async fn list_records(&self) -> Result<Vec<CallRecord>, CallError> {
        let mut conn = self.connection.clone();
        let ids: Vec<String> = conn.smembers(REGISTRY_INDEX_KEY).await.map_err(|e| {
            warn!(
                target: "call.store.redis",
                error = %e,
                "Failed to list call registry"
            );
            CallError::Transport(format!("Failed to list call registry: {e}"))
        })?;

        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            let Ok(call_id) = id.parse::<CallId>() else {
                warn!(target: "call.store.redis", "Skipping malformed call id in registry index");
                continue;
            };
            match self.read_record(&call_id).await {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(CallError::Record(e)) => {
                    warn!(
                        target: "call.store.redis",
                        call_id = %call_id,
                        error = %e,
                        "Skipping malformed call record"
                    );
                }
                Err(e) => return Err(e),
            }
        }
        Ok(records)
    }

    #[instrument(skip_all, fields(call_id = %call_id, field = %write.field()))]
    async fn write_field(
        &self,
        call_id: &CallId,
        write: &FieldWrite,
    ) -> Result<WriteOutcome, CallError> {
        let mut conn = self.connection.clone();
        let notice = ChangeNotice::new(call_id, ChangeKind::Field(write.field())).encode()?;

        let mut invocation = match write {
            FieldWrite::Offer(payload) | FieldWrite::Answer(payload) => {
                let mut invocation = self.write_once_script.prepare_invoke();
                invocation
                    .arg(write.field().wire_name())
                    .arg(payload.as_str());
                invocation
            }
            FieldWrite::Status { status, ended_at } => {
                let mut invocation = self.write_status_script.prepare_invoke();
                invocation
                    .arg(status.as_str())
                    .arg(ended_at.as_ref().map(format_timestamp).unwrap_or_default());
                invocation
            }
        };
        invocation
            .key(record_key(call_id))
            .key(call_channel(call_id))
            .key(REGISTRY_CHANNEL)
            .arg(notice);

        let code: i64 = invocation.invoke_async(&mut conn).await.map_err(|e| {
            warn!(
                target: "call.store.redis",
                error = %e,
                "Failed to write call record field"
            );
            CallError::Transport(format!("Failed to write call record field: {e}"))
        })?;

        script_outcome(code, call_id)
    }

    async fn watch(&self, scope: WatchScope) -> Result<ChangeStream, CallError> {
        let channel = match scope {
            WatchScope::Registry => REGISTRY_CHANNEL.to_string(),
            WatchScope::Call(call_id) => call_channel(&call_id),
        };

        let mut pubsub = self.client.get_async_pubsub().await.map_err(|e| {
            warn!(
                target: "call.store.redis",
                error = %e,
                "Failed to open pub/sub connection"
            );
            CallError::Transport(format!("Failed to open pub/sub connection: {e}"))
        })?;
        pubsub.subscribe(&channel).await.map_err(|e| {
            CallError::Transport(format!("Failed to subscribe to changes: {e}"))
        })?;

        let (tx, rx) = mpsc::channel(CHANGE_STREAM_BUFFER);
        let store = self.clone();

        tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            loop {
                tokio::select! {
                    () = tx.closed() => break,

                    message = messages.next() => {
                        let Some(message) = message else {
                            warn!(target: "call.store.redis", "Pub/sub stream ended");
                            break;
                        };
                        let Some(change) = store.resolve_notice(&message).await else {
                            continue;
                        };
                        if tx.send(change).await.is_err() {
                            break;
                        }
                    }
                }
            }
            debug!(target: "call.store.redis", channel = %channel, "Change watch closed");
        });

        Ok(rx)
    }
}

impl RedisCallStore {
    /// Turn a pub/sub message into a change by re-reading the record.
    async fn resolve_notice(&self, message: &::redis::Msg) -> Option<RecordChange> {
        let payload: String = message.get_payload().ok()?;
        let notice: ChangeNotice = match serde_json::from_str(&payload) {
            Ok(notice) => notice,
            Err(e) => {
                warn!(target: "call.store.redis", error = %e, "Ignoring malformed change notice");
                return None;
            }
        };
        let call_id = notice.call_id.parse::<CallId>().ok()?;
        let change = ChangeKind::parse(&notice.change)?;

        match self.read_record(&call_id).await {
            Ok(Some(record)) => Some(RecordChange {
                call_id,
                change,
                record,
            }),
            Ok(None) => None,
            Err(e) => {
                warn!(
                    target: "call.store.redis",
                    call_id = %call_id,
                    error = %e,
                    "Failed to resolve change notice"
                );
                None
            }
        }
    }
}
