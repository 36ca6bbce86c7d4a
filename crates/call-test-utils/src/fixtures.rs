//! Test fixtures for call flows.

use call_service::actors::{
    CallController, CallEvents, CallState, ControllerSettings, EndReason, SessionUpdate,
    UpdateKind,
};
use call_service::store::{CallStore, InMemoryCallStore};
use chrono::Utc;
use common::{CallId, CallRecord, CallStatus, MediaKind, UserId};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::mock_media::MockMediaAcquirer;
use crate::mock_peer::MockPeerBackend;

/// Caller used across tests.
pub const CALLER: &str = "u1";

/// Callee used across tests.
pub const CALLEE: &str = "u2";

/// Ring timeout used by the fixtures.
pub const TEST_RING_TIMEOUT: Duration = Duration::from_secs(60);

/// Fresh registry shared by the parties of a test.
#[must_use]
pub fn shared_store() -> Arc<InMemoryCallStore> {
    Arc::new(InMemoryCallStore::new())
}

/// A ringing record from [`CALLER`] to [`CALLEE`].
#[must_use]
pub fn ringing_record(media_kind: MediaKind) -> CallRecord {
    CallRecord::ringing(
        CallId::new(),
        UserId::from(CALLER),
        UserId::from(CALLEE),
        media_kind,
        Utc::now(),
    )
}

/// A record in `status`, otherwise like [`ringing_record`].
#[must_use]
pub fn record_with_status(media_kind: MediaKind, status: CallStatus) -> CallRecord {
    let mut record = ringing_record(media_kind);
    record.status = status;
    if status.is_terminal() {
        record.ended_at = Some(Utc::now());
    }
    record
}

/// One participant: a controller for `user` over mocks.
pub struct TestParty {
    pub controller: CallController,
    pub media: Arc<MockMediaAcquirer>,
    pub peer: MockPeerBackend,
    pub events: CallEvents,
}

impl TestParty {
    /// Party with granting media and a connecting peer backend.
    pub fn new(user: &str, store: Arc<dyn CallStore>) -> Self {
        Self::with(
            user,
            store,
            MockMediaAcquirer::granting(),
            MockPeerBackend::connecting(),
        )
    }

    pub fn with(
        user: &str,
        store: Arc<dyn CallStore>,
        media: MockMediaAcquirer,
        peer: MockPeerBackend,
    ) -> Self {
        let media = Arc::new(media);
        let events = CallEvents::new();
        let controller = CallController::new(
            UserId::from(user),
            store,
            media.clone(),
            Arc::new(peer.clone()),
            events.clone(),
            ControllerSettings {
                ring_timeout: TEST_RING_TIMEOUT,
                ..ControllerSettings::default()
            },
        );
        Self {
            controller,
            media,
            peer,
            events,
        }
    }

    pub fn user(&self) -> UserId {
        self.controller.local_user().clone()
    }

    pub fn updates(&self) -> broadcast::Receiver<SessionUpdate> {
        self.events.subscribe()
    }
}

/// Wait for the `Ended` update of `call_id`, returning every update of that
/// call seen on the way (the `Ended` update included).
pub async fn updates_until_end(
    rx: &mut broadcast::Receiver<SessionUpdate>,
    call_id: CallId,
) -> Vec<UpdateKind> {
    let mut seen = Vec::new();
    loop {
        let update = rx.recv().await.expect("update feed closed before session ended");
        if update.call_id != call_id {
            continue;
        }
        let ended = matches!(update.kind, UpdateKind::Ended { .. });
        seen.push(update.kind);
        if ended {
            return seen;
        }
    }
}

/// Wait for the session of `call_id` to end.
pub async fn wait_for_end(
    rx: &mut broadcast::Receiver<SessionUpdate>,
    call_id: CallId,
) -> (CallState, EndReason) {
    match updates_until_end(rx, call_id).await.pop() {
        Some(UpdateKind::Ended { state, reason }) => (state, reason),
        other => panic!("expected Ended update, got {other:?}"),
    }
}

/// Wait for the session of `call_id` to reach `state`.
pub async fn wait_for_state(
    rx: &mut broadcast::Receiver<SessionUpdate>,
    call_id: CallId,
    state: CallState,
) {
    loop {
        let update = rx.recv().await.expect("update feed closed");
        if update.call_id != call_id {
            continue;
        }
        match update.kind {
            UpdateKind::StateChanged { to, .. } if to == state => return,
            UpdateKind::Ended { state: ended, reason } => {
                panic!("session ended in {ended} ({reason}) before reaching {state}")
            }
            _ => {}
        }
    }
}

/// States visited, in order, according to a list of updates.
#[must_use]
pub fn visited_states(updates: &[UpdateKind]) -> Vec<CallState> {
    updates
        .iter()
        .filter_map(|kind| match kind {
            UpdateKind::StateChanged { to, .. } => Some(*to),
            _ => None,
        })
        .collect()
}

/// Record statuses observed, in order, according to a list of updates.
#[must_use]
pub fn observed_statuses(updates: &[UpdateKind]) -> Vec<CallStatus> {
    updates
        .iter()
        .filter_map(|kind| match kind {
            UpdateKind::RecordStatus(record) => Some(record.status),
            _ => None,
        })
        .collect()
}

/// Number of remote stream arrivals in a list of updates.
#[must_use]
pub fn remote_stream_count(updates: &[UpdateKind]) -> usize {
    updates
        .iter()
        .filter(|kind| matches!(kind, UpdateKind::RemoteStream(_)))
        .count()
}
