//! End-to-end call flows between two parties sharing one registry.
//!
//! Every test runs on a paused clock: sleeping lets all pending work settle
//! and ring timeouts elapse instantly.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]

use call_service::actors::{CallSessionHandle, CallState, EndReason};
use call_service::errors::{CallError, MediaError};
use call_service::store::CallStore;
use call_test_utils::*;
use common::{CallId, CallStatus, MediaKind, RecordField};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Let every task run until nothing is left to do.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

async fn connected_call(
    caller: &TestParty,
    callee: &TestParty,
    media_kind: MediaKind,
) -> (CallSessionHandle, CallSessionHandle) {
    let outgoing = caller
        .controller
        .initiate(callee.user(), media_kind)
        .await
        .unwrap();
    let incoming = callee.controller.answer(outgoing.call_id()).await.unwrap();
    settle().await;

    assert_eq!(outgoing.snapshot().await.unwrap().state, CallState::Connected);
    assert_eq!(incoming.snapshot().await.unwrap().state, CallState::Connected);
    (outgoing, incoming)
}

#[tokio::test(start_paused = true)]
async fn test_answered_call_connects_both_sides() {
    let store = shared_store();
    let caller = TestParty::new(CALLER, store.clone());
    let callee = TestParty::new(CALLEE, store.clone());
    let mut caller_updates = caller.updates();
    let mut callee_updates = callee.updates();

    let (outgoing, incoming) = connected_call(&caller, &callee, MediaKind::Video).await;
    let call_id = outgoing.call_id();

    let record = store.get_record(&call_id).await.unwrap().unwrap();
    assert_eq!(record.status, CallStatus::Connected);
    assert_eq!(record.offer_payload, Some(mock_offer(&call_id)));
    assert_eq!(record.answer_payload, Some(mock_answer(&call_id)));

    let snapshot = incoming.snapshot().await.unwrap();
    assert!(snapshot.remote_media.is_some());
    assert_eq!(snapshot.local_tracks.len(), 2);
    assert!(snapshot.local_tracks.iter().all(|t| t.enabled && !t.stopped));

    outgoing.hang_up().await.unwrap();

    let caller_seen = updates_until_end(&mut caller_updates, call_id).await;
    assert_eq!(
        visited_states(&caller_seen),
        vec![CallState::Ringing, CallState::Connected, CallState::Ended]
    );
    assert_eq!(remote_stream_count(&caller_seen), 1);
    let mut statuses = observed_statuses(&caller_seen);
    statuses.dedup();
    assert_eq!(
        statuses.get(..3).unwrap(),
        &[CallStatus::Ringing, CallStatus::Accepted, CallStatus::Connected]
    );

    let callee_seen = updates_until_end(&mut callee_updates, call_id).await;
    assert_eq!(
        visited_states(&callee_seen),
        vec![CallState::Connected, CallState::Ended]
    );
    assert_eq!(remote_stream_count(&callee_seen), 1);

    let record = store.get_record(&call_id).await.unwrap().unwrap();
    assert_eq!(record.status, CallStatus::Ended);
    assert!(record.ended_at.is_some());
    assert!(caller.media.all_stopped());
    assert!(callee.media.all_stopped());
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_call_times_out_after_ring_timeout() {
    let store = shared_store();
    let caller = TestParty::new(CALLER, store.clone());
    let mut updates = caller.updates();
    let started = Instant::now();

    let outgoing = caller
        .controller
        .initiate(CALLEE.into(), MediaKind::Video)
        .await
        .unwrap();
    let call_id = outgoing.call_id();

    let seen = updates_until_end(&mut updates, call_id).await;
    assert!(started.elapsed() >= TEST_RING_TIMEOUT);
    assert_eq!(
        visited_states(&seen),
        vec![CallState::Ringing, CallState::TimedOut, CallState::Ended]
    );
    assert!(matches!(
        seen.last(),
        Some(call_service::actors::UpdateKind::Ended {
            reason: EndReason::TimedOut,
            ..
        })
    ));

    let record = store.get_record(&call_id).await.unwrap().unwrap();
    assert_eq!(record.status, CallStatus::Ended);
    assert!(record.ended_at.is_some());
    assert!(caller.media.all_stopped());
    assert_eq!(caller.peer.close_count(), 1);

    outgoing.closed().await;
    assert!(caller.controller.session(&call_id).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_immediate_decline_ends_caller_without_connecting() {
    let store = shared_store();
    let caller = TestParty::new(CALLER, store.clone());
    let callee = TestParty::new(CALLEE, store.clone());
    let mut updates = caller.updates();

    let outgoing = caller
        .controller
        .initiate(callee.user(), MediaKind::Audio)
        .await
        .unwrap();
    let call_id = outgoing.call_id();
    callee.controller.decline(call_id).await.unwrap();

    let seen = updates_until_end(&mut updates, call_id).await;
    assert_eq!(
        visited_states(&seen),
        vec![CallState::Ringing, CallState::Ended]
    );
    assert_eq!(remote_stream_count(&seen), 0);
    assert!(matches!(
        seen.last(),
        Some(call_service::actors::UpdateKind::Ended {
            reason: EndReason::RemoteDeclined,
            ..
        })
    ));

    let record = store.get_record(&call_id).await.unwrap().unwrap();
    assert_eq!(record.status, CallStatus::Declined);
    assert!(caller.media.all_stopped());
    assert!(callee.controller.active_sessions().is_empty());
    assert_eq!(callee.media.call_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_connected_call_survives_ring_timeout() {
    let store = shared_store();
    let caller = TestParty::new(CALLER, store.clone());
    let callee = TestParty::new(CALLEE, store.clone());

    let (outgoing, _incoming) = connected_call(&caller, &callee, MediaKind::Video).await;

    tokio::time::sleep(TEST_RING_TIMEOUT * 2).await;

    assert_eq!(outgoing.snapshot().await.unwrap().state, CallState::Connected);
    let record = store.get_record(&outgoing.call_id()).await.unwrap().unwrap();
    assert_eq!(record.status, CallStatus::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_simultaneous_hang_up_cleans_up_once() {
    let store = shared_store();
    let caller = TestParty::new(CALLER, store.clone());
    let callee = TestParty::new(CALLEE, store.clone());

    let (outgoing, incoming) = connected_call(&caller, &callee, MediaKind::Video).await;

    let (a, b) = tokio::join!(outgoing.hang_up(), incoming.hang_up());
    // Whichever side loses the race may already be closed
    assert!(a.is_ok() || matches!(a, Err(CallError::SessionClosed)));
    assert!(b.is_ok() || matches!(b, Err(CallError::SessionClosed)));
    outgoing.closed().await;
    incoming.closed().await;

    for party in [&caller, &callee] {
        let tracks = party.media.issued_tracks();
        assert!(!tracks.is_empty());
        assert!(tracks.iter().all(|t| t.stop_count() == 1));
        assert_eq!(party.peer.close_count(), 1);
    }

    let record = store.get_record(&outgoing.call_id()).await.unwrap().unwrap();
    assert_eq!(record.status, CallStatus::Ended);
}

#[tokio::test(start_paused = true)]
async fn test_operations_after_hang_up_are_noops() {
    let store = shared_store();
    let caller = TestParty::new(CALLER, store.clone());
    let callee = TestParty::new(CALLEE, store.clone());

    let (outgoing, _incoming) = connected_call(&caller, &callee, MediaKind::Video).await;

    assert!(!outgoing.toggle_audio().await);
    assert!(outgoing.toggle_audio().await);

    outgoing.hang_up().await.unwrap();
    outgoing.closed().await;

    assert!(!outgoing.toggle_audio().await);
    assert!(!outgoing.toggle_video().await);
    assert!(matches!(outgoing.hang_up().await, Err(CallError::SessionClosed)));
    assert!(matches!(outgoing.snapshot().await, Err(CallError::SessionClosed)));
}

#[tokio::test(start_paused = true)]
async fn test_audio_call_has_no_video_track() {
    let store = shared_store();
    let caller = TestParty::new(CALLER, store.clone());
    let callee = TestParty::new(CALLEE, store.clone());

    let (outgoing, _incoming) = connected_call(&caller, &callee, MediaKind::Audio).await;

    assert!(!outgoing.toggle_video().await);
    let snapshot = outgoing.snapshot().await.unwrap();
    assert_eq!(snapshot.local_tracks.len(), 1);
    assert_eq!(snapshot.local_tracks[0].kind, MediaKind::Audio);
}

#[tokio::test(start_paused = true)]
async fn test_media_denial_creates_no_record_and_is_retryable() {
    let store = shared_store();
    let caller = TestParty::with(
        CALLER,
        store.clone(),
        MockMediaAcquirer::denying(),
        MockPeerBackend::connecting(),
    );

    let result = caller
        .controller
        .initiate(CALLEE.into(), MediaKind::Video)
        .await;
    assert!(matches!(
        result,
        Err(CallError::MediaAccess(MediaError::PermissionDenied))
    ));
    assert!(store.is_empty().await);
    assert!(caller.peer.opened().is_empty());

    caller.media.set_mode(MediaMode::Grant);
    let outgoing = caller
        .controller
        .initiate(CALLEE.into(), MediaKind::Video)
        .await
        .unwrap();
    assert_eq!(store.len().await, 1);
    assert!(caller.controller.session(&outgoing.call_id()).is_some());
}

#[tokio::test(start_paused = true)]
async fn test_missing_device_fails_answer_without_touching_record() {
    let store = shared_store();
    let caller = TestParty::new(CALLER, store.clone());
    let callee = TestParty::with(
        CALLEE,
        store.clone(),
        MockMediaAcquirer::unavailable(),
        MockPeerBackend::connecting(),
    );

    let outgoing = caller
        .controller
        .initiate(callee.user(), MediaKind::Video)
        .await
        .unwrap();

    let result = callee.controller.answer(outgoing.call_id()).await;
    assert!(matches!(
        result,
        Err(CallError::MediaAccess(MediaError::DeviceUnavailable(
            MediaKind::Video
        )))
    ));

    let record = store.get_record(&outgoing.call_id()).await.unwrap().unwrap();
    assert_eq!(record.status, CallStatus::Ringing);
}

#[tokio::test(start_paused = true)]
async fn test_record_write_failure_on_initiate_releases_media() {
    let store = Arc::new(FailingCallStore::new());
    store.set_fail_creates(true);
    let caller = TestParty::new(CALLER, store.clone());

    let result = caller
        .controller
        .initiate(CALLEE.into(), MediaKind::Video)
        .await;

    assert!(matches!(result, Err(CallError::Transport(_))));
    assert!(caller.media.all_stopped());
    assert_eq!(caller.peer.close_count(), 1);
    assert!(store.inner().is_empty().await);
    assert!(caller.controller.active_sessions().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_offer_write_failure_ends_session() {
    let store = Arc::new(FailingCallStore::new());
    store.fail_writes_to(RecordField::Offer);
    let caller = TestParty::new(CALLER, store.clone());
    let mut updates = caller.updates();

    let outgoing = caller
        .controller
        .initiate(CALLEE.into(), MediaKind::Video)
        .await
        .unwrap();

    assert_eq!(
        wait_for_end(&mut updates, outgoing.call_id()).await,
        (CallState::Ended, EndReason::TransportFailed)
    );
    assert!(caller.media.all_stopped());

    // The final status write is unaffected and still lands
    let record = store
        .inner()
        .get_record(&outgoing.call_id())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, CallStatus::Ended);
}

#[tokio::test(start_paused = true)]
async fn test_lost_change_feed_ends_connected_session() {
    // Both parties share one registry; only the callee's feeds go through
    // the failing wrapper
    let callee_store = Arc::new(FailingCallStore::new());
    let caller_store = Arc::new(callee_store.inner().clone());
    let caller = TestParty::new(CALLER, caller_store.clone());
    let callee = TestParty::new(CALLEE, callee_store.clone());
    let mut caller_updates = caller.updates();
    let mut callee_updates = callee.updates();

    let (outgoing, incoming) = connected_call(&caller, &callee, MediaKind::Video).await;
    let call_id = outgoing.call_id();

    callee_store.sever_watches();

    assert_eq!(
        wait_for_end(&mut callee_updates, call_id).await,
        (CallState::Ended, EndReason::TransportFailed)
    );
    assert!(callee.media.all_stopped());
    settle().await;
    assert!(matches!(
        incoming.hang_up().await,
        Err(CallError::SessionClosed)
    ));

    // Writes still reach the registry, so the caller learns the call is over
    assert_eq!(
        wait_for_end(&mut caller_updates, call_id).await,
        (CallState::Ended, EndReason::RemoteEnded)
    );
    assert!(caller.media.all_stopped());
    let record = caller_store.get_record(&call_id).await.unwrap().unwrap();
    assert_eq!(record.status, CallStatus::Ended);
}

#[tokio::test(start_paused = true)]
async fn test_negotiation_failure_ends_both_sides() {
    let store = shared_store();
    let caller = TestParty::new(CALLER, store.clone());
    let callee = TestParty::with(
        CALLEE,
        store.clone(),
        MockMediaAcquirer::granting(),
        MockPeerBackend::failing(),
    );
    let mut caller_updates = caller.updates();
    let mut callee_updates = callee.updates();

    let outgoing = caller
        .controller
        .initiate(callee.user(), MediaKind::Video)
        .await
        .unwrap();
    let call_id = outgoing.call_id();
    callee.controller.answer(call_id).await.unwrap();

    assert_eq!(
        wait_for_end(&mut callee_updates, call_id).await,
        (CallState::Ended, EndReason::NegotiationFailed)
    );
    assert_eq!(
        wait_for_end(&mut caller_updates, call_id).await,
        (CallState::Ended, EndReason::RemoteEnded)
    );
    assert!(caller.media.all_stopped());
    assert!(callee.media.all_stopped());
}

#[tokio::test(start_paused = true)]
async fn test_answer_rejects_invalid_calls() {
    let store = shared_store();
    let callee = TestParty::new(CALLEE, store.clone());

    let missing = callee.controller.answer(CallId::new()).await;
    assert!(matches!(missing, Err(CallError::CallNotFound(_))));

    let mut foreign = ringing_record(MediaKind::Audio);
    foreign.receiver_id = "u3".into();
    store.create_record(&foreign).await.unwrap();
    let result = callee.controller.answer(foreign.call_id).await;
    assert!(matches!(result, Err(CallError::NotParticipant(_))));

    let ended = record_with_status(MediaKind::Audio, CallStatus::Ended);
    store.create_record(&ended).await.unwrap();
    let result = callee.controller.answer(ended.call_id).await;
    assert!(matches!(
        result,
        Err(CallError::CallNotRinging(CallStatus::Ended))
    ));

    // None of the rejections got as far as the capture devices
    assert_eq!(callee.media.call_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_second_answer_conflicts() {
    let store = shared_store();
    let caller = TestParty::new(CALLER, store.clone());
    let callee = TestParty::new(CALLEE, store.clone());

    let (outgoing, _incoming) = connected_call(&caller, &callee, MediaKind::Audio).await;

    let again = callee.controller.answer(outgoing.call_id()).await;
    assert!(matches!(again, Err(CallError::Conflict(_))));
    assert_eq!(callee.controller.active_sessions().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_decline_rules() {
    let store = shared_store();
    let callee = TestParty::new(CALLEE, store.clone());

    let ended = record_with_status(MediaKind::Video, CallStatus::Ended);
    store.create_record(&ended).await.unwrap();
    callee.controller.decline(ended.call_id).await.unwrap();
    let record = store.get_record(&ended.call_id).await.unwrap().unwrap();
    assert_eq!(record.status, CallStatus::Ended);

    let accepted = record_with_status(MediaKind::Video, CallStatus::Accepted);
    store.create_record(&accepted).await.unwrap();
    let result = callee.controller.decline(accepted.call_id).await;
    assert!(matches!(
        result,
        Err(CallError::CallNotRinging(CallStatus::Accepted))
    ));

    let caller = TestParty::new(CALLER, store.clone());
    let ringing = ringing_record(MediaKind::Video);
    store.create_record(&ringing).await.unwrap();
    let result = caller.controller.decline(ringing.call_id).await;
    assert!(matches!(result, Err(CallError::NotParticipant(_))));
}

#[tokio::test(start_paused = true)]
async fn test_watcher_reports_ringing_calls_with_duplicates() {
    let store = shared_store();
    let caller = TestParty::new(CALLER, store.clone());
    let callee = TestParty::new(CALLEE, store.clone());

    let (tx, mut rx) = mpsc::unbounded_channel();
    let watcher = callee
        .controller
        .watch_incoming(move |record| {
            let _ = tx.send(record);
        })
        .await
        .unwrap();

    let outgoing = caller
        .controller
        .initiate(callee.user(), MediaKind::Video)
        .await
        .unwrap();
    settle().await;

    // Once on creation, again when the offer lands
    let mut notified = Vec::new();
    while let Ok(record) = rx.try_recv() {
        notified.push(record);
    }
    assert_eq!(notified.len(), 2);
    assert!(notified.iter().all(|r| r.call_id == outgoing.call_id()));
    assert!(notified.iter().all(|r| r.status == CallStatus::Ringing));

    callee.controller.answer(outgoing.call_id()).await.unwrap();
    settle().await;
    assert!(rx.try_recv().is_err());

    watcher.stop();
    assert!(!watcher.is_running());
}

#[tokio::test(start_paused = true)]
async fn test_watcher_stops_when_registry_feed_closes() {
    let store = Arc::new(FailingCallStore::new());
    let callee = TestParty::new(CALLEE, store.clone());

    let (tx, mut rx) = mpsc::unbounded_channel();
    let watcher = callee
        .controller
        .watch_incoming(move |record| {
            let _ = tx.send(record);
        })
        .await
        .unwrap();
    let stopped = watcher.stopped();
    assert!(watcher.is_running());

    store.sever_watches();
    tokio::time::timeout(Duration::from_secs(1), stopped)
        .await
        .expect("watcher should stop once its feed closes");
    assert!(!watcher.is_running());

    // Nothing is reported after the feed is gone
    store
        .inner()
        .create_record(&ringing_record(MediaKind::Audio))
        .await
        .unwrap();
    settle().await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_ends_sessions_and_notifies_remote() {
    let store = shared_store();
    let caller = TestParty::new(CALLER, store.clone());
    let callee = TestParty::new(CALLEE, store.clone());
    let mut callee_updates = callee.updates();

    let (outgoing, _incoming) = connected_call(&caller, &callee, MediaKind::Video).await;

    caller.controller.shutdown(Duration::from_secs(5)).await;

    assert!(outgoing.is_closed());
    assert!(caller.controller.active_sessions().is_empty());
    assert!(caller.media.all_stopped());
    assert_eq!(
        wait_for_end(&mut callee_updates, outgoing.call_id()).await,
        (CallState::Ended, EndReason::RemoteEnded)
    );

    let result = caller
        .controller
        .initiate(callee.user(), MediaKind::Video)
        .await;
    assert!(matches!(result, Err(CallError::Internal(_))));
}

#[tokio::test(start_paused = true)]
async fn test_ice_servers_reach_the_negotiation_library() {
    let store = shared_store();
    let caller = TestParty::new(CALLER, store.clone());

    caller
        .controller
        .initiate(CALLEE.into(), MediaKind::Audio)
        .await
        .unwrap();

    let opened = caller.peer.opened();
    assert_eq!(opened.len(), 1);
    assert_eq!(opened[0].ice_servers.len(), 5);
    assert!(opened[0].ice_servers[0].starts_with("stun:"));
}
