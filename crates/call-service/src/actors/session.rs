//! `CallSessionActor` - per-call actor that owns one participant's session.
//!
//! Each `CallSessionActor`:
//! - Owns the local media handle and the peer connection adapter
//! - Holds the signaling subscriptions for the other side's fields
//! - Drives the [`CallStateMachine`] and runs its effects
//! - Arms and cancels the ring timer
//!
//! # Cleanup
//!
//! Every terminal path runs cleanup exactly once: subscriptions are
//! cancelled, the adapter is destroyed and local tracks are stopped. The
//! actor then publishes `Ended` and exits; the handle reports the session as
//! closed from then on.

use super::messages::{
    CallEvents, EndReason, SessionMessage, SessionSnapshot, SignalInput, TrackStatus, UpdateKind,
};
use super::state::{CallState, CallStateMachine, Effect, SessionEvent};
use crate::errors::CallError;
use crate::media::LocalMedia;
use crate::observability::metrics;
use crate::peer::{PeerConnectionAdapter, PeerEvent, Role};
use crate::signaling::{FieldUpdate, SignalingChannel, Subscription};
use crate::store::FieldWrite;
use chrono::{DateTime, Utc};
use common::{CallId, MediaKind, RecordField, SignalPayload};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Channel buffer size for the session mailbox.
const SESSION_CHANNEL_BUFFER: usize = 32;

/// Everything a session needs besides the resources it takes ownership of.
#[derive(Clone)]
pub struct SessionParams {
    pub call_id: CallId,
    pub role: Role,
    pub media_kind: MediaKind,
    pub ring_timeout: Duration,
    pub signaling: SignalingChannel,
    pub events: CallEvents,
    pub cancel_token: CancellationToken,
}

/// Handle to a `CallSessionActor`.
#[derive(Debug, Clone)]
pub struct CallSessionHandle {
    sender: mpsc::Sender<SessionMessage>,
    cancel_token: CancellationToken,
    call_id: CallId,
    role: Role,
}

impl CallSessionHandle {
    #[must_use]
    pub fn call_id(&self) -> CallId {
        self.call_id
    }

    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Hang up. Ends the session from any non-terminal state.
    ///
    /// # Errors
    ///
    /// Returns `CallError::SessionClosed` if the session has already ended.
    pub async fn hang_up(&self) -> Result<(), CallError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SessionMessage::HangUp { respond_to: tx })
            .await
            .map_err(|_| CallError::SessionClosed)?;

        rx.await.map_err(|_| CallError::SessionClosed)?
    }

    /// Flip the local audio track. Returns the resulting enabled state;
    /// `false` if there is no audio track or the session has ended.
    pub async fn toggle_audio(&self) -> bool {
        self.toggle(MediaKind::Audio).await
    }

    /// Flip the local video track. Returns the resulting enabled state;
    /// `false` if there is no video track or the session has ended.
    pub async fn toggle_video(&self) -> bool {
        self.toggle(MediaKind::Video).await
    }

    async fn toggle(&self, kind: MediaKind) -> bool {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(SessionMessage::ToggleTrack {
                kind,
                respond_to: tx,
            })
            .await
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Get a snapshot of the session.
    ///
    /// # Errors
    ///
    /// Returns `CallError::SessionClosed` if the session has already ended.
    pub async fn snapshot(&self) -> Result<SessionSnapshot, CallError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SessionMessage::GetSnapshot { respond_to: tx })
            .await
            .map_err(|_| CallError::SessionClosed)?;

        rx.await.map_err(|_| CallError::SessionClosed)
    }

    /// Cancel the session. It ends with [`EndReason::Shutdown`].
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Whether the actor has exited.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Wait until the actor has exited.
    pub async fn closed(&self) {
        self.sender.closed().await;
    }
}

/// The session actor implementation.
pub struct CallSessionActor {
    call_id: CallId,
    role: Role,
    machine: CallStateMachine,
    receiver: mpsc::Receiver<SessionMessage>,
    signals: mpsc::UnboundedReceiver<SignalInput>,
    cancel_token: CancellationToken,
    signaling: SignalingChannel,
    events: CallEvents,
    adapter: PeerConnectionAdapter,
    media: LocalMedia,
    subscriptions: Vec<Subscription>,
    ring_timeout: Duration,
    /// Deadline and generation of the armed ring timer.
    ring_timer: Option<(Instant, u64)>,
    remote_applied: bool,
    started_at: DateTime<Utc>,
    cleaned_up: bool,
    finished: bool,
}

impl CallSessionActor {
    /// Subscribe to the other side's fields and spawn the actor.
    ///
    /// The actor takes ownership of `media` and `adapter`. If the
    /// subscriptions cannot be set up, both are released before the error is
    /// returned.
    ///
    /// # Errors
    ///
    /// Returns `CallError::Transport` if the signaling subscriptions fail.
    pub async fn start(
        params: SessionParams,
        media: LocalMedia,
        mut adapter: PeerConnectionAdapter,
    ) -> Result<(CallSessionHandle, JoinHandle<()>), CallError> {
        let (signal_tx, signals) = mpsc::unbounded_channel();

        let subscriptions = match Self::subscribe(&params, &signal_tx).await {
            Ok(subscriptions) => subscriptions,
            Err(e) => {
                adapter.destroy();
                media.stop();
                return Err(e);
            }
        };

        let (sender, receiver) = mpsc::channel(SESSION_CHANNEL_BUFFER);
        let machine = CallStateMachine::new(params.role);

        let actor = Self {
            call_id: params.call_id,
            role: params.role,
            machine,
            receiver,
            signals,
            cancel_token: params.cancel_token.clone(),
            signaling: params.signaling,
            events: params.events,
            adapter,
            media,
            subscriptions,
            ring_timeout: params.ring_timeout,
            ring_timer: None,
            remote_applied: false,
            started_at: Utc::now(),
            cleaned_up: false,
            finished: false,
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = CallSessionHandle {
            sender,
            cancel_token: params.cancel_token,
            call_id: params.call_id,
            role: params.role,
        };

        Ok((handle, task_handle))
    }

    async fn subscribe(
        params: &SessionParams,
        signal_tx: &mpsc::UnboundedSender<SignalInput>,
    ) -> Result<Vec<Subscription>, CallError> {
        let remote_field = match params.role {
            Role::Initiator => RecordField::Answer,
            Role::Responder => RecordField::Offer,
        };

        let feed_lost = |field: RecordField| {
            let tx = signal_tx.clone();
            move || {
                let _ = tx.send(SignalInput::FeedLost(field));
            }
        };

        let tx = signal_tx.clone();
        let status = params
            .signaling
            .subscribe_until_lost(
                params.call_id,
                RecordField::Status,
                move |update: FieldUpdate| {
                    let _ = tx.send(SignalInput::Status(update.record));
                },
                feed_lost(RecordField::Status),
            )
            .await?;

        let tx = signal_tx.clone();
        let remote = params
            .signaling
            .subscribe_until_lost(
                params.call_id,
                remote_field,
                move |update: FieldUpdate| {
                    let payload = match update.field {
                        RecordField::Offer => update.record.offer_payload,
                        RecordField::Answer => update.record.answer_payload,
                        RecordField::Status => None,
                    };
                    if let Some(payload) = payload {
                        let _ = tx.send(SignalInput::RemotePayload(payload));
                    }
                },
                feed_lost(remote_field),
            )
            .await?;

        Ok(vec![status, remote])
    }

    #[instrument(skip_all, name = "call.session", fields(call_id = %self.call_id, role = %self.role))]
    async fn run(mut self) {
        info!(
            target: "call.session",
            call_id = %self.call_id,
            role = %self.role,
            "CallSessionActor started"
        );

        if self.role == Role::Initiator {
            self.dispatch(SessionEvent::PeerReady).await;
        }

        while !self.finished {
            let ring_timer = self.ring_timer;
            let deadline = ring_timer.map_or_else(Instant::now, |(at, _)| at);

            tokio::select! {
                biased;

                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "call.session",
                        call_id = %self.call_id,
                        "CallSessionActor received cancellation signal"
                    );
                    self.dispatch(SessionEvent::Shutdown).await;
                }

                Some(message) = self.receiver.recv() => {
                    self.handle_message(message).await;
                }

                Some(input) = self.signals.recv() => {
                    self.handle_signal(input).await;
                }

                event = self.adapter.next_event(), if self.adapter.is_open() => {
                    if let Some(event) = event {
                        self.handle_peer_event(event).await;
                    }
                }

                () = tokio::time::sleep_until(deadline), if ring_timer.is_some() => {
                    if let Some((_, generation)) = ring_timer {
                        self.ring_timer = None;
                        debug!(
                            target: "call.session",
                            call_id = %self.call_id,
                            generation,
                            "Ring timer fired"
                        );
                        self.dispatch(SessionEvent::RingTimeout { generation }).await;
                    }
                }
            }
        }

        info!(
            target: "call.session",
            call_id = %self.call_id,
            state = %self.machine.state(),
            reason = self.machine.end_reason().map_or("none", |r| r.as_str()),
            "CallSessionActor stopped"
        );
    }

    async fn handle_message(&mut self, message: SessionMessage) {
        match message {
            SessionMessage::HangUp { respond_to } => {
                self.dispatch(SessionEvent::HangUp).await;
                let _ = respond_to.send(Ok(()));
            }

            SessionMessage::ToggleTrack { kind, respond_to } => {
                let enabled = match self.adapter.is_track_enabled(kind) {
                    Some(current) => self.adapter.set_track_enabled(kind, !current),
                    None => false,
                };
                debug!(
                    target: "call.session",
                    call_id = %self.call_id,
                    kind = %kind,
                    enabled,
                    "Track toggled"
                );
                let _ = respond_to.send(enabled);
            }

            SessionMessage::GetSnapshot { respond_to } => {
                let _ = respond_to.send(self.snapshot());
            }
        }
    }

    async fn handle_signal(&mut self, input: SignalInput) {
        match input {
            SignalInput::RemotePayload(payload) => self.apply_remote_payload(&payload).await,
            SignalInput::Status(record) => {
                let status = record.status;
                self.events
                    .publish(self.call_id, UpdateKind::RecordStatus(record));
                self.dispatch(SessionEvent::RemoteStatus(status)).await;
            }
            SignalInput::FeedLost(field) => {
                warn!(
                    target: "call.session",
                    call_id = %self.call_id,
                    field = %field,
                    "Lost the signaling feed, the other side can no longer be observed"
                );
                self.dispatch(SessionEvent::TransportFailed).await;
            }
        }
    }

    /// Feed the other side's offer or answer into the adapter, once.
    async fn apply_remote_payload(&mut self, payload: &SignalPayload) {
        if self.remote_applied {
            debug!(
                target: "call.session",
                call_id = %self.call_id,
                "Remote payload already applied, ignoring redelivery"
            );
            return;
        }
        self.remote_applied = true;

        if let Err(e) = self.adapter.signal(payload) {
            warn!(
                target: "call.session",
                call_id = %self.call_id,
                error = %e,
                reason = e.reason_code(),
                "Remote payload rejected"
            );
            self.dispatch(SessionEvent::PeerFailed).await;
        }
    }

    async fn handle_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::NegotiationPayload(payload) => {
                let write = match self.role {
                    Role::Initiator => FieldWrite::Offer(payload),
                    Role::Responder => FieldWrite::Answer(payload),
                };
                if let Err(e) = self.signaling.publish(&self.call_id, &write).await {
                    warn!(
                        target: "call.session",
                        call_id = %self.call_id,
                        error = %e,
                        reason = e.reason_code(),
                        "Failed to publish negotiation payload"
                    );
                    if e.is_session_ending() {
                        self.dispatch(SessionEvent::TransportFailed).await;
                    }
                }
            }

            PeerEvent::RemoteStream(media) => {
                info!(
                    target: "call.session",
                    call_id = %self.call_id,
                    stream_id = %media.stream_id,
                    "Remote stream received"
                );
                self.events
                    .publish(self.call_id, UpdateKind::RemoteStream(media));
            }

            PeerEvent::Connected => self.dispatch(SessionEvent::PeerConnected).await,

            PeerEvent::Error(error) => {
                warn!(
                    target: "call.session",
                    call_id = %self.call_id,
                    error = %error,
                    "Peer connection failed"
                );
                self.dispatch(SessionEvent::PeerFailed).await;
            }

            PeerEvent::Closed => self.dispatch(SessionEvent::PeerClosed).await,
        }
    }

    /// Apply an event and run the resulting effects. Follow-up events raised
    /// by the effects are applied in order afterwards.
    async fn dispatch(&mut self, event: SessionEvent) {
        let mut pending = VecDeque::from([event]);

        while let Some(event) = pending.pop_front() {
            let Some(transition) = self.machine.apply(event.clone()) else {
                debug!(
                    target: "call.session",
                    call_id = %self.call_id,
                    state = %self.machine.state(),
                    event = ?event,
                    "Event ignored in current state"
                );
                continue;
            };

            debug!(
                target: "call.session",
                call_id = %self.call_id,
                from = %transition.from,
                to = %transition.to,
                "State transition"
            );
            self.events.publish(
                self.call_id,
                UpdateKind::StateChanged {
                    from: transition.from,
                    to: transition.to,
                },
            );

            for effect in transition.effects {
                if let Some(follow_up) = self.run_effect(effect).await {
                    pending.push_back(follow_up);
                }
            }
        }

        if self.cleaned_up && !self.finished {
            self.finished = true;
            let reason = self.machine.end_reason().unwrap_or(EndReason::Shutdown);
            self.events.publish(
                self.call_id,
                UpdateKind::Ended {
                    state: self.machine.state(),
                    reason,
                },
            );
        }
    }

    async fn run_effect(&mut self, effect: Effect) -> Option<SessionEvent> {
        match effect {
            Effect::ArmRingTimer { generation } => {
                self.ring_timer = Some((Instant::now() + self.ring_timeout, generation));
                None
            }

            Effect::CancelRingTimer => {
                self.ring_timer = None;
                None
            }

            Effect::PublishStatus(status) => {
                match self
                    .signaling
                    .publish(&self.call_id, &FieldWrite::status(status))
                    .await
                {
                    Ok(_) => None,
                    Err(e) => {
                        warn!(
                            target: "call.session",
                            call_id = %self.call_id,
                            status = %status,
                            error = %e,
                            reason = e.reason_code(),
                            "Failed to publish status"
                        );
                        e.is_session_ending()
                            .then_some(SessionEvent::TransportFailed)
                    }
                }
            }

            Effect::PublishEnded => {
                if let Err(e) = self
                    .signaling
                    .publish(&self.call_id, &FieldWrite::ended(Utc::now()))
                    .await
                {
                    warn!(
                        target: "call.session",
                        call_id = %self.call_id,
                        error = %e,
                        reason = e.reason_code(),
                        "Failed to publish call end, record may stay open"
                    );
                }
                None
            }

            Effect::Cleanup(reason) => {
                self.cleanup(reason);
                (self.machine.state() == CallState::TimedOut)
                    .then_some(SessionEvent::CleanupComplete)
            }
        }
    }

    /// Release every resource the session holds. Idempotent.
    fn cleanup(&mut self, reason: EndReason) {
        if self.cleaned_up {
            return;
        }
        self.cleaned_up = true;
        self.ring_timer = None;

        for subscription in &self.subscriptions {
            subscription.unsubscribe();
        }
        self.adapter.destroy();
        let tracks_stopped = self.media.stop();

        metrics::record_session_ended(reason.as_str());

        info!(
            target: "call.session",
            call_id = %self.call_id,
            reason = %reason,
            tracks_stopped,
            "Session cleaned up"
        );
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            call_id: self.call_id,
            role: self.role,
            state: self.machine.state(),
            remote_media: self.adapter.remote_media().cloned(),
            local_tracks: self.media.probes().iter().map(TrackStatus::from).collect(),
            started_at: self.started_at,
            end_reason: self.machine.end_reason(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::actors::messages::SessionUpdate;
    use crate::media::{LocalMedia, LocalTrack};
    use crate::peer::{PeerBackend, PeerConfig, PeerEventSink, PeerLink};
    use crate::store::{CallStore, InMemoryCallStore};
    use common::{CallRecord, CallStatus, UserId};
    use std::sync::{Arc, Mutex};
    use tokio::sync::broadcast;

    /// Backend that keeps the sink so tests can drive the connection.
    #[derive(Default)]
    struct ScriptedBackend {
        sink: Mutex<Option<PeerEventSink>>,
        signals: Arc<Mutex<Vec<SignalPayload>>>,
    }

    struct ScriptedLink {
        signals: Arc<Mutex<Vec<SignalPayload>>>,
    }

    impl PeerLink for ScriptedLink {
        fn signal(&mut self, payload: &SignalPayload) -> Result<(), CallError> {
            self.signals.lock().unwrap().push(payload.clone());
            Ok(())
        }

        fn close(&mut self) {}
    }

    impl PeerBackend for ScriptedBackend {
        fn open(
            &self,
            _config: PeerConfig,
            events: PeerEventSink,
        ) -> Result<Box<dyn PeerLink>, CallError> {
            *self.sink.lock().unwrap() = Some(events);
            Ok(Box::new(ScriptedLink {
                signals: Arc::clone(&self.signals),
            }))
        }
    }

    struct Harness {
        store: Arc<InMemoryCallStore>,
        backend: ScriptedBackend,
        events: CallEvents,
        cancel: CancellationToken,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                store: Arc::new(InMemoryCallStore::new()),
                backend: ScriptedBackend::default(),
                events: CallEvents::new(),
                cancel: CancellationToken::new(),
            }
        }

        async fn start_initiator(
            &self,
        ) -> (
            CallId,
            CallSessionHandle,
            PeerEventSink,
            Vec<crate::media::TrackProbe>,
        ) {
            let call_id = CallId::new();
            self.store
                .create_record(&CallRecord::ringing(
                    call_id,
                    UserId::from("u1"),
                    UserId::from("u2"),
                    MediaKind::Video,
                    Utc::now(),
                ))
                .await
                .unwrap();

            let media = LocalMedia::new(vec![
                LocalTrack::new("mic", MediaKind::Audio),
                LocalTrack::new("cam", MediaKind::Video),
            ]);
            let probes = media.probes();
            let adapter = PeerConnectionAdapter::open(
                &self.backend,
                PeerConfig {
                    call_id,
                    role: Role::Initiator,
                    media_kind: MediaKind::Video,
                    ice_servers: vec![],
                    tracks: media.controls(),
                },
            )
            .unwrap();
            let sink = self.backend.sink.lock().unwrap().take().unwrap();

            let (handle, _task) = CallSessionActor::start(
                SessionParams {
                    call_id,
                    role: Role::Initiator,
                    media_kind: MediaKind::Video,
                    ring_timeout: Duration::from_secs(60),
                    signaling: SignalingChannel::new(self.store.clone()),
                    events: self.events.clone(),
                    cancel_token: self.cancel.child_token(),
                },
                media,
                adapter,
            )
            .await
            .unwrap();

            (call_id, handle, sink, probes)
        }
    }

    async fn wait_for_end(rx: &mut broadcast::Receiver<SessionUpdate>) -> (CallState, EndReason) {
        loop {
            let update = rx.recv().await.unwrap();
            if let UpdateKind::Ended { state, reason } = update.kind {
                return (state, reason);
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_ring_timeout_ends_call() {
        let harness = Harness::new();
        let mut updates = harness.events.subscribe();
        let (call_id, handle, _sink, probes) = harness.start_initiator().await;

        let (state, reason) = wait_for_end(&mut updates).await;
        assert_eq!(state, CallState::Ended);
        assert_eq!(reason, EndReason::TimedOut);

        handle.closed().await;
        let record = harness.store.get_record(&call_id).await.unwrap().unwrap();
        assert_eq!(record.status, CallStatus::Ended);
        assert!(record.ended_at.is_some());
        assert!(probes.iter().all(|p| p.is_stopped() && p.stop_count() == 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_cancels_ring_timer() {
        let harness = Harness::new();
        let (call_id, handle, sink, _probes) = harness.start_initiator().await;

        sink.on_connected();
        tokio::time::sleep(Duration::from_secs(120)).await;

        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.state, CallState::Connected);
        let record = harness.store.get_record(&call_id).await.unwrap().unwrap();
        assert_eq!(record.status, CallStatus::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_offer_published_and_answer_applied_once() {
        let harness = Harness::new();
        let (call_id, _handle, sink, _probes) = harness.start_initiator().await;
        let signaling = SignalingChannel::new(harness.store.clone());

        sink.on_negotiation_payload(SignalPayload::new("offer-sdp"));
        tokio::time::sleep(Duration::from_millis(10)).await;
        let record = harness.store.get_record(&call_id).await.unwrap().unwrap();
        assert_eq!(record.offer_payload, Some(SignalPayload::new("offer-sdp")));

        signaling
            .publish(&call_id, &FieldWrite::Answer(SignalPayload::new("answer-sdp")))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(
            *harness.backend.signals.lock().unwrap(),
            vec![SignalPayload::new("answer-sdp")]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_hang_up_cleans_up_once_and_closes_handle() {
        let harness = Harness::new();
        let mut updates = harness.events.subscribe();
        let (call_id, handle, _sink, probes) = harness.start_initiator().await;

        handle.hang_up().await.unwrap();
        assert_eq!(
            wait_for_end(&mut updates).await,
            (CallState::Ended, EndReason::LocalHangUp)
        );
        handle.closed().await;

        assert!(matches!(handle.hang_up().await, Err(CallError::SessionClosed)));
        assert!(!handle.toggle_audio().await);
        assert!(!handle.toggle_video().await);
        assert!(probes.iter().all(|p| p.stop_count() == 1));

        let record = harness.store.get_record(&call_id).await.unwrap().unwrap();
        assert_eq!(record.status, CallStatus::Ended);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_end_does_not_republish() {
        let harness = Harness::new();
        let mut updates = harness.events.subscribe();
        let (call_id, _handle, _sink, _probes) = harness.start_initiator().await;
        let signaling = SignalingChannel::new(harness.store.clone());

        signaling
            .publish(&call_id, &FieldWrite::status(CallStatus::Declined))
            .await
            .unwrap();

        assert_eq!(
            wait_for_end(&mut updates).await,
            (CallState::Ended, EndReason::RemoteDeclined)
        );
        let record = harness.store.get_record(&call_id).await.unwrap().unwrap();
        assert_eq!(record.status, CallStatus::Declined);
        assert!(record.ended_at.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_toggles_flip_track_state() {
        let harness = Harness::new();
        let (_call_id, handle, _sink, probes) = harness.start_initiator().await;

        assert!(!handle.toggle_audio().await);
        assert!(handle.toggle_audio().await);
        assert!(!handle.toggle_video().await);

        let snapshot = handle.snapshot().await.unwrap();
        let video = snapshot
            .local_tracks
            .iter()
            .find(|t| t.kind == MediaKind::Video)
            .unwrap();
        assert!(!video.enabled);
        assert!(probes.iter().all(|p| !p.is_stopped()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_ends_with_shutdown() {
        let harness = Harness::new();
        let mut updates = harness.events.subscribe();
        let (_call_id, handle, _sink, probes) = harness.start_initiator().await;

        harness.cancel.cancel();

        assert_eq!(
            wait_for_end(&mut updates).await,
            (CallState::Ended, EndReason::Shutdown)
        );
        handle.closed().await;
        assert!(handle.is_closed());
        assert!(probes.iter().all(|p| p.is_stopped()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_error_ends_with_negotiation_failure() {
        let harness = Harness::new();
        let mut updates = harness.events.subscribe();
        let (_call_id, _handle, sink, _probes) = harness.start_initiator().await;

        sink.on_error("ice failed");

        assert_eq!(
            wait_for_end(&mut updates).await,
            (CallState::Ended, EndReason::NegotiationFailed)
        );
    }
}
