//! `CallController` - application root for call sessions.
//!
//! The controller:
//!
//! - Places outgoing calls (`initiate`) and answers or declines incoming ones
//! - Owns the root `CancellationToken`; every session gets a child token
//! - Tracks live sessions and rejects a second session for the same call id
//! - Hands out incoming-call watchers for the local user
//!
//! Unlike the sessions it supervises, the controller is not an actor:
//! `initiate` and `answer` wait on media acquisition, which may sit behind a
//! permission prompt, and one caller's prompt must not hold up another's
//! hang-up. Shared state sits behind a short-lived lock instead.
//!
//! At most one live session per call id is enforced. One active call per
//! user is not.
//!
//! # Graceful Shutdown
//!
//! `shutdown` cancels the root token (every session ends with
//! `EndReason::Shutdown`) and waits for session tasks up to the deadline.

use super::messages::CallEvents;
use super::session::{CallSessionActor, CallSessionHandle, SessionParams};
use super::state::{CallStateMachine, Effect, SessionEvent};
use crate::config::{Config, DEFAULT_ICE_SERVERS, DEFAULT_RING_TIMEOUT_SECONDS};
use crate::errors::CallError;
use crate::incoming::IncomingCallWatcher;
use crate::media::{LocalMedia, MediaAcquirer, MediaConstraints};
use crate::observability::metrics;
use crate::peer::{PeerBackend, PeerConfig, PeerConnectionAdapter, Role};
use crate::signaling::SignalingChannel;
use crate::store::{CallStore, FieldWrite};
use chrono::Utc;
use common::{CallId, CallRecord, CallStatus, MediaKind, UserId};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Session settings shared by every call this controller places or answers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerSettings {
    pub ring_timeout: Duration,
    pub ice_servers: Vec<String>,
}

impl ControllerSettings {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            ring_timeout: config.ring_timeout(),
            ice_servers: config.ice_servers.clone(),
        }
    }
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            ring_timeout: Duration::from_secs(DEFAULT_RING_TIMEOUT_SECONDS),
            ice_servers: DEFAULT_ICE_SERVERS.iter().map(ToString::to_string).collect(),
        }
    }
}

/// Managed session with its task handle.
struct ManagedSession {
    handle: CallSessionHandle,
    task_handle: JoinHandle<()>,
}

#[derive(Default)]
struct Registry {
    sessions: HashMap<CallId, ManagedSession>,
    /// Call ids with an `answer` or `decline` in flight.
    claims: HashSet<CallId>,
}

/// Releases a call id claim when dropped.
struct ClaimGuard {
    registry: Arc<Mutex<Registry>>,
    call_id: CallId,
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        lock(&self.registry).claims.remove(&self.call_id);
    }
}

fn lock(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Application root for call sessions.
#[derive(Clone)]
pub struct CallController {
    local_user: UserId,
    signaling: SignalingChannel,
    media: Arc<dyn MediaAcquirer>,
    backend: Arc<dyn PeerBackend>,
    events: CallEvents,
    settings: Arc<ControllerSettings>,
    registry: Arc<Mutex<Registry>>,
    cancel_token: CancellationToken,
}

impl CallController {
    #[must_use]
    pub fn new(
        local_user: UserId,
        store: Arc<dyn CallStore>,
        media: Arc<dyn MediaAcquirer>,
        backend: Arc<dyn PeerBackend>,
        events: CallEvents,
        settings: ControllerSettings,
    ) -> Self {
        Self {
            local_user,
            signaling: SignalingChannel::new(store),
            media,
            backend,
            events,
            settings: Arc::new(settings),
            registry: Arc::new(Mutex::new(Registry::default())),
            cancel_token: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn local_user(&self) -> &UserId {
        &self.local_user
    }

    /// Session update feed shared with the application.
    #[must_use]
    pub fn events(&self) -> &CallEvents {
        &self.events
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Get a child token of the controller's root token.
    #[must_use]
    pub fn child_token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }

    /// Place a call to `receiver_id`.
    ///
    /// Media is acquired first; if that fails no record is created. The
    /// returned session is `Ringing` once its actor has started.
    ///
    /// # Errors
    ///
    /// - `CallError::MediaAccess` if local media cannot be acquired
    /// - `CallError::Negotiation` if the peer connection cannot be created
    /// - `CallError::Transport` if the record cannot be written
    #[instrument(skip_all, fields(receiver_id = %receiver_id, media_kind = %media_kind))]
    pub async fn initiate(
        &self,
        receiver_id: UserId,
        media_kind: MediaKind,
    ) -> Result<CallSessionHandle, CallError> {
        self.place_call(receiver_id, media_kind)
            .await
            .inspect_err(|e| failed("initiate", e))
    }

    async fn place_call(
        &self,
        receiver_id: UserId,
        media_kind: MediaKind,
    ) -> Result<CallSessionHandle, CallError> {
        self.ensure_accepting()?;

        let media = self
            .media
            .acquire(MediaConstraints::for_kind(media_kind))
            .await?;

        let call_id = CallId::new();
        let mut adapter = match self.open_adapter(call_id, Role::Initiator, media_kind, &media) {
            Ok(adapter) => adapter,
            Err(e) => {
                media.stop();
                return Err(e);
            }
        };

        let record = CallRecord::ringing(
            call_id,
            self.local_user.clone(),
            receiver_id,
            media_kind,
            Utc::now(),
        );
        if let Err(e) = self.signaling.store().create_record(&record).await {
            adapter.destroy();
            media.stop();
            return Err(e);
        }
        metrics::record_call_initiated(media_kind.as_str());

        let handle = match self
            .start_session(call_id, Role::Initiator, media_kind, media, adapter)
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                self.publish_ended_best_effort(&call_id).await;
                return Err(e);
            }
        };

        info!(
            target: "call.controller",
            call_id = %call_id,
            media_kind = %media_kind,
            "Call initiated"
        );

        Ok(handle)
    }

    /// Answer an incoming call.
    ///
    /// # Errors
    ///
    /// - `CallError::Conflict` if a session for the call already exists
    /// - `CallError::CallNotFound` if there is no record
    /// - `CallError::NotParticipant` if the call is not addressed to the local user
    /// - `CallError::CallNotRinging` if the call was already answered or ended
    /// - `CallError::MediaAccess` if local media cannot be acquired
    /// - `CallError::Transport` if the status cannot be written
    #[instrument(skip_all, fields(call_id = %call_id))]
    pub async fn answer(&self, call_id: CallId) -> Result<CallSessionHandle, CallError> {
        self.accept_call(call_id)
            .await
            .inspect_err(|e| failed("answer", e))
    }

    async fn accept_call(&self, call_id: CallId) -> Result<CallSessionHandle, CallError> {
        self.ensure_accepting()?;
        let _claim = self.claim(call_id)?;

        let record = self.incoming_record(&call_id).await?;
        if record.status != CallStatus::Ringing {
            return Err(CallError::CallNotRinging(record.status));
        }

        let media = self
            .media
            .acquire(MediaConstraints::for_kind(record.media_kind))
            .await?;

        if let Err(e) = self
            .signaling
            .publish(&call_id, &FieldWrite::status(CallStatus::Accepted))
            .await
        {
            media.stop();
            return Err(e);
        }

        let adapter =
            match self.open_adapter(call_id, Role::Responder, record.media_kind, &media) {
                Ok(adapter) => adapter,
                Err(e) => {
                    media.stop();
                    self.publish_ended_best_effort(&call_id).await;
                    return Err(e);
                }
            };

        let handle = match self
            .start_session(call_id, Role::Responder, record.media_kind, media, adapter)
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                self.publish_ended_best_effort(&call_id).await;
                return Err(e);
            }
        };
        metrics::record_call_answered();

        info!(
            target: "call.controller",
            call_id = %call_id,
            caller_id = %record.caller_id,
            "Call answered"
        );

        Ok(handle)
    }

    /// Decline an incoming call that has not been answered.
    ///
    /// No session is created. Declining a call that already ended is a no-op.
    ///
    /// # Errors
    ///
    /// - `CallError::Conflict` if the call is being answered or has a live session
    /// - `CallError::CallNotFound` if there is no record
    /// - `CallError::NotParticipant` if the call is not addressed to the local user
    /// - `CallError::CallNotRinging` if the call was already answered
    /// - `CallError::Transport` if the status cannot be written
    #[instrument(skip_all, fields(call_id = %call_id))]
    pub async fn decline(&self, call_id: CallId) -> Result<(), CallError> {
        self.refuse_call(call_id)
            .await
            .inspect_err(|e| failed("decline", e))
    }

    async fn refuse_call(&self, call_id: CallId) -> Result<(), CallError> {
        let _claim = self.claim(call_id)?;

        let record = self.incoming_record(&call_id).await?;
        if record.status.is_terminal() {
            debug!(
                target: "call.controller",
                call_id = %call_id,
                status = %record.status,
                "Call already over, nothing to decline"
            );
            return Ok(());
        }
        if record.status != CallStatus::Ringing {
            return Err(CallError::CallNotRinging(record.status));
        }

        let mut machine = CallStateMachine::incoming();
        let effects = machine
            .apply(SessionEvent::Decline)
            .map(|t| t.effects)
            .unwrap_or_default();
        for effect in effects {
            if let Effect::PublishStatus(status) = effect {
                self.signaling
                    .publish(&call_id, &FieldWrite::status(status))
                    .await?;
            }
        }
        metrics::record_call_declined();

        info!(
            target: "call.controller",
            call_id = %call_id,
            caller_id = %record.caller_id,
            "Call declined"
        );

        Ok(())
    }

    /// Live session for a call, if any.
    #[must_use]
    pub fn session(&self, call_id: &CallId) -> Option<CallSessionHandle> {
        lock(&self.registry)
            .sessions
            .get(call_id)
            .filter(|managed| !managed.handle.is_closed())
            .map(|managed| managed.handle.clone())
    }

    /// Every live session.
    #[must_use]
    pub fn active_sessions(&self) -> Vec<CallSessionHandle> {
        lock(&self.registry)
            .sessions
            .values()
            .filter(|managed| !managed.handle.is_closed())
            .map(|managed| managed.handle.clone())
            .collect()
    }

    /// Start watching the registry for calls addressed to the local user.
    ///
    /// # Errors
    ///
    /// Returns `CallError::Transport` if the registry cannot be watched.
    pub async fn watch_incoming<F>(&self, on_incoming: F) -> Result<IncomingCallWatcher, CallError>
    where
        F: Fn(CallRecord) + Send + Sync + 'static,
    {
        IncomingCallWatcher::start(
            Arc::clone(self.signaling.store()),
            self.local_user.clone(),
            self.child_token(),
            on_incoming,
        )
        .await
    }

    /// Check whether media of `kind` can be acquired.
    ///
    /// Acquires, immediately stops every track and reports whether access was
    /// granted. Never creates a record.
    pub async fn probe_media_permissions(&self, kind: MediaKind) -> bool {
        match self.media.acquire(MediaConstraints::for_kind(kind)).await {
            Ok(media) => {
                media.stop();
                true
            }
            Err(e) => {
                debug!(
                    target: "call.controller",
                    media_kind = %kind,
                    error = %e,
                    "Media permission probe failed"
                );
                false
            }
        }
    }

    /// End every session and wait for their tasks, up to `deadline`.
    #[instrument(skip_all)]
    pub async fn shutdown(&self, deadline: Duration) {
        let sessions: Vec<(CallId, ManagedSession)> =
            lock(&self.registry).sessions.drain().collect();

        info!(
            target: "call.controller",
            session_count = sessions.len(),
            "Shutting down call sessions"
        );

        // Cancel the root token (propagates to all sessions)
        self.cancel_token.cancel();

        let until = tokio::time::Instant::now() + deadline;
        for (call_id, managed) in sessions {
            match tokio::time::timeout_at(until, managed.task_handle).await {
                Ok(Ok(())) => {
                    debug!(
                        target: "call.controller",
                        call_id = %call_id,
                        "Session completed cleanly"
                    );
                }
                Ok(Err(e)) => {
                    warn!(
                        target: "call.controller",
                        call_id = %call_id,
                        error = ?e,
                        "Session task panicked during shutdown"
                    );
                }
                Err(_) => {
                    warn!(
                        target: "call.controller",
                        call_id = %call_id,
                        "Session shutdown timed out"
                    );
                }
            }
        }

        metrics::set_sessions_active(0);
        info!(target: "call.controller", "Graceful shutdown complete");
    }

    fn ensure_accepting(&self) -> Result<(), CallError> {
        if self.is_shutting_down() {
            return Err(CallError::Internal("controller is shutting down".to_string()));
        }
        Ok(())
    }

    /// Reserve a call id for an answer or decline in flight.
    fn claim(&self, call_id: CallId) -> Result<ClaimGuard, CallError> {
        let mut registry = lock(&self.registry);

        let live = registry
            .sessions
            .get(&call_id)
            .is_some_and(|managed| !managed.handle.is_closed());
        if live || !registry.claims.insert(call_id) {
            return Err(CallError::Conflict(format!(
                "call {call_id} already has a session"
            )));
        }

        Ok(ClaimGuard {
            registry: Arc::clone(&self.registry),
            call_id,
        })
    }

    /// Read a record that must be addressed to the local user.
    async fn incoming_record(&self, call_id: &CallId) -> Result<CallRecord, CallError> {
        let record = self
            .signaling
            .store()
            .get_record(call_id)
            .await?
            .ok_or_else(|| CallError::CallNotFound(call_id.to_string()))?;

        if record.receiver_id != self.local_user {
            return Err(CallError::NotParticipant(format!(
                "call {call_id} is not addressed to {}",
                self.local_user
            )));
        }
        Ok(record)
    }

    fn open_adapter(
        &self,
        call_id: CallId,
        role: Role,
        media_kind: MediaKind,
        media: &LocalMedia,
    ) -> Result<PeerConnectionAdapter, CallError> {
        PeerConnectionAdapter::open(
            self.backend.as_ref(),
            PeerConfig {
                call_id,
                role,
                media_kind,
                ice_servers: self.settings.ice_servers.clone(),
                tracks: media.controls(),
            },
        )
    }

    async fn start_session(
        &self,
        call_id: CallId,
        role: Role,
        media_kind: MediaKind,
        media: LocalMedia,
        adapter: PeerConnectionAdapter,
    ) -> Result<CallSessionHandle, CallError> {
        let params = SessionParams {
            call_id,
            role,
            media_kind,
            ring_timeout: self.settings.ring_timeout,
            signaling: self.signaling.clone(),
            events: self.events.clone(),
            cancel_token: self.child_token(),
        };

        let (handle, task_handle) = CallSessionActor::start(params, media, adapter).await?;

        let active = {
            let mut registry = lock(&self.registry);
            registry.sessions.insert(
                call_id,
                ManagedSession {
                    handle: handle.clone(),
                    task_handle,
                },
            );
            registry.sessions.len()
        };
        metrics::set_sessions_active(active);

        // Drop the entry once the actor exits
        let registry = Arc::clone(&self.registry);
        let watched = handle.clone();
        tokio::spawn(async move {
            watched.closed().await;
            let remaining = {
                let mut registry = lock(&registry);
                registry.sessions.remove(&call_id);
                registry.sessions.len()
            };
            metrics::set_sessions_active(remaining);
            debug!(
                target: "call.controller",
                call_id = %call_id,
                remaining,
                "Session removed"
            );
        });

        Ok(handle)
    }

    async fn publish_ended_best_effort(&self, call_id: &CallId) {
        if let Err(e) = self
            .signaling
            .publish(call_id, &FieldWrite::ended(Utc::now()))
            .await
        {
            warn!(
                target: "call.controller",
                call_id = %call_id,
                error = %e,
                "Failed to mark abandoned call as ended"
            );
        }
    }
}

/// Log and count a failed controller operation.
fn failed(operation: &'static str, error: &CallError) {
    debug!(
        target: "call.controller",
        operation,
        error = %error,
        reason = error.reason_code(),
        "Call operation failed"
    );
    metrics::record_operation_failure(operation, error.reason_code());
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::errors::MediaError;
    use crate::media::LocalTrack;
    use crate::peer::{PeerEventSink, PeerLink};
    use crate::store::InMemoryCallStore;
    use async_trait::async_trait;
    use common::SignalPayload;
    use std::collections::HashMap as Vars;

    struct DeniedMedia;

    #[async_trait]
    impl MediaAcquirer for DeniedMedia {
        async fn acquire(&self, _constraints: MediaConstraints) -> Result<LocalMedia, MediaError> {
            Err(MediaError::PermissionDenied)
        }
    }

    struct GrantedMedia;

    #[async_trait]
    impl MediaAcquirer for GrantedMedia {
        async fn acquire(&self, constraints: MediaConstraints) -> Result<LocalMedia, MediaError> {
            Ok(LocalMedia::new(
                constraints
                    .kinds()
                    .into_iter()
                    .map(|kind| LocalTrack::new(kind.as_str(), kind))
                    .collect(),
            ))
        }
    }

    struct NullLink;

    impl PeerLink for NullLink {
        fn signal(&mut self, _payload: &SignalPayload) -> Result<(), CallError> {
            Ok(())
        }

        fn close(&mut self) {}
    }

    struct NullBackend;

    impl PeerBackend for NullBackend {
        fn open(
            &self,
            _config: PeerConfig,
            _events: PeerEventSink,
        ) -> Result<Box<dyn PeerLink>, CallError> {
            Ok(Box::new(NullLink))
        }
    }

    fn controller(media: Arc<dyn MediaAcquirer>) -> (CallController, Arc<InMemoryCallStore>) {
        let store = Arc::new(InMemoryCallStore::new());
        let controller = CallController::new(
            UserId::from("u2"),
            store.clone(),
            media,
            Arc::new(NullBackend),
            CallEvents::new(),
            ControllerSettings::default(),
        );
        (controller, store)
    }

    #[test]
    fn test_settings_from_config() {
        let vars = Vars::from([
            ("REDIS_URL".to_string(), "redis://localhost".to_string()),
            ("CALL_LOCAL_USER_ID".to_string(), "u2".to_string()),
            ("CALL_RING_TIMEOUT_SECONDS".to_string(), "15".to_string()),
        ]);
        let config = Config::from_vars(&vars).unwrap();

        let settings = ControllerSettings::from_config(&config);
        assert_eq!(settings.ring_timeout, Duration::from_secs(15));
        assert_eq!(settings, ControllerSettings {
            ring_timeout: Duration::from_secs(15),
            ..ControllerSettings::default()
        });
    }

    #[tokio::test]
    async fn test_claim_rejects_second_claim_until_released() {
        let (controller, _store) = controller(Arc::new(GrantedMedia));
        let call_id = CallId::new();

        let claim = controller.claim(call_id).unwrap();
        assert!(matches!(
            controller.claim(call_id),
            Err(CallError::Conflict(_))
        ));

        drop(claim);
        assert!(controller.claim(call_id).is_ok());
    }

    #[tokio::test]
    async fn test_probe_media_permissions() {
        let (granted, _) = controller(Arc::new(GrantedMedia));
        assert!(granted.probe_media_permissions(MediaKind::Video).await);

        let (denied, store) = controller(Arc::new(DeniedMedia));
        assert!(!denied.probe_media_permissions(MediaKind::Audio).await);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_initiate_after_shutdown_rejected() {
        let (controller, store) = controller(Arc::new(GrantedMedia));
        controller.shutdown(Duration::from_secs(1)).await;

        let result = controller
            .initiate(UserId::from("u1"), MediaKind::Audio)
            .await;
        assert!(matches!(result, Err(CallError::Internal(_))));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_failed_operations_are_counted_by_reason() {
        use metrics_util::debugging::{DebugValue, DebuggingRecorder};

        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        let _guard = ::metrics::set_default_local_recorder(&recorder);

        let (controller, _store) = controller(Arc::new(DeniedMedia));
        assert!(matches!(
            controller.answer(CallId::new()).await,
            Err(CallError::CallNotFound(_))
        ));
        assert!(matches!(
            controller.initiate(UserId::from("u1"), MediaKind::Audio).await,
            Err(CallError::MediaAccess(_))
        ));

        let mut failures: Vec<(Vec<String>, DebugValue)> = snapshotter
            .snapshot()
            .into_vec()
            .into_iter()
            .filter(|(key, _, _, _)| key.key().name() == "call_operation_failures_total")
            .map(|(key, _, _, value)| {
                let labels = key.key().labels().map(|l| l.value().to_string()).collect();
                (labels, value)
            })
            .collect();
        failures.sort_by(|a, b| a.0.cmp(&b.0));

        assert_eq!(
            failures,
            vec![
                (
                    vec!["answer".to_string(), "not_found".to_string()],
                    DebugValue::Counter(1)
                ),
                (
                    vec!["initiate".to_string(), "media_access".to_string()],
                    DebugValue::Counter(1)
                ),
            ]
        );
    }
}
