//! Mock negotiation library.
//!
//! In [`PeerMode::Connect`] the mock behaves like a library on a perfect
//! network:
//!
//! - the initiator's connection emits its offer as soon as it is opened
//! - the responder's connection answers the offer it is signalled, then
//!   reports the remote stream and the connection
//! - the initiator's connection reports the remote stream and the connection
//!   once it is signalled the answer
//!
//! Other modes fail at a chosen point, or do nothing so a test can drive the
//! connection through [`MockPeerBackend::sink`].

use call_service::errors::CallError;
use call_service::peer::{PeerBackend, PeerConfig, PeerEventSink, PeerLink, RemoteMedia, Role};
use common::{CallId, MediaKind, SignalPayload};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// How the mock connections behave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerMode {
    /// Negotiate and connect on the first exchange.
    Connect,
    /// Emit the offer/answer but report an error when signalled.
    FailOnSignal,
    /// Refuse to open connections.
    RejectOpen,
    /// Emit nothing; the test drives events through the sink.
    Manual,
}

/// What a test can observe about one opened connection.
#[derive(Debug, Clone)]
pub struct OpenedPeer {
    pub call_id: CallId,
    pub role: Role,
    pub media_kind: MediaKind,
    pub ice_servers: Vec<String>,
}

#[derive(Debug, Default)]
struct Shared {
    opened: Vec<OpenedPeer>,
    sinks: HashMap<CallId, PeerEventSink>,
    signals: Vec<(CallId, SignalPayload)>,
}

/// Mock `PeerBackend`.
#[derive(Debug, Clone)]
pub struct MockPeerBackend {
    mode: PeerMode,
    shared: Arc<Mutex<Shared>>,
    close_count: Arc<AtomicUsize>,
}

impl MockPeerBackend {
    #[must_use]
    pub fn new(mode: PeerMode) -> Self {
        Self {
            mode,
            shared: Arc::new(Mutex::new(Shared::default())),
            close_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Create a mock whose connections always succeed.
    #[must_use]
    pub fn connecting() -> Self {
        Self::new(PeerMode::Connect)
    }

    /// Create a mock whose connections fail on the first remote payload.
    #[must_use]
    pub fn failing() -> Self {
        Self::new(PeerMode::FailOnSignal)
    }

    /// Create a mock that cannot open connections.
    #[must_use]
    pub fn rejecting() -> Self {
        Self::new(PeerMode::RejectOpen)
    }

    /// Create a mock that emits nothing on its own.
    #[must_use]
    pub fn manual() -> Self {
        Self::new(PeerMode::Manual)
    }

    /// Connections opened so far.
    pub fn opened(&self) -> Vec<OpenedPeer> {
        self.shared.lock().unwrap().opened.clone()
    }

    /// Event sink of the connection opened for `call_id`.
    pub fn sink(&self, call_id: &CallId) -> Option<PeerEventSink> {
        self.shared.lock().unwrap().sinks.get(call_id).cloned()
    }

    /// Remote payloads signalled into connections, in order.
    pub fn signals(&self) -> Vec<(CallId, SignalPayload)> {
        self.shared.lock().unwrap().signals.clone()
    }

    /// Number of connections closed.
    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }
}

impl Default for MockPeerBackend {
    fn default() -> Self {
        Self::connecting()
    }
}

/// Offer the mock initiator emits for a call.
#[must_use]
pub fn mock_offer(call_id: &CallId) -> SignalPayload {
    SignalPayload::new(format!("offer:{call_id}"))
}

/// Answer the mock responder emits for a call.
#[must_use]
pub fn mock_answer(call_id: &CallId) -> SignalPayload {
    SignalPayload::new(format!("answer:{call_id}"))
}

fn remote_media(call_id: &CallId, role: Role, media_kind: MediaKind) -> RemoteMedia {
    let kinds = match media_kind {
        MediaKind::Audio => vec![MediaKind::Audio],
        MediaKind::Video => vec![MediaKind::Audio, MediaKind::Video],
    };
    RemoteMedia {
        stream_id: format!("{call_id}:{role}:remote"),
        kinds,
    }
}

impl PeerBackend for MockPeerBackend {
    fn open(
        &self,
        config: PeerConfig,
        events: PeerEventSink,
    ) -> Result<Box<dyn PeerLink>, CallError> {
        if self.mode == PeerMode::RejectOpen {
            return Err(CallError::Negotiation(
                "mock backend refused to open".to_string(),
            ));
        }

        {
            let mut shared = self.shared.lock().unwrap();
            shared.opened.push(OpenedPeer {
                call_id: config.call_id,
                role: config.role,
                media_kind: config.media_kind,
                ice_servers: config.ice_servers.clone(),
            });
            shared.sinks.insert(config.call_id, events.clone());
        }

        if self.mode != PeerMode::Manual && config.role == Role::Initiator {
            events.on_negotiation_payload(mock_offer(&config.call_id));
        }

        Ok(Box::new(MockPeerLink {
            mode: self.mode,
            call_id: config.call_id,
            role: config.role,
            media_kind: config.media_kind,
            events,
            shared: Arc::clone(&self.shared),
            close_count: Arc::clone(&self.close_count),
            closed: false,
        }))
    }
}

struct MockPeerLink {
    mode: PeerMode,
    call_id: CallId,
    role: Role,
    media_kind: MediaKind,
    events: PeerEventSink,
    shared: Arc<Mutex<Shared>>,
    close_count: Arc<AtomicUsize>,
    closed: bool,
}

impl PeerLink for MockPeerLink {
    fn signal(&mut self, payload: &SignalPayload) -> Result<(), CallError> {
        self.shared
            .lock()
            .unwrap()
            .signals
            .push((self.call_id, payload.clone()));

        match self.mode {
            PeerMode::Connect => {
                if self.role == Role::Responder {
                    self.events
                        .on_negotiation_payload(mock_answer(&self.call_id));
                }
                self.events
                    .on_remote_stream(remote_media(&self.call_id, self.role, self.media_kind));
                self.events.on_connected();
            }
            PeerMode::FailOnSignal => {
                if self.role == Role::Responder {
                    self.events
                        .on_negotiation_payload(mock_answer(&self.call_id));
                }
                self.events.on_error("ice connection failed");
            }
            PeerMode::RejectOpen | PeerMode::Manual => {}
        }
        Ok(())
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.close_count.fetch_add(1, Ordering::SeqCst);
        }
    }
}
