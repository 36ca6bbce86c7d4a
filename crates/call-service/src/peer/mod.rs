//! Peer negotiation library boundary.
//!
//! [`PeerBackend`] and [`PeerLink`] are the only place where the external
//! negotiation library's vocabulary appears. The library reports what
//! happens through the callback-style [`PeerEventSink`], which turns each
//! callback into a [`PeerEvent`] for the owning session to consume.
//!
//! Negotiation is non-trickle: the initiator's library emits exactly one
//! offer, the responder's exactly one answer.

pub mod adapter;

pub use adapter::PeerConnectionAdapter;

use crate::errors::CallError;
use crate::media::TrackControls;
use common::{CallId, MediaKind, SignalPayload};
use serde::Serialize;
use std::fmt;
use tokio::sync::mpsc;

/// Which side of the negotiation this participant plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Created the call; sends the offer.
    Initiator,
    /// Answered the call; sends the answer.
    Responder,
}

impl Role {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Role::Initiator => "initiator",
            Role::Responder => "responder",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything the library needs to open one connection.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub call_id: CallId,
    pub role: Role,
    pub media_kind: MediaKind,
    /// STUN/TURN server URLs.
    pub ice_servers: Vec<String>,
    /// Local tracks to send. The library may toggle them but not stop them.
    pub tracks: TrackControls,
}

/// The remote party's media, once negotiation has succeeded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteMedia {
    pub stream_id: String,
    pub kinds: Vec<MediaKind>,
}

/// Lifecycle events of one peer connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// A local offer or answer is ready to be sent to the other side.
    NegotiationPayload(SignalPayload),
    /// The remote party's media arrived.
    RemoteStream(RemoteMedia),
    /// The transport reports an established, bidirectional path.
    Connected,
    /// The connection failed and can no longer be used.
    Error(String),
    /// The connection closed and can no longer be used.
    Closed,
}

impl PeerEvent {
    /// Whether the connection is unusable after this event.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, PeerEvent::Error(_) | PeerEvent::Closed)
    }
}

/// Callback registration handed to the negotiation library.
///
/// Events sent after the adapter is gone are silently dropped.
#[derive(Debug, Clone)]
pub struct PeerEventSink {
    tx: mpsc::UnboundedSender<PeerEvent>,
}

impl PeerEventSink {
    pub(crate) fn new(tx: mpsc::UnboundedSender<PeerEvent>) -> Self {
        Self { tx }
    }

    pub fn on_negotiation_payload(&self, payload: SignalPayload) {
        self.emit(PeerEvent::NegotiationPayload(payload));
    }

    pub fn on_remote_stream(&self, media: RemoteMedia) {
        self.emit(PeerEvent::RemoteStream(media));
    }

    pub fn on_connected(&self) {
        self.emit(PeerEvent::Connected);
    }

    pub fn on_error(&self, error: impl Into<String>) {
        self.emit(PeerEvent::Error(error.into()));
    }

    pub fn on_closed(&self) {
        self.emit(PeerEvent::Closed);
    }

    fn emit(&self, event: PeerEvent) {
        let _ = self.tx.send(event);
    }
}

/// Factory for peer connections (the negotiation library).
pub trait PeerBackend: Send + Sync {
    /// Open a connection. The initiator's connection starts producing its
    /// offer right away; the responder's waits for [`PeerLink::signal`].
    ///
    /// # Errors
    ///
    /// Returns `CallError::Negotiation` if the library cannot create the
    /// connection.
    fn open(&self, config: PeerConfig, events: PeerEventSink)
        -> Result<Box<dyn PeerLink>, CallError>;
}

/// One open connection inside the negotiation library.
pub trait PeerLink: Send {
    /// Feed a remote offer or answer in. Outcomes arrive as events.
    ///
    /// # Errors
    ///
    /// Returns `CallError::Negotiation` if the payload is rejected outright.
    fn signal(&mut self, payload: &SignalPayload) -> Result<(), CallError>;

    /// Release every resource held by the connection.
    fn close(&mut self);
}
