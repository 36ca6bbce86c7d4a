//! Message types for session actor communication.
//!
//! Handles talk to their actor over `tokio::sync::mpsc`; request-reply uses
//! `tokio::sync::oneshot`. Session updates for the application go out on the
//! [`CallEvents`](super::CallEvents) broadcast.

use super::state::CallState;
use crate::errors::CallError;
use crate::media::TrackProbe;
use crate::peer::{RemoteMedia, Role};
use chrono::{DateTime, Utc};
use common::{CallId, CallRecord, MediaKind, RecordField, SignalPayload};
use serde::Serialize;
use std::fmt;
use tokio::sync::{broadcast, oneshot};

/// Messages sent to a `CallSessionActor`.
#[derive(Debug)]
pub enum SessionMessage {
    /// Local hang-up.
    HangUp {
        respond_to: oneshot::Sender<Result<(), CallError>>,
    },

    /// Flip the enabled state of the local track of `kind`.
    ToggleTrack {
        kind: MediaKind,
        /// Resulting enabled state (`false` if there is no such track).
        respond_to: oneshot::Sender<bool>,
    },

    /// Get a snapshot of the session.
    GetSnapshot {
        respond_to: oneshot::Sender<SessionSnapshot>,
    },
}

/// Inputs from the session's signaling subscriptions.
#[derive(Debug, Clone)]
pub enum SignalInput {
    /// The other side's offer (responder) or answer (initiator).
    RemotePayload(SignalPayload),
    /// The record after a status write.
    Status(CallRecord),
    /// The change feed behind a subscription closed; nothing more will be
    /// observed from the other side.
    FeedLost(RecordField),
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    LocalHangUp,
    RemoteEnded,
    RemoteDeclined,
    TimedOut,
    NegotiationFailed,
    PeerClosed,
    TransportFailed,
    Shutdown,
}

impl EndReason {
    /// Bounded reason code, used as a metric label.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            EndReason::LocalHangUp => "local_hang_up",
            EndReason::RemoteEnded => "remote_ended",
            EndReason::RemoteDeclined => "remote_declined",
            EndReason::TimedOut => "timed_out",
            EndReason::NegotiationFailed => "negotiation_failed",
            EndReason::PeerClosed => "peer_closed",
            EndReason::TransportFailed => "transport_failed",
            EndReason::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of one local track.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrackStatus {
    pub id: String,
    pub kind: MediaKind,
    pub enabled: bool,
    pub stopped: bool,
}

impl From<&TrackProbe> for TrackStatus {
    fn from(probe: &TrackProbe) -> Self {
        Self {
            id: probe.id().to_string(),
            kind: probe.kind(),
            enabled: probe.is_enabled(),
            stopped: probe.is_stopped(),
        }
    }
}

/// Point-in-time view of a session, for the application and diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub call_id: CallId,
    pub role: Role,
    pub state: CallState,
    pub remote_media: Option<RemoteMedia>,
    pub local_tracks: Vec<TrackStatus>,
    pub started_at: DateTime<Utc>,
    pub end_reason: Option<EndReason>,
}

/// Update published to the application.
#[derive(Debug, Clone)]
pub struct SessionUpdate {
    pub call_id: CallId,
    pub kind: UpdateKind,
}

#[derive(Debug, Clone)]
pub enum UpdateKind {
    /// The local state machine moved.
    StateChanged { from: CallState, to: CallState },
    /// The shared record's status was observed, whether or not it moved the
    /// local state machine.
    RecordStatus(CallRecord),
    /// The remote party's media arrived.
    RemoteStream(RemoteMedia),
    /// The session reached a terminal state and released its resources.
    Ended { state: CallState, reason: EndReason },
}

/// Buffer for the session update broadcast.
pub const EVENTS_BUFFER: usize = 256;

/// Fan-out of session updates to the application.
///
/// Receivers that fall behind lose the oldest updates (`RecvError::Lagged`);
/// sessions never block on slow observers.
#[derive(Debug, Clone)]
pub struct CallEvents {
    tx: broadcast::Sender<SessionUpdate>,
}

impl CallEvents {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENTS_BUFFER);
        Self { tx }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionUpdate> {
        self.tx.subscribe()
    }

    /// Publish an update. Having no subscribers is not an error.
    pub fn publish(&self, call_id: CallId, kind: UpdateKind) {
        let _ = self.tx.send(SessionUpdate { call_id, kind });
    }
}

impl Default for CallEvents {
    fn default() -> Self {
        Self::new()
    }
}
