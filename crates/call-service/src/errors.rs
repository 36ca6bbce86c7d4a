//! Call service error types.
//!
//! Media and transport errors surface synchronously to callers of
//! `initiate`/`answer`. Negotiation and post-connection failures surface
//! asynchronously as an [`EndReason`](crate::actors::EndReason) on the
//! session-ended notification.

use common::{CallStatus, MediaKind, RecordError};
use thiserror::Error;

/// Call service error type.
#[derive(Debug, Error)]
pub enum CallError {
    /// Local media could not be acquired (permission denied or device missing).
    /// Recoverable by retrying; no call record exists when this is returned.
    #[error("Media access error: {0}")]
    MediaAccess(#[from] MediaError),

    /// Signaling store unreachable or rejected the operation.
    #[error("Signaling transport error: {0}")]
    Transport(String),

    /// The peer negotiation library reported a failure.
    #[error("Negotiation error: {0}")]
    Negotiation(String),

    /// Operation invoked on a session that has already been cleaned up.
    #[error("Session is closed")]
    SessionClosed,

    /// No record exists for the call id.
    #[error("Call not found: {0}")]
    CallNotFound(String),

    /// The call record is no longer in the ringing state.
    #[error("Call is not ringing (status: {0})")]
    CallNotRinging(CallStatus),

    /// The local user is not the party this operation requires.
    #[error("Not a participant: {0}")]
    NotParticipant(String),

    /// A live session already exists for this call id.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// A stored record could not be decoded.
    #[error("Malformed call record: {0}")]
    Record(#[from] RecordError),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Local media acquisition failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaError {
    /// The user or OS refused access to capture devices.
    #[error("permission denied")]
    PermissionDenied,

    /// No capture device of the requested kind is available.
    #[error("no {0} device available")]
    DeviceUnavailable(MediaKind),
}

impl CallError {
    /// Bounded label for metrics and session-ended reason codes.
    #[must_use]
    pub fn reason_code(&self) -> &'static str {
        match self {
            CallError::MediaAccess(_) => "media_access",
            CallError::Transport(_) => "transport",
            CallError::Negotiation(_) => "negotiation",
            CallError::SessionClosed => "session_closed",
            CallError::CallNotFound(_) => "not_found",
            CallError::CallNotRinging(_) => "not_ringing",
            CallError::NotParticipant(_) => "not_participant",
            CallError::Conflict(_) => "conflict",
            CallError::Record(_) => "malformed_record",
            CallError::Config(_) => "config",
            CallError::Internal(_) => "internal",
        }
    }

    /// Whether this error ends a running session when a signaling write
    /// fails with it. A record that vanished mid-call counts: the other side
    /// can no longer observe this one.
    #[must_use]
    pub fn is_session_ending(&self) -> bool {
        matches!(
            self,
            CallError::Transport(_)
                | CallError::Negotiation(_)
                | CallError::Record(_)
                | CallError::CallNotFound(_)
        )
    }
}
