//! Wrapper around one negotiated media connection.
//!
//! The adapter owns the library's [`PeerLink`] and the receiving end of its
//! event sink, and enforces the event contract the session relies on:
//!
//! - remote stream: delivered at most once
//! - connected: delivered at most once
//! - error/closed: delivered at most once, nothing after it
//! - nothing at all after [`PeerConnectionAdapter::destroy`]

use super::{PeerBackend, PeerConfig, PeerEvent, PeerEventSink, PeerLink, RemoteMedia, Role};
use crate::errors::CallError;
use crate::media::TrackControls;
use common::{CallId, MediaKind, SignalPayload};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// One negotiated media connection.
pub struct PeerConnectionAdapter {
    call_id: CallId,
    role: Role,
    link: Option<Box<dyn PeerLink>>,
    events: mpsc::UnboundedReceiver<PeerEvent>,
    tracks: TrackControls,
    remote: Option<RemoteMedia>,
    connected: bool,
    terminated: bool,
    destroyed: bool,
}

impl PeerConnectionAdapter {
    /// Open a connection through the backend.
    ///
    /// # Errors
    ///
    /// Propagates the backend's error if the connection cannot be created.
    pub fn open(backend: &dyn PeerBackend, config: PeerConfig) -> Result<Self, CallError> {
        let (tx, events) = mpsc::unbounded_channel();
        let call_id = config.call_id;
        let role = config.role;
        let tracks = config.tracks.clone();

        let link = backend.open(config, PeerEventSink::new(tx))?;
        debug!(target: "call.peer", call_id = %call_id, role = %role, "Peer connection opened");

        Ok(Self {
            call_id,
            role,
            link: Some(link),
            events,
            tracks,
            remote: None,
            connected: false,
            terminated: false,
            destroyed: false,
        })
    }

    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Remote media, once it has arrived. Cleared by `destroy`.
    #[must_use]
    pub fn remote_media(&self) -> Option<&RemoteMedia> {
        self.remote.as_ref()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected && !self.destroyed
    }

    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Whether `next_event` can still yield anything.
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.destroyed && !self.terminated
    }

    /// Next event that passes the adapter's contract.
    ///
    /// Returns `None` once the adapter is destroyed or terminated and its
    /// events are drained. If the library drops its sink without reporting
    /// why, a single `Closed` is synthesized.
    pub async fn next_event(&mut self) -> Option<PeerEvent> {
        loop {
            if self.destroyed || self.terminated {
                return None;
            }

            let Some(event) = self.events.recv().await else {
                self.terminated = true;
                return Some(PeerEvent::Closed);
            };

            match &event {
                PeerEvent::RemoteStream(media) => {
                    if self.remote.is_some() {
                        debug!(target: "call.peer", call_id = %self.call_id, "Dropping repeated remote stream");
                        continue;
                    }
                    self.remote = Some(media.clone());
                }
                PeerEvent::Connected => {
                    if self.connected {
                        continue;
                    }
                    self.connected = true;
                }
                PeerEvent::NegotiationPayload(_) | PeerEvent::Error(_) | PeerEvent::Closed => {}
            }
            if event.is_terminal() {
                self.terminated = true;
            }
            return Some(event);
        }
    }

    /// Feed a remote offer or answer into the connection.
    ///
    /// # Errors
    ///
    /// Returns `CallError::SessionClosed` after `destroy`, or the library's
    /// negotiation error.
    pub fn signal(&mut self, payload: &SignalPayload) -> Result<(), CallError> {
        match self.link.as_mut() {
            Some(link) if !self.destroyed => link.signal(payload),
            _ => Err(CallError::SessionClosed),
        }
    }

    /// Enable or disable local tracks of `kind` without renegotiation.
    ///
    /// Returns the resulting enabled state; `false` if there is no such track
    /// or the adapter has been destroyed.
    pub fn set_track_enabled(&self, kind: MediaKind, enabled: bool) -> bool {
        if self.destroyed {
            return false;
        }
        self.tracks.set_enabled(kind, enabled)
    }

    /// Current enabled state of the local track of `kind`, if there is one.
    #[must_use]
    pub fn is_track_enabled(&self, kind: MediaKind) -> Option<bool> {
        if self.destroyed {
            return None;
        }
        self.tracks.is_enabled(kind)
    }

    /// Release the connection. Returns `true` only for the first call.
    pub fn destroy(&mut self) -> bool {
        if self.destroyed {
            return false;
        }
        self.destroyed = true;

        if let Some(mut link) = self.link.take() {
            link.close();
        }
        self.remote = None;
        self.events.close();

        debug!(target: "call.peer", call_id = %self.call_id, "Peer connection destroyed");
        true
    }
}

impl Drop for PeerConnectionAdapter {
    fn drop(&mut self) {
        if !self.destroyed {
            warn!(target: "call.peer", call_id = %self.call_id, "Peer adapter dropped without destroy");
            self.destroy();
        }
    }
}
