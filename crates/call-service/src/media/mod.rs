//! Local media handles.
//!
//! A [`LocalMedia`] is exclusively owned by one call session. The peer
//! adapter only gets a [`TrackControls`] view, which can toggle tracks but
//! never stop them. Stopping happens once, in session cleanup.
//!
//! Track state lives behind an `Arc` of atomics so that controls, probes and
//! the owning handle all observe the same track without locking.

use crate::errors::MediaError;
use async_trait::async_trait;
use common::MediaKind;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// What to ask the capture devices for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl MediaConstraints {
    /// Audio calls capture audio only; video calls capture both.
    #[must_use]
    pub const fn for_kind(kind: MediaKind) -> Self {
        match kind {
            MediaKind::Audio => Self {
                audio: true,
                video: false,
            },
            MediaKind::Video => Self {
                audio: true,
                video: true,
            },
        }
    }

    /// Track kinds these constraints request.
    #[must_use]
    pub fn kinds(&self) -> Vec<MediaKind> {
        let mut kinds = Vec::with_capacity(2);
        if self.audio {
            kinds.push(MediaKind::Audio);
        }
        if self.video {
            kinds.push(MediaKind::Video);
        }
        kinds
    }
}

/// Media acquisition capability (capture devices behind a permission prompt).
///
/// Acquisition is the only operation in a call flow that may wait on the
/// user or the OS.
#[async_trait]
pub trait MediaAcquirer: Send + Sync {
    /// Acquire local media matching the constraints.
    async fn acquire(&self, constraints: MediaConstraints) -> Result<LocalMedia, MediaError>;
}

#[derive(Debug, Default)]
struct TrackState {
    enabled: AtomicBool,
    stopped: AtomicBool,
    /// Number of times `stop` actually stopped the track (0 or 1).
    stops: AtomicUsize,
}

/// One captured track.
#[derive(Debug)]
pub struct LocalTrack {
    id: String,
    kind: MediaKind,
    state: Arc<TrackState>,
}

impl LocalTrack {
    /// A live, enabled track.
    #[must_use]
    pub fn new(id: impl Into<String>, kind: MediaKind) -> Self {
        Self {
            id: id.into(),
            kind,
            state: Arc::new(TrackState {
                enabled: AtomicBool::new(true),
                ..TrackState::default()
            }),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.state.enabled.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.state.stopped.load(Ordering::SeqCst)
    }

    /// Stop the track. Returns `true` only for the call that stopped it.
    fn stop(&self) -> bool {
        if self.state.stopped.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.state.enabled.store(false, Ordering::SeqCst);
        self.state.stops.fetch_add(1, Ordering::SeqCst);
        true
    }

    #[must_use]
    pub fn probe(&self) -> TrackProbe {
        TrackProbe {
            id: self.id.clone(),
            kind: self.kind,
            state: Arc::clone(&self.state),
        }
    }
}

/// The local media handle owned by a call session.
#[derive(Debug, Default)]
pub struct LocalMedia {
    tracks: Vec<LocalTrack>,
}

impl LocalMedia {
    #[must_use]
    pub fn new(tracks: Vec<LocalTrack>) -> Self {
        Self { tracks }
    }

    #[must_use]
    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }

    #[must_use]
    pub fn has_track(&self, kind: MediaKind) -> bool {
        self.tracks.iter().any(|t| t.kind == kind)
    }

    /// Stop every track and release the handle's devices.
    ///
    /// Safe to call repeatedly; returns how many tracks this call stopped.
    pub fn stop(&self) -> usize {
        self.tracks.iter().filter(|t| t.stop()).count()
    }

    /// Whether every track has been stopped.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.tracks.iter().all(LocalTrack::is_stopped)
    }

    /// Toggle-only view of the tracks.
    #[must_use]
    pub fn controls(&self) -> TrackControls {
        TrackControls {
            tracks: self
                .tracks
                .iter()
                .map(|t| (t.kind, Arc::clone(&t.state)))
                .collect(),
        }
    }

    #[must_use]
    pub fn probes(&self) -> Vec<TrackProbe> {
        self.tracks.iter().map(LocalTrack::probe).collect()
    }
}

/// Enable/disable access to local tracks without renegotiation.
#[derive(Debug, Clone, Default)]
pub struct TrackControls {
    tracks: Vec<(MediaKind, Arc<TrackState>)>,
}

impl TrackControls {
    fn live(&self, kind: MediaKind) -> impl Iterator<Item = &Arc<TrackState>> {
        self.tracks
            .iter()
            .filter(move |(k, s)| *k == kind && !s.stopped.load(Ordering::SeqCst))
            .map(|(_, s)| s)
    }

    /// Enable or disable every live track of `kind`.
    ///
    /// Returns the resulting enabled state, or `false` if there is no live
    /// track of that kind.
    pub fn set_enabled(&self, kind: MediaKind, enabled: bool) -> bool {
        let mut found = false;
        for state in self.live(kind) {
            state.enabled.store(enabled, Ordering::SeqCst);
            found = true;
        }
        found && enabled
    }

    /// Current enabled state of the first live track of `kind`.
    #[must_use]
    pub fn is_enabled(&self, kind: MediaKind) -> Option<bool> {
        self.live(kind)
            .next()
            .map(|s| s.enabled.load(Ordering::SeqCst))
    }
}

/// Read-only observer of a track, for diagnostics and tests.
#[derive(Debug, Clone)]
pub struct TrackProbe {
    id: String,
    kind: MediaKind,
    state: Arc<TrackState>,
}

impl TrackProbe {
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.state.enabled.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.state.stopped.load(Ordering::SeqCst)
    }

    /// How many times the track was actually stopped. Never more than 1.
    #[must_use]
    pub fn stop_count(&self) -> usize {
        self.state.stops.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    fn av_media() -> LocalMedia {
        LocalMedia::new(vec![
            LocalTrack::new("mic", MediaKind::Audio),
            LocalTrack::new("cam", MediaKind::Video),
        ])
    }

    #[test]
    fn test_constraints_for_kind() {
        assert_eq!(
            MediaConstraints::for_kind(MediaKind::Audio).kinds(),
            vec![MediaKind::Audio]
        );
        assert_eq!(
            MediaConstraints::for_kind(MediaKind::Video).kinds(),
            vec![MediaKind::Audio, MediaKind::Video]
        );
    }

    #[test]
    fn test_stop_is_exactly_once() {
        let media = av_media();
        let probes = media.probes();

        assert_eq!(media.stop(), 2);
        assert_eq!(media.stop(), 0);
        assert!(media.is_stopped());
        for probe in &probes {
            assert!(probe.is_stopped());
            assert!(!probe.is_enabled());
            assert_eq!(probe.stop_count(), 1);
        }
    }

    #[test]
    fn test_concurrent_stop_stops_once() {
        let media = Arc::new(av_media());
        let probes = media.probes();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let media = Arc::clone(&media);
                std::thread::spawn(move || media.stop())
            })
            .collect();
        let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();

        assert_eq!(total, 2);
        assert!(probes.iter().all(|p| p.stop_count() == 1));
    }

    #[test]
    fn test_controls_toggle_tracks() {
        let media = av_media();
        let controls = media.controls();
        let probes = media.probes();

        assert!(!controls.set_enabled(MediaKind::Video, false));
        assert!(!probes[1].is_enabled());
        assert!(probes[0].is_enabled(), "audio track untouched");

        assert!(controls.set_enabled(MediaKind::Video, true));
        assert_eq!(controls.is_enabled(MediaKind::Video), Some(true));
    }

    #[test]
    fn test_controls_without_track_return_false() {
        let media = LocalMedia::new(vec![LocalTrack::new("mic", MediaKind::Audio)]);
        let controls = media.controls();

        assert!(!controls.set_enabled(MediaKind::Video, true));
        assert_eq!(controls.is_enabled(MediaKind::Video), None);
    }

    #[test]
    fn test_controls_after_stop_return_false() {
        let media = av_media();
        let controls = media.controls();
        media.stop();

        assert!(!controls.set_enabled(MediaKind::Audio, true));
        assert_eq!(controls.is_enabled(MediaKind::Audio), None);
        assert!(!media.tracks()[0].is_enabled());
    }
}
