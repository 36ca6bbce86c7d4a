//! Mock capture devices.
//!
//! # Example
//!
//! ```rust,ignore
//! use call_test_utils::MockMediaAcquirer;
//!
//! let media = MockMediaAcquirer::granting();
//! // ... run a call ...
//! assert!(media.all_stopped());
//! ```

use async_trait::async_trait;
use call_service::errors::MediaError;
use call_service::media::{LocalMedia, LocalTrack, MediaAcquirer, MediaConstraints, TrackProbe};
use common::MediaKind;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// How the mock answers acquisition requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaMode {
    /// Hand out one live track per requested kind.
    Grant,
    /// Fail with `PermissionDenied`.
    Deny,
    /// Fail with `DeviceUnavailable` for the video device if video was
    /// requested, else for the microphone.
    Unavailable,
}

/// Mock media acquirer that records every track it hands out.
#[derive(Debug)]
pub struct MockMediaAcquirer {
    mode: Mutex<MediaMode>,
    call_count: AtomicUsize,
    issued: Mutex<Vec<TrackProbe>>,
}

impl MockMediaAcquirer {
    #[must_use]
    pub fn new(mode: MediaMode) -> Self {
        Self {
            mode: Mutex::new(mode),
            call_count: AtomicUsize::new(0),
            issued: Mutex::new(Vec::new()),
        }
    }

    /// Create a mock that grants every request.
    #[must_use]
    pub fn granting() -> Self {
        Self::new(MediaMode::Grant)
    }

    /// Create a mock whose permission prompt is always refused.
    #[must_use]
    pub fn denying() -> Self {
        Self::new(MediaMode::Deny)
    }

    /// Create a mock with no capture devices.
    #[must_use]
    pub fn unavailable() -> Self {
        Self::new(MediaMode::Unavailable)
    }

    /// Change the behaviour for subsequent requests.
    pub fn set_mode(&self, mode: MediaMode) {
        *self.mode.lock().unwrap() = mode;
    }

    /// Number of acquisition requests.
    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    /// Probes for every track handed out so far.
    pub fn issued_tracks(&self) -> Vec<TrackProbe> {
        self.issued.lock().unwrap().clone()
    }

    /// Whether every track handed out so far has been stopped.
    pub fn all_stopped(&self) -> bool {
        self.issued.lock().unwrap().iter().all(TrackProbe::is_stopped)
    }
}

impl Default for MockMediaAcquirer {
    fn default() -> Self {
        Self::granting()
    }
}

#[async_trait]
impl MediaAcquirer for MockMediaAcquirer {
    async fn acquire(&self, constraints: MediaConstraints) -> Result<LocalMedia, MediaError> {
        let n = self.call_count.fetch_add(1, Ordering::SeqCst) + 1;
        let mode = *self.mode.lock().unwrap();

        match mode {
            MediaMode::Deny => Err(MediaError::PermissionDenied),
            MediaMode::Unavailable => Err(MediaError::DeviceUnavailable(if constraints.video {
                MediaKind::Video
            } else {
                MediaKind::Audio
            })),
            MediaMode::Grant => {
                let tracks: Vec<LocalTrack> = constraints
                    .kinds()
                    .into_iter()
                    .map(|kind| LocalTrack::new(format!("{kind}-{n}"), kind))
                    .collect();
                self.issued
                    .lock()
                    .unwrap()
                    .extend(tracks.iter().map(LocalTrack::probe));
                Ok(LocalMedia::new(tracks))
            }
        }
    }
}
