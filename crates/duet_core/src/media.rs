/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - DUET Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Local camera/microphone capture.
//!
//! A [`CaptureDevice`] produces [`Track`]s; the [`MediaSession`] owns the
//! resulting [`MediaHandle`] and is the only thing allowed to stop tracks.
//! The peer link and the recorder only subscribe to track frames.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::error::{CallError, Result};

const FRAME_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

/// One encoded media frame as produced by the capture device.
#[derive(Debug, Clone)]
pub struct MediaFrame {
    pub data: Bytes,
    pub duration: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl MediaConstraints {
    pub fn audio_video() -> Self {
        Self { audio: true, video: true }
    }
}

/// A single capture track. Disabled tracks drop frames at the source, so
/// muting takes effect for every consumer, not just the UI.
pub struct Track {
    id: String,
    kind: TrackKind,
    enabled: AtomicBool,
    stopped: AtomicBool,
    stop_count: AtomicU32,
    frames: broadcast::Sender<MediaFrame>,
}

impl Track {
    pub fn new(id: impl Into<String>, kind: TrackKind, enabled: bool) -> Arc<Self> {
        let (frames, _) = broadcast::channel(FRAME_BUFFER);
        Arc::new(Self {
            id: id.into(),
            kind,
            enabled: AtomicBool::new(enabled),
            stopped: AtomicBool::new(false),
            stop_count: AtomicU32::new(0),
            frames,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Number of times the track was actually stopped (0 or 1).
    pub fn stop_count(&self) -> u32 {
        self.stop_count.load(Ordering::SeqCst)
    }

    /// Called by the capture device. Returns false when the frame was dropped.
    pub fn push(&self, frame: MediaFrame) -> bool {
        if self.is_stopped() || !self.is_enabled() {
            return false;
        }
        self.frames.send(frame).is_ok()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MediaFrame> {
        self.frames.subscribe()
    }

    fn toggle(&self) {
        self.enabled.fetch_xor(true, Ordering::SeqCst);
    }

    fn stop(&self) -> bool {
        if self
            .stopped
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        self.stop_count.fetch_add(1, Ordering::SeqCst);
        true
    }
}

impl std::fmt::Debug for Track {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Track")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("enabled", &self.is_enabled())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// Read-only view of the acquired tracks. Cheap to clone.
#[derive(Clone, Debug)]
pub struct MediaHandle {
    tracks: Arc<[Arc<Track>]>,
}

impl MediaHandle {
    pub fn new(tracks: Vec<Arc<Track>>) -> Self {
        Self { tracks: tracks.into() }
    }

    pub fn tracks(&self) -> &[Arc<Track>] {
        &self.tracks
    }

    pub fn tracks_of(&self, kind: TrackKind) -> impl Iterator<Item = &Arc<Track>> {
        self.tracks.iter().filter(move |t| t.kind() == kind)
    }

    pub fn audio_track(&self) -> Option<Arc<Track>> {
        self.tracks_of(TrackKind::Audio).next().cloned()
    }

    pub fn audio_enabled(&self) -> bool {
        self.tracks_of(TrackKind::Audio).any(|t| t.is_enabled())
    }

    pub fn video_enabled(&self) -> bool {
        self.tracks_of(TrackKind::Video).any(|t| t.is_enabled())
    }
}

/// Platform capture. Implementations map their own failures onto
/// `PermissionDenied` / `DeviceUnavailable`.
#[async_trait]
pub trait CaptureDevice: Send + Sync {
    async fn open(&self, constraints: MediaConstraints) -> Result<Vec<Arc<Track>>>;
}

pub struct MediaSession {
    device: Arc<dyn CaptureDevice>,
    handle: Mutex<Option<MediaHandle>>,
    released: AtomicBool,
}

impl MediaSession {
    pub fn new(device: Arc<dyn CaptureDevice>) -> Self {
        Self {
            device,
            handle: Mutex::new(None),
            released: AtomicBool::new(false),
        }
    }

    /// Opens the capture device. A session holds at most one handle; calling
    /// this again returns the live one. After `release` it refuses.
    pub async fn acquire(&self, constraints: MediaConstraints) -> Result<MediaHandle> {
        if let Some(h) = self.current() {
            return Ok(h);
        }
        if self.released.load(Ordering::SeqCst) {
            return Err(CallError::Disposed);
        }
        let tracks = self.device.open(constraints).await?;
        if tracks.is_empty() {
            return Err(CallError::DeviceUnavailable("no tracks produced".to_string()));
        }
        let handle = MediaHandle::new(tracks);
        let mut guard = self.lock();
        if self.released.load(Ordering::SeqCst) {
            // Released while the device prompt was open.
            drop(guard);
            for t in handle.tracks() {
                t.stop();
            }
            return Err(CallError::Disposed);
        }
        if let Some(existing) = guard.as_ref() {
            let existing = existing.clone();
            drop(guard);
            for t in handle.tracks() {
                t.stop();
            }
            return Ok(existing);
        }
        *guard = Some(handle.clone());
        info!(
            tracks = handle.tracks().len(),
            audio = handle.audio_enabled(),
            video = handle.video_enabled(),
            "local media acquired"
        );
        Ok(handle)
    }

    pub fn current(&self) -> Option<MediaHandle> {
        self.lock().clone()
    }

    /// Flips every audio track. Returns the new `audio_enabled`, or `None`
    /// when no media is held.
    pub fn toggle_audio(&self) -> Option<bool> {
        let guard = self.lock();
        let handle = guard.as_ref()?;
        for t in handle.tracks_of(TrackKind::Audio) {
            t.toggle();
        }
        let on = handle.audio_enabled();
        debug!(audio = on, "audio toggled");
        Some(on)
    }

    pub fn toggle_video(&self) -> Option<bool> {
        let guard = self.lock();
        let handle = guard.as_ref()?;
        for t in handle.tracks_of(TrackKind::Video) {
            t.toggle();
        }
        let on = handle.video_enabled();
        debug!(video = on, "video toggled");
        Some(on)
    }

    /// Stops all tracks. Safe to call any number of times.
    pub fn release(&self) -> bool {
        self.released.store(true, Ordering::SeqCst);
        let Some(handle) = self.lock().take() else {
            return false;
        };
        let stopped = handle.tracks().iter().filter(|t| t.stop()).count();
        info!(stopped, "local media released");
        true
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<MediaHandle>> {
        self.handle.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Headless test-pattern capture: Opus silence every 20 ms on the audio
/// track, and a video track that carries no frames.
pub struct SyntheticCapture;

/// A complete Opus packet that decodes to 20 ms of silence.
pub const OPUS_SILENCE_FRAME: [u8; 3] = [0xf8, 0xff, 0xfe];

#[async_trait]
impl CaptureDevice for SyntheticCapture {
    async fn open(&self, constraints: MediaConstraints) -> Result<Vec<Arc<Track>>> {
        if !constraints.audio && !constraints.video {
            return Err(CallError::DeviceUnavailable("no media kinds requested".to_string()));
        }
        let mut tracks = Vec::new();
        if constraints.audio {
            let audio = Track::new("synthetic-audio", TrackKind::Audio, true);
            let weak = Arc::downgrade(&audio);
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(Duration::from_millis(20));
                loop {
                    tick.tick().await;
                    let Some(track) = weak.upgrade() else { break };
                    if track.is_stopped() {
                        break;
                    }
                    track.push(MediaFrame {
                        data: Bytes::from_static(&OPUS_SILENCE_FRAME),
                        duration: Duration::from_millis(20),
                    });
                }
            });
            tracks.push(audio);
        }
        if constraints.video {
            tracks.push(Track::new("synthetic-video", TrackKind::Video, true));
        }
        Ok(tracks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeCapture;

    #[tokio::test]
    async fn flags_follow_actual_track_state() {
        let device = Arc::new(FakeCapture::with_tracks(false, true));
        let media = MediaSession::new(device);
        let h = media.acquire(MediaConstraints::audio_video()).await.unwrap();
        assert!(!h.audio_enabled());
        assert!(h.video_enabled());
    }

    #[tokio::test]
    async fn double_toggle_restores_and_tracks_match() {
        let media = MediaSession::new(Arc::new(FakeCapture::default()));
        let h = media.acquire(MediaConstraints::audio_video()).await.unwrap();
        let audio = h.audio_track().unwrap();
        let before = h.audio_enabled();

        let after_one = media.toggle_audio().unwrap();
        assert_eq!(after_one, !before);
        assert_eq!(audio.is_enabled(), after_one);

        let after_two = media.toggle_audio().unwrap();
        assert_eq!(after_two, before);
        assert_eq!(audio.is_enabled(), after_two);
    }

    #[tokio::test]
    async fn muted_track_drops_frames() {
        let media = MediaSession::new(Arc::new(FakeCapture::default()));
        let h = media.acquire(MediaConstraints::audio_video()).await.unwrap();
        let audio = h.audio_track().unwrap();
        let mut rx = audio.subscribe();
        media.toggle_audio();
        assert!(!audio.push(MediaFrame { data: Bytes::from_static(b"x"), duration: Duration::from_millis(20) }));
        media.toggle_audio();
        assert!(audio.push(MediaFrame { data: Bytes::from_static(b"y"), duration: Duration::from_millis(20) }));
        assert_eq!(rx.recv().await.unwrap().data, Bytes::from_static(b"y"));
    }

    #[tokio::test]
    async fn release_is_idempotent_and_stops_once() {
        let media = MediaSession::new(Arc::new(FakeCapture::default()));
        let h = media.acquire(MediaConstraints::audio_video()).await.unwrap();
        assert!(media.release());
        assert!(!media.release());
        assert!(!media.release());
        for t in h.tracks() {
            assert!(t.is_stopped());
            assert_eq!(t.stop_count(), 1);
        }
        assert!(media.toggle_audio().is_none());
        assert_eq!(media.acquire(MediaConstraints::audio_video()).await.unwrap_err(), CallError::Disposed);
    }

    #[tokio::test]
    async fn denied_permission_surfaces() {
        let media = MediaSession::new(Arc::new(FakeCapture::denied()));
        let err = media.acquire(MediaConstraints::audio_video()).await.unwrap_err();
        assert_eq!(err, CallError::PermissionDenied);
        assert!(media.current().is_none());
    }
}
