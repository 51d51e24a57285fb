/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - DUET Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! In-memory stand-ins for the platform and backend, driven on tokio's
//! virtual clock.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use duet_protocol::{FeedbackRequest, SessionDescription, SessionId, SessionInfo, SignalingDocument};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::error::{CallError, Result};
use crate::lifecycle::Clock;
use crate::media::{CaptureDevice, MediaConstraints, Track, TrackKind};
use crate::negotiator::{LinkState, PeerEvent, PeerLink, PeerLinkFactory};
use crate::recorder::{AudioArtifact, UploadReceipt};
use crate::signaling::{AudioUploader, FeedbackSink, SessionDirectory, SignalingRelay};

pub fn t0() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2026-03-01T10:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

/// Wall clock that starts at [`t0`] and advances with tokio's (paused) time.
pub struct TestClock {
    base: DateTime<Utc>,
    origin: tokio::time::Instant,
}

impl TestClock {
    pub fn new() -> Self {
        Self {
            base: t0(),
            origin: tokio::time::Instant::now(),
        }
    }
}

impl Clock for TestClock {
    fn now(&self) -> DateTime<Utc> {
        self.base + chrono::Duration::from_std(self.origin.elapsed()).unwrap()
    }
}

pub struct FakeCapture {
    audio: Option<bool>,
    video: Option<bool>,
    deny: bool,
    delay: Duration,
    opens: AtomicU32,
    opened: Mutex<Vec<Arc<Track>>>,
}

impl Default for FakeCapture {
    fn default() -> Self {
        Self::with_tracks(true, true)
    }
}

impl FakeCapture {
    pub fn with_tracks(audio_enabled: bool, video_enabled: bool) -> Self {
        Self {
            audio: Some(audio_enabled),
            video: Some(video_enabled),
            deny: false,
            delay: Duration::ZERO,
            opens: AtomicU32::new(0),
            opened: Mutex::new(Vec::new()),
        }
    }

    pub fn denied() -> Self {
        Self {
            deny: true,
            ..Self::default()
        }
    }

    pub fn video_only() -> Self {
        Self {
            audio: None,
            ..Self::default()
        }
    }

    /// Simulates a permission prompt that stays open for `delay`.
    pub fn delayed(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn open_count(&self) -> u32 {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn opened(&self) -> Vec<Arc<Track>> {
        self.opened.lock().unwrap().clone()
    }
}

#[async_trait]
impl CaptureDevice for FakeCapture {
    async fn open(&self, constraints: MediaConstraints) -> Result<Vec<Arc<Track>>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.deny {
            return Err(CallError::PermissionDenied);
        }
        let mut tracks = Vec::new();
        if let (true, Some(on)) = (constraints.audio, self.audio) {
            tracks.push(Track::new("fake-audio", TrackKind::Audio, on));
        }
        if let (true, Some(on)) = (constraints.video, self.video) {
            tracks.push(Track::new("fake-video", TrackKind::Video, on));
        }
        self.opened.lock().unwrap().extend(tracks.iter().cloned());
        Ok(tracks)
    }
}

#[derive(Default)]
struct RelayState {
    doc: SignalingDocument,
    session: Option<SessionInfo>,
    unreachable: bool,
    read_delay: Duration,
    upload_delay: Duration,
    fail_uploads: bool,
    uploads: Vec<(SessionId, AudioArtifact)>,
    feedback: Vec<FeedbackRequest>,
    offers_posted: usize,
    answers_posted: usize,
    signaling_reads: usize,
    session_reads: usize,
    approvals: usize,
    upload_attempts: usize,
    feedback_attempts: usize,
}

/// One in-memory backend: relay, session directory, upload and feedback.
#[derive(Default)]
pub struct FakeRelay {
    state: Mutex<RelayState>,
}

impl FakeRelay {
    fn with<R>(&self, f: impl FnOnce(&mut RelayState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    fn reachable(&self) -> Result<()> {
        if self.with(|s| s.unreachable) {
            return Err(CallError::RelayUnreachable("connection refused".into()));
        }
        Ok(())
    }

    pub fn put_offer(&self, d: SessionDescription) {
        self.with(|s| s.doc.offer = Some(d));
    }

    pub fn put_answer(&self, d: SessionDescription) {
        self.with(|s| s.doc.answer = Some(d));
    }

    pub fn set_session(&self, info: SessionInfo) {
        self.with(|s| s.session = Some(info));
    }

    /// Sets `started_at`/`ended_at` together, as the backend does on approval.
    pub fn set_window(&self, started_at: DateTime<Utc>, ended_at: DateTime<Utc>) {
        self.with(|s| {
            let info = s.session.get_or_insert_with(|| default_session());
            info.started_at = Some(started_at);
            info.ended_at = Some(ended_at);
            s.doc.started_at = Some(started_at);
            s.doc.ended_at = Some(ended_at);
        });
    }

    pub fn set_unreachable(&self, v: bool) {
        self.with(|s| s.unreachable = v);
    }

    pub fn set_read_delay(&self, d: Duration) {
        self.with(|s| s.read_delay = d);
    }

    pub fn set_upload_delay(&self, d: Duration) {
        self.with(|s| s.upload_delay = d);
    }

    pub fn fail_uploads(&self, v: bool) {
        self.with(|s| s.fail_uploads = v);
    }

    pub fn uploads(&self) -> Vec<(SessionId, AudioArtifact)> {
        self.with(|s| s.uploads.clone())
    }

    pub fn upload_attempts(&self) -> usize {
        self.with(|s| s.upload_attempts)
    }

    pub fn feedback(&self) -> Vec<FeedbackRequest> {
        self.with(|s| s.feedback.clone())
    }

    pub fn feedback_attempts(&self) -> usize {
        self.with(|s| s.feedback_attempts)
    }

    pub fn offers_posted(&self) -> usize {
        self.with(|s| s.offers_posted)
    }

    pub fn answers_posted(&self) -> usize {
        self.with(|s| s.answers_posted)
    }

    pub fn signaling_reads(&self) -> usize {
        self.with(|s| s.signaling_reads)
    }

    pub fn session_reads(&self) -> usize {
        self.with(|s| s.session_reads)
    }

    pub fn approvals(&self) -> usize {
        self.with(|s| s.approvals)
    }

    pub fn doc(&self) -> SignalingDocument {
        self.with(|s| s.doc.clone())
    }
}

fn default_session() -> SessionInfo {
    SessionInfo {
        id: SessionId::from("77"),
        scheduled_at: t0(),
        started_at: None,
        ended_at: None,
        approved_by_responder: false,
    }
}

#[async_trait]
impl SignalingRelay for FakeRelay {
    async fn post_offer(&self, _session: &SessionId, offer: &SessionDescription) -> Result<()> {
        self.reachable()?;
        self.with(|s| {
            if s.doc.offer.is_some() {
                return Err(CallError::RelayRejected {
                    status: 409,
                    body: "offer exists".into(),
                });
            }
            s.doc.offer = Some(offer.clone());
            s.offers_posted += 1;
            Ok(())
        })
    }

    async fn post_answer(&self, _session: &SessionId, answer: &SessionDescription) -> Result<()> {
        self.reachable()?;
        self.with(|s| {
            if s.doc.answer.is_some() {
                return Err(CallError::RelayRejected {
                    status: 409,
                    body: "answer exists".into(),
                });
            }
            s.doc.answer = Some(answer.clone());
            s.answers_posted += 1;
            Ok(())
        })
    }

    async fn get_signaling(&self, _session: &SessionId) -> Result<SignalingDocument> {
        let delay = self.with(|s| {
            s.signaling_reads += 1;
            s.read_delay
        });
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.reachable()?;
        Ok(self.doc())
    }

    async fn approve(&self, _session: &SessionId) -> Result<()> {
        self.reachable()?;
        self.with(|s| {
            s.approvals += 1;
            s.doc.approved_by_responder = true;
            s.session.get_or_insert_with(default_session).approved_by_responder = true;
        });
        Ok(())
    }
}

#[async_trait]
impl SessionDirectory for FakeRelay {
    async fn get_session(&self, _session: &SessionId) -> Result<SessionInfo> {
        self.with(|s| s.session_reads += 1);
        self.reachable()?;
        Ok(self.with(|s| s.session.clone().unwrap_or_else(default_session)))
    }
}

#[async_trait]
impl AudioUploader for FakeRelay {
    async fn upload_audio(&self, session: &SessionId, artifact: AudioArtifact) -> Result<UploadReceipt> {
        let delay = self.with(|s| {
            s.upload_attempts += 1;
            s.upload_delay
        });
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.with(|s| s.fail_uploads) {
            return Err(CallError::UploadFailed("413 payload too large".into()));
        }
        let bytes = artifact.bytes.len();
        self.with(|s| s.uploads.push((session.clone(), artifact)));
        Ok(UploadReceipt { bytes })
    }
}

#[async_trait]
impl FeedbackSink for FakeRelay {
    async fn submit_feedback(&self, feedback: &FeedbackRequest) -> Result<()> {
        self.with(|s| s.feedback_attempts += 1);
        self.reachable()?;
        self.with(|s| s.feedback.push(feedback.clone()));
        Ok(())
    }
}

pub struct FakePeerLink {
    index: usize,
    gathering: Option<Duration>,
    events: mpsc::UnboundedSender<PeerEvent>,
    local: Mutex<Option<SessionDescription>>,
    remote: Mutex<Option<SessionDescription>>,
    attached: AtomicUsize,
    closes: AtomicU32,
}

impl FakePeerLink {
    pub fn emit(&self, ev: PeerEvent) {
        let _ = self.events.send(ev);
    }

    pub fn local(&self) -> Option<SessionDescription> {
        self.local.lock().unwrap().clone()
    }

    pub fn remote(&self) -> Option<SessionDescription> {
        self.remote.lock().unwrap().clone()
    }

    pub fn attached_tracks(&self) -> usize {
        self.attached.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> u32 {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerLink for FakePeerLink {
    async fn attach_local_media(&self, media: &crate::media::MediaHandle) -> Result<()> {
        self.attached.fetch_add(media.tracks().len(), Ordering::SeqCst);
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = SessionDescription::offer(format!("v=0 fake-offer-{}", self.index));
        *self.local.lock().unwrap() = Some(offer.clone());
        Ok(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        if self.remote().is_none() {
            return Err(CallError::Peer("no remote offer".into()));
        }
        let answer = SessionDescription::answer(format!("v=0 fake-answer-{}", self.index));
        *self.local.lock().unwrap() = Some(answer.clone());
        Ok(answer)
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        *self.remote.lock().unwrap() = Some(desc);
        Ok(())
    }

    async fn ice_gathering_complete(&self) {
        match self.gathering {
            Some(d) => tokio::time::sleep(d).await,
            None => std::future::pending::<()>().await,
        }
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.local()
    }

    async fn close(&self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.emit(PeerEvent::State(LinkState::Closed));
        Ok(())
    }
}

pub struct FakePeerFactory {
    gathering: Option<Duration>,
    links: Mutex<Vec<Arc<FakePeerLink>>>,
}

impl Default for FakePeerFactory {
    fn default() -> Self {
        Self::with_gathering(Some(Duration::from_millis(100)))
    }
}

impl FakePeerFactory {
    /// `None` means ICE gathering never completes.
    pub fn with_gathering(gathering: Option<Duration>) -> Self {
        Self {
            gathering,
            links: Mutex::new(Vec::new()),
        }
    }

    pub fn created(&self) -> usize {
        self.links.lock().unwrap().len()
    }

    pub fn link(&self, i: usize) -> Arc<FakePeerLink> {
        self.links.lock().unwrap()[i].clone()
    }
}

#[async_trait]
impl PeerLinkFactory for FakePeerFactory {
    async fn create(&self, events: mpsc::UnboundedSender<PeerEvent>) -> Result<Arc<dyn PeerLink>> {
        let mut links = self.links.lock().unwrap();
        let link = Arc::new(FakePeerLink {
            index: links.len(),
            gathering: self.gathering,
            events,
            local: Mutex::new(None),
            remote: Mutex::new(None),
            attached: AtomicUsize::new(0),
            closes: AtomicU32::new(0),
        });
        links.push(link.clone());
        Ok(link)
    }
}
