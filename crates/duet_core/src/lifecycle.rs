/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - DUET Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! The call state machine for either role.
//!
//! Three things can end a call: the countdown reaching zero, the metadata
//! poll seeing the session ended server-side, and a local hangup/dispose.
//! They race freely; the `terminating` flag makes the first one win and the
//! rest no-ops. Connection loss never ends the call on its own.

use chrono::{DateTime, Utc};
use duet_protocol::{Role, SessionId, SessionInfo};
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{CoordinatorConfig, Timings};
use crate::error::{CallError, Result};
use crate::feedback::FeedbackCollector;
use crate::media::{CaptureDevice, MediaConstraints, MediaHandle, MediaSession};
use crate::negotiator::{LinkState, NegotiationState, PeerLinkFactory, PeerNegotiator};
use crate::poll::{poll_until, PollHandle};
use crate::recorder::{Recorder, UploadOutcome};
use crate::signaling::{AudioUploader, FeedbackSink, SessionDirectory, SignalingClient, SignalingRelay};
use crate::view::{now_ms_u64, waiting_text, CallPhase, CallView, EndReason};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Everything the lifecycle talks to.
#[derive(Clone)]
pub struct CallDeps {
    pub capture: Arc<dyn CaptureDevice>,
    pub peers: Arc<dyn PeerLinkFactory>,
    pub relay: Arc<dyn SignalingRelay>,
    pub directory: Arc<dyn SessionDirectory>,
    pub uploader: Arc<dyn AudioUploader>,
    pub feedback: Arc<dyn FeedbackSink>,
    pub clock: Arc<dyn Clock>,
}

impl CallDeps {
    /// Wires every backend seam to one HTTP client.
    pub fn over_http(client: Arc<SignalingClient>, capture: Arc<dyn CaptureDevice>, peers: Arc<dyn PeerLinkFactory>) -> Self {
        Self {
            capture,
            peers,
            relay: client.clone(),
            directory: client.clone(),
            uploader: client.clone(),
            feedback: client,
            clock: Arc::new(SystemClock),
        }
    }
}

#[derive(Clone, Debug)]
pub struct CallOptions {
    pub timings: Timings,
    pub recording_mime_type: String,
    pub auto_approve: bool,
}

impl CallOptions {
    pub fn from_config(cfg: &CoordinatorConfig) -> Self {
        Self {
            timings: cfg.timings(),
            recording_mime_type: cfg.recording_mime_type(),
            auto_approve: cfg.auto_approve(),
        }
    }
}

impl Default for CallOptions {
    fn default() -> Self {
        Self::from_config(&CoordinatorConfig::default())
    }
}

#[derive(Clone)]
pub struct SessionLifecycle {
    inner: Arc<Inner>,
}

struct Inner {
    deps: CallDeps,
    opts: CallOptions,
    view: watch::Sender<CallView>,
    root: CancellationToken,
    started: AtomicBool,
    terminating: AtomicBool,
    media: MediaSession,
    ctx: Mutex<Option<(SessionId, Role)>>,
    negotiator: Mutex<Option<Arc<PeerNegotiator>>>,
    recorder: Mutex<Option<Arc<Recorder>>>,
    metadata_poll: Mutex<Option<PollHandle<()>>>,
    approve_poll: Mutex<Option<PollHandle<()>>>,
    countdown: Mutex<Option<Countdown>>,
    upload: Mutex<Option<UploadOutcome>>,
}

struct Countdown {
    remaining: Arc<AtomicU64>,
    task: JoinHandle<()>,
}

impl Drop for Countdown {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl SessionLifecycle {
    pub fn new(deps: CallDeps, opts: CallOptions) -> Self {
        let (view, _) = watch::channel(CallView::new());
        let media = MediaSession::new(deps.capture.clone());
        Self {
            inner: Arc::new(Inner {
                deps,
                opts,
                view,
                root: CancellationToken::new(),
                started: AtomicBool::new(false),
                terminating: AtomicBool::new(false),
                media,
                ctx: Mutex::new(None),
                negotiator: Mutex::new(None),
                recorder: Mutex::new(None),
                metadata_poll: Mutex::new(None),
                approve_poll: Mutex::new(None),
                countdown: Mutex::new(None),
                upload: Mutex::new(None),
            }),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<CallView> {
        self.inner.view.subscribe()
    }

    pub fn snapshot(&self) -> CallView {
        self.inner.view.borrow().clone()
    }

    pub fn media(&self) -> Option<MediaHandle> {
        self.inner.media.current()
    }

    /// The recorder's result once teardown has waited for it.
    pub fn upload_outcome(&self) -> Option<UploadOutcome> {
        lock(&self.inner.upload).clone()
    }

    /// Fetches metadata, acquires media, then starts negotiation, recording
    /// and the background polls. Media failures leave the call in
    /// `Initializing` with the error published.
    pub async fn start(&self, session_id: SessionId, role: Role) -> Result<()> {
        let inner = &self.inner;
        if inner.started.swap(true, Ordering::SeqCst) {
            return Err(CallError::AlreadyStarted);
        }
        if inner.is_terminating() {
            return Err(CallError::Disposed);
        }
        *lock(&inner.ctx) = Some((session_id.clone(), role));
        info!(session = %session_id, role = %role, "call starting");

        let initial = match inner.deps.directory.get_session(&session_id).await {
            Ok(info) => Some(info),
            Err(e) => {
                warn!(session = %session_id, "session metadata unavailable, will keep polling: {e}");
                None
            }
        };
        if inner.is_terminating() {
            return Err(CallError::Disposed);
        }

        let handle = match inner.media.acquire(MediaConstraints::audio_video()).await {
            Ok(h) => h,
            Err(e) => {
                if !inner.is_terminating() {
                    warn!(session = %session_id, "media acquisition failed: {e}");
                    inner.publish(|v| v.error = Some(e.clone()));
                }
                return Err(e);
            }
        };
        inner.publish(|v| {
            v.muted = !handle.audio_enabled();
            v.video_on = handle.video_enabled();
            v.phase = CallPhase::Negotiating;
        });

        let negotiator = Arc::new(PeerNegotiator::new(
            session_id.clone(),
            role,
            inner.deps.relay.clone(),
            inner.deps.peers.clone(),
            inner.opts.timings,
            &inner.root,
        ));
        {
            let mut slot = lock(&inner.negotiator);
            if inner.is_terminating() {
                return Err(CallError::Disposed);
            }
            *slot = Some(negotiator.clone());
        }
        tokio::spawn(inner.clone().follow_negotiator(negotiator.subscribe()));
        if let Err(e) = negotiator.start(&handle).await {
            if e != CallError::Disposed {
                warn!(session = %session_id, "negotiation could not start: {e}");
                inner.publish(|v| v.error = Some(e));
            }
        }

        if role == Role::Requester {
            let recorder = Arc::new(Recorder::new(
                session_id.clone(),
                role,
                inner.deps.uploader.clone(),
                inner.opts.recording_mime_type.clone(),
            ));
            let mut slot = lock(&inner.recorder);
            if !inner.is_terminating() {
                recorder.start(&handle);
                *slot = Some(recorder);
            }
        }

        let approved = initial.as_ref().map(|i| i.approved_by_responder).unwrap_or(false);
        if role == Role::Responder && inner.opts.auto_approve && !approved {
            inner.start_approval(&session_id);
        }
        if let Some(info) = initial {
            inner.apply_metadata(&info);
        }
        inner.start_metadata_poll(&session_id);
        Ok(())
    }

    /// Returns the new muted state, or `None` when no media is live.
    pub fn toggle_mute(&self) -> Option<bool> {
        if self.inner.is_terminating() {
            return None;
        }
        let on = self.inner.media.toggle_audio()?;
        self.inner.publish(|v| v.muted = !on);
        Some(!on)
    }

    /// Returns the new video state, or `None` when no media is live.
    pub fn toggle_video(&self) -> Option<bool> {
        if self.inner.is_terminating() {
            return None;
        }
        let on = self.inner.media.toggle_video()?;
        self.inner.publish(|v| v.video_on = on);
        Some(on)
    }

    pub async fn hangup(&self) {
        self.inner.clone().teardown(EndReason::LocalHangup).await;
    }

    pub async fn dispose(&self) {
        self.inner.clone().teardown(EndReason::Disposed).await;
    }

    /// Resolves with the final view once teardown completed.
    pub async fn wait_finished(&self) -> CallView {
        let mut rx = self.subscribe();
        let done = rx.wait_for(|v| v.phase.is_finished()).await.map(|v| v.clone());
        match done {
            Ok(v) => v,
            Err(_) => self.snapshot(),
        }
    }

    pub async fn submit_feedback(&self, rating: u8, comment: &str) -> Result<()> {
        if self.snapshot().phase != CallPhase::CollectingFeedback {
            return Err(CallError::NotFinished);
        }
        let Some((session_id, role)) = lock(&self.inner.ctx).clone() else {
            return Err(CallError::NotFinished);
        };
        FeedbackCollector::new(session_id, role, self.inner.deps.feedback.clone())
            .submit(rating, comment)
            .await
    }
}

impl Inner {
    fn is_terminating(&self) -> bool {
        self.terminating.load(Ordering::SeqCst)
    }

    fn role(&self) -> Role {
        lock(&self.ctx).as_ref().map(|(_, r)| *r).unwrap_or(Role::Requester)
    }

    /// Applies `f` and refreshes derived fields. Dropped once teardown began.
    fn publish(&self, f: impl FnOnce(&mut CallView)) {
        if self.is_terminating() {
            return;
        }
        self.publish_unchecked(f);
    }

    fn publish_unchecked(&self, f: impl FnOnce(&mut CallView)) {
        let role = self.role();
        self.view.send_modify(|v| {
            f(v);
            v.waiting_text = waiting_text(role, v.phase, v.remote_stream_present, v.connection_state);
            v.ts_ms = now_ms_u64();
        });
    }

    async fn follow_negotiator(self: Arc<Self>, mut rx: watch::Receiver<crate::negotiator::NegotiatorView>) {
        loop {
            tokio::select! {
                biased;
                _ = self.root.cancelled() => break,
                changed = rx.changed() => if changed.is_err() { break },
            }
            let nv = rx.borrow_and_update().clone();
            self.publish(|v| {
                v.connection_state = nv.link;
                v.remote_stream_present = nv.remote_stream_present;
                if nv.state == NegotiationState::Connected && v.phase == CallPhase::Negotiating {
                    v.phase = CallPhase::InCall;
                }
                if let Some(e) = nv.last_error {
                    v.error = Some(e);
                }
            });
        }
    }

    fn start_approval(self: &Arc<Self>, session_id: &SessionId) {
        let relay = self.deps.relay.clone();
        let session = session_id.clone();
        let handle = poll_until("approve", self.opts.timings.signaling_poll, &self.root, move || {
            let (relay, session) = (relay.clone(), session.clone());
            async move {
                match relay.approve(&session).await {
                    Ok(()) => {
                        info!(session = %session, "session approved");
                        ControlFlow::Break(())
                    }
                    Err(e) => {
                        warn!(session = %session, "approval failed, will retry: {e}");
                        ControlFlow::Continue(())
                    }
                }
            }
        });
        *lock(&self.approve_poll) = Some(handle);
    }

    fn start_metadata_poll(self: &Arc<Self>, session_id: &SessionId) {
        let directory = self.deps.directory.clone();
        let session = session_id.clone();
        let me = Arc::downgrade(self);
        let handle = poll_until("metadata", self.opts.timings.metadata_poll, &self.root, move || {
            let (directory, session, me) = (directory.clone(), session.clone(), me.clone());
            async move {
                let info = match directory.get_session(&session).await {
                    Ok(info) => info,
                    Err(e) => {
                        debug!(session = %session, "metadata poll failed: {e}");
                        return ControlFlow::Continue(());
                    }
                };
                let Some(me) = me.upgrade() else {
                    return ControlFlow::Break(());
                };
                if me.apply_metadata(&info) {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            }
        });
        let mut slot = lock(&self.metadata_poll);
        if !self.is_terminating() {
            *slot = Some(handle);
        }
    }

    /// Folds fresh session metadata into the call. Returns true when it ended
    /// the call.
    fn apply_metadata(self: &Arc<Self>, info: &SessionInfo) -> bool {
        if self.is_terminating() {
            return true;
        }
        let now = self.deps.clock.now();
        if info.ended_at.is_some_and(|end| end <= now) {
            info!(session = %info.id, "session ended server-side");
            tokio::spawn(self.clone().teardown(EndReason::RemoteEnded));
            return true;
        }
        if info.approved_by_responder {
            lock(&self.approve_poll).take();
        }
        if let Some((_, end)) = info.window() {
            let ms = (end - now).num_milliseconds().max(0) as u64;
            self.arm_countdown(ms.div_ceil(1000));
        }
        false
    }

    /// Starts the countdown, or lowers it. It never grows back.
    fn arm_countdown(self: &Arc<Self>, secs: u64) {
        let mut slot = lock(&self.countdown);
        if self.is_terminating() {
            return;
        }
        if let Some(c) = slot.as_ref() {
            let prev = c.remaining.fetch_min(secs, Ordering::SeqCst);
            if secs < prev {
                debug!(from = prev, to = secs, "countdown shortened");
                self.publish(|v| v.remaining_seconds = Some(secs));
            }
            return;
        }
        info!(remaining = secs, "countdown started");
        let remaining = Arc::new(AtomicU64::new(secs));
        self.publish(|v| v.remaining_seconds = Some(secs));
        let task = tokio::spawn(self.clone().run_countdown(remaining.clone()));
        *slot = Some(Countdown { remaining, task });
    }

    async fn run_countdown(self: Arc<Self>, remaining: Arc<AtomicU64>) {
        let every = self.opts.timings.countdown_tick;
        let mut tick = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            if remaining.load(Ordering::SeqCst) == 0 {
                break;
            }
            tokio::select! {
                biased;
                _ = self.root.cancelled() => return,
                _ = tick.tick() => {}
            }
            if self.is_terminating() {
                return;
            }
            let left = remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |r| Some(r.saturating_sub(1)))
                .unwrap_or(0)
                .saturating_sub(1);
            self.publish(|v| v.remaining_seconds = Some(left));
        }
        info!("call time is up");
        // Teardown cancels this task, so it runs on its own.
        tokio::spawn(self.clone().teardown(EndReason::TimedOut));
    }

    /// Runs once, whatever triggered it: stop polls, stop the recorder
    /// (bounded), release media, close the link.
    async fn teardown(self: Arc<Self>, reason: EndReason) {
        if self
            .terminating
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let phase = match reason {
            EndReason::LocalHangup | EndReason::Disposed => CallPhase::EndingLocal,
            EndReason::RemoteEnded => CallPhase::EndingRemote,
            EndReason::TimedOut => CallPhase::TimedOut,
        };
        let session = lock(&self.ctx).as_ref().map(|(id, _)| id.to_string()).unwrap_or_default();
        info!(session = %session, ?reason, "call ending");
        self.publish_unchecked(|v| {
            v.phase = phase;
            v.end_reason = Some(reason);
            if reason == EndReason::TimedOut {
                v.remaining_seconds = Some(0);
            }
        });

        self.root.cancel();
        lock(&self.metadata_poll).take();
        lock(&self.approve_poll).take();
        lock(&self.countdown).take();
        let negotiator = lock(&self.negotiator).clone();
        if let Some(n) = &negotiator {
            n.halt();
        }

        let recorder = lock(&self.recorder).take();
        if let Some(rec) = recorder {
            let limit = self.opts.timings.recorder_stop_timeout;
            match tokio::time::timeout(limit, rec.stop()).await {
                Ok(outcome) => *lock(&self.upload) = Some(outcome),
                Err(_) => warn!(session = %session, "recording upload still pending after {limit:?}; continuing teardown"),
            }
        }

        let had_media = self.media.release();

        if let Some(n) = negotiator {
            n.close().await;
        }

        self.publish_unchecked(|v| {
            v.phase = CallPhase::Terminated;
            v.connection_state = LinkState::Closed;
        });
        if had_media {
            self.publish_unchecked(|v| v.phase = CallPhase::CollectingFeedback);
        }
        info!(session = %session, had_media, "call torn down");
    }
}
