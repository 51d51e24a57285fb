/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - DUET Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Offer/answer negotiation through the polling relay.
//!
//! The requester creates an offer, waits (bounded) for ICE gathering so the
//! posted description carries its candidates, posts it, then polls for the
//! answer. The responder polls for the offer and answers it. The relay only
//! ever carries complete descriptions; there is no candidate trickle.

use async_trait::async_trait;
use duet_protocol::{Role, SessionDescription, SessionId};
use serde::Serialize;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Timings;
use crate::error::{CallError, Result};
use crate::media::{MediaHandle, TrackKind};
use crate::poll::poll_until;
use crate::signaling::SignalingRelay;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl LinkState {
    pub fn is_connected(self) -> bool {
        self == LinkState::Connected
    }

    pub fn is_broken(self) -> bool {
        matches!(self, LinkState::Disconnected | LinkState::Failed | LinkState::Closed)
    }
}

/// Platform callbacks forwarded by a [`PeerLink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    State(LinkState),
    RemoteTrack(TrackKind),
}

/// The platform peer connection. Setting a local description is part of
/// `create_offer`/`create_answer`; it is never replaced afterwards.
#[async_trait]
pub trait PeerLink: Send + Sync {
    async fn attach_local_media(&self, media: &MediaHandle) -> Result<()>;
    async fn create_offer(&self) -> Result<SessionDescription>;
    async fn create_answer(&self) -> Result<SessionDescription>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;
    /// Resolves once ICE gathering for the current local description is done.
    async fn ice_gathering_complete(&self);
    async fn local_description(&self) -> Option<SessionDescription>;
    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait PeerLinkFactory: Send + Sync {
    async fn create(&self, events: mpsc::UnboundedSender<PeerEvent>) -> Result<Arc<dyn PeerLink>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    GatheringLocalOffer,
    AwaitingRemoteAnswer,
    AwaitingRemoteOffer,
    Answering,
    Connected,
    Terminated,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NegotiatorView {
    pub state: NegotiationState,
    pub link: LinkState,
    pub remote_stream_present: bool,
    pub connection_broken: bool,
    pub last_error: Option<CallError>,
}

impl Default for NegotiatorView {
    fn default() -> Self {
        Self {
            state: NegotiationState::Idle,
            link: LinkState::New,
            remote_stream_present: false,
            connection_broken: false,
            last_error: None,
        }
    }
}

pub struct PeerNegotiator {
    inner: Arc<Inner>,
}

struct Inner {
    session_id: SessionId,
    role: Role,
    relay: Arc<dyn SignalingRelay>,
    factory: Arc<dyn PeerLinkFactory>,
    timings: Timings,
    view: watch::Sender<NegotiatorView>,
    cancel: CancellationToken,
    started: AtomicBool,
    halted: AtomicBool,
    link: Mutex<Option<Arc<dyn PeerLink>>>,
}

impl PeerNegotiator {
    pub fn new(
        session_id: SessionId,
        role: Role,
        relay: Arc<dyn SignalingRelay>,
        factory: Arc<dyn PeerLinkFactory>,
        timings: Timings,
        parent: &CancellationToken,
    ) -> Self {
        let (view, _) = watch::channel(NegotiatorView::default());
        Self {
            inner: Arc::new(Inner {
                session_id,
                role,
                relay,
                factory,
                timings,
                view,
                cancel: parent.child_token(),
                started: AtomicBool::new(false),
                halted: AtomicBool::new(false),
                link: Mutex::new(None),
            }),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<NegotiatorView> {
        self.inner.view.subscribe()
    }

    pub fn view(&self) -> NegotiatorView {
        self.inner.view.borrow().clone()
    }

    /// Creates the peer link, attaches local media and starts the role's
    /// negotiation path in the background. Only the first call does anything.
    pub async fn start(&self, media: &MediaHandle) -> Result<()> {
        let inner = &self.inner;
        if inner.started.swap(true, Ordering::SeqCst) {
            return Err(CallError::AlreadyStarted);
        }
        if inner.is_halted() {
            return Err(CallError::Disposed);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let link = inner.factory.create(tx).await?;
        let stored = {
            let mut slot = inner.lock_link();
            if inner.is_halted() {
                false
            } else {
                *slot = Some(link.clone());
                true
            }
        };
        if !stored {
            let _ = link.close().await;
            return Err(CallError::Disposed);
        }
        if let Err(e) = link.attach_local_media(media).await {
            inner.fail(e.clone());
            return Err(e);
        }
        info!(session = %inner.session_id, role = %inner.role, "negotiation started");

        tokio::spawn(inner.clone().pump_events(rx));

        let path = inner.clone();
        tokio::spawn(async move {
            let cancel = path.cancel.clone();
            let run = async {
                match path.role {
                    Role::Requester => path.run_offerer(link).await,
                    Role::Responder => path.run_answerer(link).await,
                }
            };
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {}
                res = run => {
                    if let Err(e) = res {
                        if !path.is_halted() {
                            warn!(session = %path.session_id, "negotiation failed: {e}");
                            path.fail(e);
                        }
                    }
                }
            }
        });
        Ok(())
    }

    /// Stops all relay polling. Results still in flight are discarded.
    pub fn halt(&self) {
        let inner = &self.inner;
        if inner.halted.swap(true, Ordering::SeqCst) {
            return;
        }
        inner.cancel.cancel();
        inner.view.send_modify(|v| v.state = NegotiationState::Terminated);
        debug!(session = %inner.session_id, "negotiation halted");
    }

    /// Closes the peer link, once.
    pub async fn close(&self) {
        let link = self.inner.lock_link().take();
        if let Some(link) = link {
            if let Err(e) = link.close().await {
                warn!(session = %self.inner.session_id, "peer link close failed: {e}");
            }
            self.inner.view.send_modify(|v| v.link = LinkState::Closed);
            info!(session = %self.inner.session_id, "peer link closed");
        }
    }

    pub async fn dispose(&self) {
        self.halt();
        self.close().await;
    }
}

impl Inner {
    fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    fn lock_link(&self) -> std::sync::MutexGuard<'_, Option<Arc<dyn PeerLink>>> {
        self.link.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: NegotiationState) {
        if self.is_halted() {
            return;
        }
        debug!(session = %self.session_id, ?state, "negotiation state");
        self.view.send_modify(|v| v.state = state);
    }

    fn fail(&self, e: CallError) {
        self.view.send_modify(|v| {
            v.state = NegotiationState::Terminated;
            v.connection_broken = true;
            v.last_error = Some(e);
        });
    }

    async fn pump_events(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<PeerEvent>) {
        loop {
            let ev = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                ev = rx.recv() => ev,
            };
            let Some(ev) = ev else { break };
            if self.is_halted() {
                break;
            }
            match ev {
                PeerEvent::State(st) => {
                    info!(session = %self.session_id, ?st, "peer connection state");
                    self.view.send_modify(|v| {
                        v.link = st;
                        if st.is_connected() {
                            v.state = NegotiationState::Connected;
                            v.connection_broken = false;
                        } else if st.is_broken() {
                            v.state = NegotiationState::Terminated;
                            v.connection_broken = true;
                        }
                    });
                }
                PeerEvent::RemoteTrack(kind) => {
                    let first = !self.view.borrow().remote_stream_present;
                    if first {
                        info!(session = %self.session_id, ?kind, "remote stream attached");
                    }
                    self.view.send_modify(|v| v.remote_stream_present = true);
                }
            }
        }
    }

    async fn run_offerer(&self, link: Arc<dyn PeerLink>) -> Result<()> {
        self.set_state(NegotiationState::GatheringLocalOffer);
        let offer = link.create_offer().await?;
        let offer = self.gathered(&link, offer).await;

        self.post_until_accepted("post-offer", offer, |relay, id, desc| async move {
            relay.post_offer(&id, &desc).await
        })
        .await;
        if self.is_halted() {
            return Ok(());
        }

        self.set_state(NegotiationState::AwaitingRemoteAnswer);
        let Some(answer) = self.poll_signaling("await-answer", |doc| doc.answer).await else {
            return Ok(());
        };
        if self.is_halted() {
            return Ok(());
        }
        link.set_remote_description(answer).await?;
        info!(session = %self.session_id, "remote answer applied");
        self.set_state(NegotiationState::Connected);
        Ok(())
    }

    async fn run_answerer(&self, link: Arc<dyn PeerLink>) -> Result<()> {
        self.set_state(NegotiationState::AwaitingRemoteOffer);
        let Some(offer) = self.poll_signaling("await-offer", |doc| doc.offer).await else {
            return Ok(());
        };
        if self.is_halted() {
            return Ok(());
        }
        link.set_remote_description(offer).await?;
        info!(session = %self.session_id, "remote offer applied");

        let answer = link.create_answer().await?;
        let answer = self.gathered(&link, answer).await;
        self.set_state(NegotiationState::Answering);

        self.post_until_accepted("post-answer", answer, |relay, id, desc| async move {
            relay.post_answer(&id, &desc).await
        })
        .await;
        if self.is_halted() {
            return Ok(());
        }
        self.set_state(NegotiationState::Connected);
        Ok(())
    }

    /// Waits for ICE gathering up to the configured bound, then returns the
    /// link's current local description. A timeout is not an error: the
    /// partial description is still usable.
    async fn gathered(&self, link: &Arc<dyn PeerLink>, fallback: SessionDescription) -> SessionDescription {
        let limit = self.timings.ice_gathering_timeout;
        if tokio::time::timeout(limit, link.ice_gathering_complete()).await.is_err() {
            let e = CallError::NegotiationTimeout(limit.as_millis() as u64);
            warn!(session = %self.session_id, "{e}; posting partial description");
        }
        link.local_description().await.unwrap_or(fallback)
    }

    /// Posts a description, retrying on each poll tick until the relay takes
    /// it. A 409 means an earlier attempt already landed.
    async fn post_until_accepted<F, Fut>(&self, label: &'static str, desc: SessionDescription, post: F)
    where
        F: Fn(Arc<dyn SignalingRelay>, SessionId, SessionDescription) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        let relay = self.relay.clone();
        let session = self.session_id.clone();
        let post = Arc::new(post);
        let handle = poll_until(label, self.timings.signaling_poll, &self.cancel, move || {
            let (relay, session, desc, post) = (relay.clone(), session.clone(), desc.clone(), post.clone());
            async move {
                match post(relay, session.clone(), desc).await {
                    Ok(()) => ControlFlow::Break(()),
                    Err(CallError::RelayRejected { status: 409, .. }) => {
                        info!(session = %session, poll = label, "relay already holds this description");
                        ControlFlow::Break(())
                    }
                    Err(e) => {
                        warn!(session = %session, poll = label, "relay post failed, will retry: {e}");
                        ControlFlow::Continue(())
                    }
                }
            }
        });
        handle.finished().await;
    }

    /// Polls the signaling document until `pick` finds the awaited
    /// description. Returns `None` when halted first.
    async fn poll_signaling(
        &self,
        label: &'static str,
        pick: fn(duet_protocol::SignalingDocument) -> Option<SessionDescription>,
    ) -> Option<SessionDescription> {
        let relay = self.relay.clone();
        let session = self.session_id.clone();
        let handle = poll_until(label, self.timings.signaling_poll, &self.cancel, move || {
            let (relay, session) = (relay.clone(), session.clone());
            async move {
                match relay.get_signaling(&session).await {
                    Ok(doc) => match pick(doc) {
                        Some(desc) => ControlFlow::Break(desc),
                        None => ControlFlow::Continue(()),
                    },
                    Err(e) => {
                        warn!(session = %session, poll = label, "signaling poll failed: {e}");
                        ControlFlow::Continue(())
                    }
                }
            }
        });
        handle.finished().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use crate::media::{MediaConstraints, MediaSession};
    use crate::testing::{FakeCapture, FakePeerFactory, FakeRelay};

    fn timings() -> Timings {
        Timings::default()
    }

    async fn handle() -> MediaHandle {
        let media = MediaSession::new(Arc::new(FakeCapture::default()));
        media.acquire(MediaConstraints::audio_video()).await.unwrap()
    }

    fn negotiator(role: Role, relay: &Arc<FakeRelay>, peers: &Arc<FakePeerFactory>) -> PeerNegotiator {
        PeerNegotiator::new("77".into(), role, relay.clone(), peers.clone(), timings(), &CancellationToken::new())
    }

    #[tokio::test(start_paused = true)]
    async fn requester_offers_then_applies_answer() {
        let relay = Arc::new(FakeRelay::default());
        let peers = Arc::new(FakePeerFactory::default());
        let neg = negotiator(Role::Requester, &relay, &peers);
        neg.start(&handle().await).await.unwrap();

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(neg.view().state, NegotiationState::AwaitingRemoteAnswer);
        assert_eq!(relay.offers_posted(), 1);

        relay.put_answer(SessionDescription::answer("remote-answer"));
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(neg.view().state, NegotiationState::Connected);
        let link = peers.link(0);
        assert_eq!(link.remote().unwrap().sdp, "remote-answer");

        let polls = relay.signaling_reads();
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(relay.signaling_reads(), polls, "polling must stop once the answer is found");
        assert_eq!(relay.offers_posted(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn responder_answers_the_polled_offer_once() {
        let relay = Arc::new(FakeRelay::default());
        let peers = Arc::new(FakePeerFactory::default());
        let neg = negotiator(Role::Responder, &relay, &peers);
        neg.start(&handle().await).await.unwrap();

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(neg.view().state, NegotiationState::AwaitingRemoteOffer);
        assert_eq!(relay.answers_posted(), 0);

        relay.put_offer(SessionDescription::offer("remote-offer"));
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(neg.view().state, NegotiationState::Connected);
        assert_eq!(relay.answers_posted(), 1);
        assert_eq!(peers.link(0).remote().unwrap().sdp, "remote-offer");
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(relay.answers_posted(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_ice_gathering_is_bounded() {
        let relay = Arc::new(FakeRelay::default());
        let peers = Arc::new(FakePeerFactory::with_gathering(None));
        let neg = negotiator(Role::Requester, &relay, &peers);
        neg.start(&handle().await).await.unwrap();

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(relay.offers_posted(), 0);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(relay.offers_posted(), 1);
        assert_eq!(neg.view().state, NegotiationState::AwaitingRemoteAnswer);
    }

    #[tokio::test(start_paused = true)]
    async fn relay_outage_is_retried_by_the_next_tick() {
        let relay = Arc::new(FakeRelay::default());
        relay.set_unreachable(true);
        let peers = Arc::new(FakePeerFactory::default());
        let neg = negotiator(Role::Requester, &relay, &peers);
        neg.start(&handle().await).await.unwrap();

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(relay.offers_posted(), 0);
        relay.set_unreachable(false);
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(relay.offers_posted(), 1);
        assert!(neg.view().last_error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn second_start_is_refused() {
        let relay = Arc::new(FakeRelay::default());
        let peers = Arc::new(FakePeerFactory::default());
        let neg = negotiator(Role::Requester, &relay, &peers);
        let media = handle().await;
        neg.start(&media).await.unwrap();
        assert_eq!(neg.start(&media).await.unwrap_err(), CallError::AlreadyStarted);
        assert_eq!(peers.created(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dispose_discards_late_answer_and_closes_once() {
        let relay = Arc::new(FakeRelay::default());
        let peers = Arc::new(FakePeerFactory::default());
        let neg = negotiator(Role::Requester, &relay, &peers);
        neg.start(&handle().await).await.unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;

        relay.set_read_delay(Duration::from_secs(3));
        tokio::time::sleep(Duration::from_secs(2)).await;
        relay.put_answer(SessionDescription::answer("late"));
        neg.dispose().await;
        neg.dispose().await;
        let reads = relay.signaling_reads();
        tokio::time::sleep(Duration::from_secs(20)).await;

        let link = peers.link(0);
        assert!(link.remote().is_none());
        assert_eq!(link.close_count(), 1);
        assert_eq!(relay.signaling_reads(), reads);
        assert_eq!(neg.view().state, NegotiationState::Terminated);
    }

    #[tokio::test(start_paused = true)]
    async fn connection_events_drive_view() {
        let relay = Arc::new(FakeRelay::default());
        let peers = Arc::new(FakePeerFactory::default());
        let neg = negotiator(Role::Responder, &relay, &peers);
        neg.start(&handle().await).await.unwrap();
        let link = peers.link(0);

        link.emit(PeerEvent::RemoteTrack(TrackKind::Video));
        link.emit(PeerEvent::State(LinkState::Connected));
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        let v = neg.view();
        assert!(v.remote_stream_present);
        assert_eq!(v.state, NegotiationState::Connected);

        link.emit(PeerEvent::State(LinkState::Failed));
        tokio::time::sleep(Duration::from_millis(10)).await;
        let v = neg.view();
        assert_eq!(v.state, NegotiationState::Terminated);
        assert!(v.connection_broken);
        assert!(v.remote_stream_present);
    }

    #[tokio::test(start_paused = true)]
    async fn two_parties_meet_through_the_relay() {
        let relay = Arc::new(FakeRelay::default());
        let peers = Arc::new(FakePeerFactory::with_gathering(Some(Duration::from_millis(800))));
        let requester = negotiator(Role::Requester, &relay, &peers);
        let responder = negotiator(Role::Responder, &relay, &peers);

        requester.start(&handle().await).await.unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(relay.offers_posted(), 1);

        let online_at = tokio::time::Instant::now();
        responder.start(&handle().await).await.unwrap();
        let mut rx = requester.subscribe();
        rx.wait_for(|v| v.state == NegotiationState::Connected).await.unwrap();
        let waited = online_at.elapsed();
        assert!(waited <= Duration::from_secs(4), "took {waited:?}");

        assert_eq!(responder.view().state, NegotiationState::Connected);
        assert_eq!(relay.offers_posted(), 1);
        assert_eq!(relay.answers_posted(), 1);
        let offer_sdp = peers.link(0).local().unwrap().sdp;
        assert_eq!(peers.link(1).remote().unwrap().sdp, offer_sdp);
    }
}
