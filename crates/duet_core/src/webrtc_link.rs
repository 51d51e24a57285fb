/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - DUET Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! webrtc-rs backed [`PeerLink`].

use async_trait::async_trait;
use duet_protocol::{SdpKind, SessionDescription};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::config::CoordinatorConfig;
use crate::error::{CallError, Result};
use crate::media::{MediaHandle, Track, TrackKind};
use crate::negotiator::{LinkState, PeerEvent, PeerLink, PeerLinkFactory};

pub struct WebrtcPeerLinkFactory {
    ice_servers: Vec<RTCIceServer>,
}

impl WebrtcPeerLinkFactory {
    pub fn new(ice_servers: Vec<RTCIceServer>) -> Self {
        Self { ice_servers }
    }

    pub fn from_config(cfg: &CoordinatorConfig) -> Self {
        Self::new(build_ice_servers(cfg))
    }
}

fn build_ice_servers(cfg: &CoordinatorConfig) -> Vec<RTCIceServer> {
    let urls = cfg.ice_urls();
    if urls.is_empty() {
        return Vec::new();
    }
    vec![RTCIceServer {
        urls,
        username: cfg.ice_username.clone().unwrap_or_default(),
        credential: cfg.ice_credential.clone().unwrap_or_default(),
        ..Default::default()
    }]
}

#[async_trait]
impl PeerLinkFactory for WebrtcPeerLinkFactory {
    async fn create(&self, events: mpsc::UnboundedSender<PeerEvent>) -> Result<Arc<dyn PeerLink>> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        let pc = Arc::new(
            api.new_peer_connection(RTCConfiguration {
                ice_servers: self.ice_servers.clone(),
                ..Default::default()
            })
            .await?,
        );

        let state_tx = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
            let _ = state_tx.send(PeerEvent::State(link_state(st)));
            Box::pin(async {})
        }));
        let track_tx = events;
        pc.on_track(Box::new(move |track: Arc<TrackRemote>, _: Arc<RTCRtpReceiver>, _: Arc<RTCRtpTransceiver>| {
            let kind = match track.kind() {
                RTPCodecType::Video => TrackKind::Video,
                _ => TrackKind::Audio,
            };
            let _ = track_tx.send(PeerEvent::RemoteTrack(kind));
            Box::pin(async {})
        }));

        debug!(servers = self.ice_servers.len(), "peer connection created");
        Ok(Arc::new(WebrtcPeerLink {
            pc,
            gathering: Mutex::new(None),
            pumps: CancellationToken::new(),
        }))
    }
}

fn link_state(st: RTCPeerConnectionState) -> LinkState {
    match st {
        RTCPeerConnectionState::Connecting => LinkState::Connecting,
        RTCPeerConnectionState::Connected => LinkState::Connected,
        RTCPeerConnectionState::Disconnected => LinkState::Disconnected,
        RTCPeerConnectionState::Failed => LinkState::Failed,
        RTCPeerConnectionState::Closed => LinkState::Closed,
        _ => LinkState::New,
    }
}

pub struct WebrtcPeerLink {
    pc: Arc<RTCPeerConnection>,
    gathering: Mutex<Option<mpsc::Receiver<()>>>,
    pumps: CancellationToken,
}

impl WebrtcPeerLink {
    /// Arms the gathering promise before applying the local description so
    /// the completion signal cannot be missed.
    async fn apply_local(&self, desc: RTCSessionDescription) -> Result<SessionDescription> {
        let done = self.pc.gathering_complete_promise().await;
        *self.gathering.lock().await = Some(done);
        self.pc.set_local_description(desc.clone()).await?;
        to_wire(&desc)
    }

    fn spawn_sample_pump(&self, track: Arc<Track>, local: Arc<TrackLocalStaticSample>) {
        let mut frames = track.subscribe();
        let cancel = self.pumps.clone();
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = cancel.cancelled() => break,
                    f = frames.recv() => f,
                };
                match frame {
                    Ok(f) => {
                        let sample = Sample {
                            data: f.data,
                            duration: f.duration,
                            ..Default::default()
                        };
                        if let Err(e) = local.write_sample(&sample).await {
                            debug!(track = track.id(), "write_sample failed: {e}");
                        }
                    }
                    Err(RecvError::Lagged(n)) => debug!(track = track.id(), skipped = n, "sample pump lagged"),
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }
}

fn to_wire(desc: &RTCSessionDescription) -> Result<SessionDescription> {
    match desc.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(desc.sdp.clone())),
        RTCSdpType::Answer => Ok(SessionDescription::answer(desc.sdp.clone())),
        RTCSdpType::Pranswer => Ok(SessionDescription {
            kind: SdpKind::Pranswer,
            sdp: desc.sdp.clone(),
        }),
        other => Err(CallError::Peer(format!("unsupported local description type {other}"))),
    }
}

fn from_wire(desc: SessionDescription) -> Result<RTCSessionDescription> {
    let out = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp)?,
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp)?,
        SdpKind::Pranswer => RTCSessionDescription::pranswer(desc.sdp)?,
        SdpKind::Rollback => return Err(CallError::Peer("rollback descriptions are not supported".to_string())),
    };
    Ok(out)
}

#[async_trait]
impl PeerLink for WebrtcPeerLink {
    async fn attach_local_media(&self, media: &MediaHandle) -> Result<()> {
        for track in media.tracks() {
            let mime = match track.kind() {
                TrackKind::Audio => MIME_TYPE_OPUS,
                TrackKind::Video => MIME_TYPE_VP8,
            };
            let local = Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: mime.to_owned(),
                    ..Default::default()
                },
                track.id().to_string(),
                "duet-local".to_string(),
            ));
            let sender = self
                .pc
                .add_track(Arc::clone(&local) as Arc<dyn TrackLocal + Send + Sync>)
                .await?;
            // RTCP must be drained for the interceptors to work.
            let cancel = self.pumps.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        r = sender.read_rtcp() => if r.is_err() { break },
                    }
                }
            });
            self.spawn_sample_pump(track.clone(), local);
            info!(track = track.id(), kind = ?track.kind(), "local track attached");
        }
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self.pc.create_offer(None).await?;
        self.apply_local(offer).await
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self.pc.create_answer(None).await?;
        self.apply_local(answer).await
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc.set_remote_description(from_wire(desc)?).await?;
        Ok(())
    }

    async fn ice_gathering_complete(&self) {
        let mut guard = self.gathering.lock().await;
        if let Some(done) = guard.as_mut() {
            let _ = done.recv().await;
        }
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        let desc = self.pc.local_description().await?;
        to_wire(&desc).ok()
    }

    async fn close(&self) -> Result<()> {
        self.pumps.cancel();
        if let Err(e) = self.pc.close().await {
            warn!("peer connection close failed: {e}");
            return Err(e.into());
        }
        Ok(())
    }
}
