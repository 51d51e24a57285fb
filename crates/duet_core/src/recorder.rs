/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - DUET Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use bytes::Bytes;
use duet_protocol::{Role, SessionId};
use std::io::Cursor;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use webrtc::media::io::ogg_writer::OggWriter;
use webrtc::media::io::Writer;
use webrtc::rtp::header::Header;
use webrtc::rtp::packet::Packet;

use crate::error::CallError;
use crate::media::{MediaFrame, MediaHandle};
use crate::signaling::AudioUploader;

/// Container MIME type of the artifact produced by [`Recorder`].
pub const RECORDING_MIME_TYPE: &str = "audio/ogg";

const OPUS_CLOCK_RATE: u32 = 48_000;
const OPUS_CHANNELS: u8 = 1;

/// The flushed recording as an Ogg Opus stream, ready for upload.
#[derive(Debug, Clone)]
pub struct AudioArtifact {
    pub bytes: Bytes,
    pub mime_type: String,
    pub chunks: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReceipt {
    pub bytes: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    /// Nothing was being recorded (responder role, no audio track, or already stopped).
    NotRecorded,
    Uploaded(UploadReceipt),
    Failed(CallError),
}

enum RecState {
    Idle,
    Recording {
        stop: CancellationToken,
        collector: JoinHandle<Vec<MediaFrame>>,
    },
    Finished,
}

/// Buffers the requester's microphone and uploads it once on stop.
pub struct Recorder {
    session_id: SessionId,
    role: Role,
    uploader: Arc<dyn AudioUploader>,
    mime_type: String,
    state: Mutex<RecState>,
}

impl Recorder {
    pub fn new(session_id: SessionId, role: Role, uploader: Arc<dyn AudioUploader>, mime_type: String) -> Self {
        Self {
            session_id,
            role,
            uploader,
            mime_type,
            state: Mutex::new(RecState::Idle),
        }
    }

    pub fn is_recording(&self) -> bool {
        matches!(*self.lock(), RecState::Recording { .. })
    }

    /// Starts buffering the first audio track of `media`. Returns false when
    /// nothing is recorded; that is never an error for the call.
    pub fn start(&self, media: &MediaHandle) -> bool {
        if self.role != Role::Requester {
            return false;
        }
        let mut state = self.lock();
        if !matches!(*state, RecState::Idle) {
            return false;
        }
        let Some(track) = media.audio_track() else {
            warn!(session = %self.session_id, "no audio track to record; continuing without recording");
            return false;
        };
        if track.is_stopped() {
            warn!(session = %self.session_id, "audio track already stopped; continuing without recording");
            return false;
        }

        let mut frames = track.subscribe();
        let stop = CancellationToken::new();
        let stop_rx = stop.clone();
        let session = self.session_id.clone();
        let collector = tokio::spawn(async move {
            let mut chunks = Vec::new();
            loop {
                tokio::select! {
                    biased;
                    _ = stop_rx.cancelled() => break,
                    frame = frames.recv() => match frame {
                        Ok(f) if !f.data.is_empty() => chunks.push(f),
                        Ok(_) => {}
                        Err(RecvError::Lagged(n)) => warn!(session = %session, skipped = n, "recorder lagged"),
                        Err(RecvError::Closed) => break,
                    }
                }
            }
            while let Ok(f) = frames.try_recv() {
                if !f.data.is_empty() {
                    chunks.push(f);
                }
            }
            chunks
        });
        *state = RecState::Recording { stop, collector };
        info!(session = %self.session_id, track = track.id(), "recording started");
        true
    }

    /// Muxes the buffered frames into one Ogg artifact and uploads it. The
    /// upload is attempted at most once per recorder and runs on its own
    /// task, so a caller that stops waiting does not cancel it.
    pub async fn stop(&self) -> UploadOutcome {
        let prev = std::mem::replace(&mut *self.lock(), RecState::Finished);
        let RecState::Recording { stop, collector } = prev else {
            return UploadOutcome::NotRecorded;
        };
        stop.cancel();
        let chunks = collector.await.unwrap_or_default();
        let artifact = match assemble(&chunks, &self.mime_type) {
            Ok(a) => a,
            Err(e) => {
                warn!(session = %self.session_id, "recording could not be muxed: {e}");
                return UploadOutcome::Failed(e);
            }
        };
        info!(session = %self.session_id, bytes = artifact.bytes.len(), chunks = artifact.chunks, "recording stopped");

        let uploader = self.uploader.clone();
        let session = self.session_id.clone();
        let upload = tokio::spawn(async move {
            let size = artifact.bytes.len();
            match uploader.upload_audio(&session, artifact).await {
                Ok(receipt) => {
                    info!(session = %session, bytes = size, "recording uploaded");
                    UploadOutcome::Uploaded(receipt)
                }
                Err(e) => {
                    let e = match e {
                        CallError::UploadFailed(m) => CallError::UploadFailed(m),
                        other => CallError::UploadFailed(other.to_string()),
                    };
                    warn!(session = %session, "recording upload failed: {e}");
                    UploadOutcome::Failed(e)
                }
            }
        });
        upload
            .await
            .unwrap_or_else(|e| UploadOutcome::Failed(CallError::UploadFailed(e.to_string())))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RecState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn assemble(frames: &[MediaFrame], mime_type: &str) -> Result<AudioArtifact, CallError> {
    let mut buf = Vec::new();
    {
        let mut ogg = OggWriter::new(Cursor::new(&mut buf), OPUS_CLOCK_RATE, OPUS_CHANNELS).map_err(mux_error)?;
        let mut timestamp = 0u32;
        for (seq, frame) in frames.iter().enumerate() {
            let packet = Packet {
                header: Header {
                    version: 2,
                    sequence_number: seq as u16,
                    timestamp,
                    ..Default::default()
                },
                payload: frame.data.clone(),
            };
            ogg.write_rtp(&packet).map_err(mux_error)?;
            timestamp = timestamp.wrapping_add(opus_samples(frame.duration));
        }
        ogg.close().map_err(mux_error)?;
    }
    Ok(AudioArtifact {
        bytes: Bytes::from(buf),
        mime_type: mime_type.to_string(),
        chunks: frames.len(),
    })
}

fn opus_samples(d: Duration) -> u32 {
    (d.as_micros() * u128::from(OPUS_CLOCK_RATE) / 1_000_000) as u32
}

fn mux_error(e: webrtc::media::Error) -> CallError {
    CallError::UploadFailed(format!("ogg mux: {e}"))
}
