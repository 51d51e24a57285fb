/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - DUET Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use thiserror::Error;

/// Everything the coordinator can report. Nothing here ends the process:
/// media errors keep the call from starting, relay errors are retried by the
/// next poll tick, and upload/feedback errors are logged and skipped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    #[error("camera/microphone permission denied")]
    PermissionDenied,
    #[error("capture device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("relay unreachable: {0}")]
    RelayUnreachable(String),
    #[error("relay rejected request: {status} {body}")]
    RelayRejected { status: u16, body: String },
    #[error("relay returned malformed body: {0}")]
    RelayMalformed(String),

    #[error("ICE gathering did not complete within {0} ms")]
    NegotiationTimeout(u64),
    #[error("peer connection error: {0}")]
    Peer(String),

    #[error("audio upload failed: {0}")]
    UploadFailed(String),
    #[error("feedback submission failed: {0}")]
    SubmissionFailed(String),
    #[error("rating must be between 1 and 5, got {0}")]
    InvalidRating(u8),

    #[error("call already started")]
    AlreadyStarted,
    #[error("call has been disposed")]
    Disposed,
    #[error("call has not finished yet")]
    NotFinished,
}

impl From<reqwest::Error> for CallError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            return CallError::RelayMalformed(e.to_string());
        }
        match e.status() {
            Some(status) => CallError::RelayRejected {
                status: status.as_u16(),
                body: String::new(),
            },
            None => CallError::RelayUnreachable(e.to_string()),
        }
    }
}

impl From<webrtc::Error> for CallError {
    fn from(e: webrtc::Error) -> Self {
        CallError::Peer(e.to_string())
    }
}

pub type Result<T, E = CallError> = std::result::Result<T, E>;
