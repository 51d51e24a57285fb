/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - DUET Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use duet_protocol::Role;
use serde::{Serialize, Serializer};

use crate::error::CallError;
use crate::negotiator::LinkState;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum CallPhase {
    Initializing,
    Negotiating,
    InCall,
    EndingLocal,
    EndingRemote,
    TimedOut,
    Terminated,
    CollectingFeedback,
}

impl CallPhase {
    pub fn is_ending(self) -> bool {
        matches!(
            self,
            CallPhase::EndingLocal | CallPhase::EndingRemote | CallPhase::TimedOut | CallPhase::Terminated
        )
    }

    pub fn is_finished(self) -> bool {
        matches!(self, CallPhase::Terminated | CallPhase::CollectingFeedback)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    LocalHangup,
    RemoteEnded,
    TimedOut,
    Disposed,
}

/// What the UI renders. Published on every change.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CallView {
    pub phase: CallPhase,
    pub remaining_seconds: Option<u64>,
    pub connection_state: LinkState,
    pub remote_stream_present: bool,
    pub muted: bool,
    pub video_on: bool,
    pub waiting_text: Option<String>,
    #[serde(serialize_with = "error_text")]
    pub error: Option<CallError>,
    pub end_reason: Option<EndReason>,
    pub ts_ms: u64,
}

impl CallView {
    pub fn new() -> Self {
        Self {
            phase: CallPhase::Initializing,
            remaining_seconds: None,
            connection_state: LinkState::New,
            remote_stream_present: false,
            muted: false,
            video_on: false,
            waiting_text: None,
            error: None,
            end_reason: None,
            ts_ms: now_ms_u64(),
        }
    }

    pub fn countdown_text(&self) -> String {
        format_countdown(self.remaining_seconds)
    }
}

impl Default for CallView {
    fn default() -> Self {
        Self::new()
    }
}

fn error_text<S: Serializer>(e: &Option<CallError>, s: S) -> Result<S::Ok, S::Error> {
    match e {
        Some(e) => s.serialize_some(&e.to_string()),
        None => s.serialize_none(),
    }
}

pub(crate) fn now_ms_u64() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// `mm:ss`, or `--:--` while the call window is unknown.
pub fn format_countdown(remaining: Option<u64>) -> String {
    match remaining {
        Some(secs) => format!("{:02}:{:02}", secs / 60, secs % 60),
        None => "--:--".to_string(),
    }
}

/// The "waiting for the other participant" banner. Connection loss shows up
/// here again instead of as an error.
pub fn waiting_text(role: Role, phase: CallPhase, remote_present: bool, link: LinkState) -> Option<String> {
    if phase.is_finished() || phase.is_ending() {
        return Some("Call ended.".to_string());
    }
    if phase == CallPhase::Initializing {
        return None;
    }
    if link.is_connected() || (remote_present && !link.is_broken()) {
        return None;
    }
    Some(format!("Waiting for {} to join...", role.counterpart()))
}
