/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - DUET Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Backend identifier of a scheduled call. The backend hands these out as
/// integers; older endpoints echo them back as strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into().trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(v: &str) -> Self {
        Self::new(v)
    }
}

impl From<u64> for SessionId {
    fn from(v: u64) -> Self {
        Self(v.to_string())
    }
}

impl<'de> Deserialize<'de> for SessionId {
    fn deserialize<D: Deserializer<'de>>(de: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Int(u64),
            Text(String),
        }
        Ok(match Raw::deserialize(de)? {
            Raw::Int(n) => SessionId::from(n),
            Raw::Text(s) => SessionId::new(s),
        })
    }
}

/// The two call roles. The requester offers and records; the responder
/// answers and approves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[serde(alias = "user")]
    Requester,
    #[serde(alias = "speaker")]
    Responder,
}

impl Role {
    /// The role on the other end of the call.
    pub fn counterpart(self) -> Role {
        match self {
            Role::Requester => Role::Responder,
            Role::Responder => Role::Requester,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Requester => "requester",
            Role::Responder => "responder",
        }
    }

    /// Name the session backend uses for this role in request bodies.
    pub fn backend_name(self) -> &'static str {
        match self {
            Role::Requester => "user",
            Role::Responder => "speaker",
        }
    }

    fn serialize_backend<S: Serializer>(role: &Role, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(role.backend_name())
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "requester" | "user" => Ok(Role::Requester),
            "responder" | "speaker" => Ok(Role::Responder),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// One half of the offer/answer exchange, in the browser's
/// `RTCSessionDescriptionInit` shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Session metadata as served by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub scheduled_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, alias = "approved_by_speaker")]
    pub approved_by_responder: bool,
}

impl SessionInfo {
    /// The call window, only when the backend has set both ends of it.
    pub fn window(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) => Some((start, end)),
            _ => None,
        }
    }
}

/// The relay's current view of a session's negotiation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SignalingDocument {
    #[serde(default)]
    pub session_id: Option<SessionId>,
    #[serde(default)]
    pub offer: Option<SessionDescription>,
    #[serde(default)]
    pub answer: Option<SessionDescription>,
    #[serde(default, alias = "approved_by_speaker")]
    pub approved_by_responder: bool,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfferBody {
    pub offer: SessionDescription,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnswerBody {
    pub answer: SessionDescription,
}

/// Post-call rating of the other participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackRequest {
    pub session_id: SessionId,
    pub rating: u8,
    pub comment: String,
    /// Role being rated, written as `user` or `speaker`.
    #[serde(serialize_with = "Role::serialize_backend")]
    pub target: Role,
}
