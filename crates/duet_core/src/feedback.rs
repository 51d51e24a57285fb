/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - DUET Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use duet_protocol::{FeedbackRequest, Role, SessionId};
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{CallError, Result};
use crate::signaling::FeedbackSink;

/// Post-call rating of the other participant.
pub struct FeedbackCollector {
    session_id: SessionId,
    role: Role,
    sink: Arc<dyn FeedbackSink>,
}

impl FeedbackCollector {
    pub fn new(session_id: SessionId, role: Role, sink: Arc<dyn FeedbackSink>) -> Self {
        Self { session_id, role, sink }
    }

    /// Rates the counterpart role. One attempt; failures are returned as
    /// `SubmissionFailed` and never retried here.
    pub async fn submit(&self, rating: u8, comment: &str) -> Result<()> {
        if !(1..=5).contains(&rating) {
            return Err(CallError::InvalidRating(rating));
        }
        let req = FeedbackRequest {
            session_id: self.session_id.clone(),
            rating,
            comment: comment.trim().to_string(),
            target: self.role.counterpart(),
        };
        match self.sink.submit_feedback(&req).await {
            Ok(()) => {
                info!(session = %self.session_id, rating, target = %req.target, "feedback submitted");
                Ok(())
            }
            Err(e) => {
                let e = match e {
                    CallError::SubmissionFailed(m) => CallError::SubmissionFailed(m),
                    other => CallError::SubmissionFailed(other.to_string()),
                };
                warn!(session = %self.session_id, "feedback submission failed: {e}");
                Err(e)
            }
        }
    }
}
