/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - DUET Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Typed access to the backend: the store-and-forward signaling relay, the
//! session metadata endpoint, the audio upload endpoint and the feedback
//! endpoint. One [`SignalingClient`] implements all of them over HTTP.

use async_trait::async_trait;
use duet_protocol::{AnswerBody, FeedbackRequest, OfferBody, SessionDescription, SessionId, SessionInfo, SignalingDocument};
use reqwest::multipart::{Form, Part};
use reqwest::{RequestBuilder, Response};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tracing::debug;
use urlencoding::encode;

use crate::config::CoordinatorConfig;
use crate::error::{CallError, Result};
use crate::http_retry::send_with_retry;
use crate::net_metrics::RelayMetrics;
use crate::recorder::{AudioArtifact, UploadReceipt};

#[async_trait]
pub trait SignalingRelay: Send + Sync {
    async fn post_offer(&self, session: &SessionId, offer: &SessionDescription) -> Result<()>;
    async fn post_answer(&self, session: &SessionId, answer: &SessionDescription) -> Result<()>;
    async fn get_signaling(&self, session: &SessionId) -> Result<SignalingDocument>;
    async fn approve(&self, session: &SessionId) -> Result<()>;
}

#[async_trait]
pub trait SessionDirectory: Send + Sync {
    async fn get_session(&self, session: &SessionId) -> Result<SessionInfo>;
}

#[async_trait]
pub trait AudioUploader: Send + Sync {
    async fn upload_audio(&self, session: &SessionId, artifact: AudioArtifact) -> Result<UploadReceipt>;
}

#[async_trait]
pub trait FeedbackSink: Send + Sync {
    async fn submit_feedback(&self, feedback: &FeedbackRequest) -> Result<()>;
}

/// Explicit caller identity for every backend request.
#[derive(Clone, Default)]
pub struct Credentials {
    bearer: Option<String>,
}

impl Credentials {
    pub fn bearer(token: impl Into<String>) -> Self {
        let token = token.into().trim().to_string();
        Self {
            bearer: (!token.is_empty()).then_some(token),
        }
    }

    pub fn anonymous() -> Self {
        Self::default()
    }

    fn apply(&self, req: RequestBuilder) -> RequestBuilder {
        match self.bearer.as_deref() {
            Some(tok) => req.header("Authorization", format!("Bearer {tok}")),
            None => req,
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("bearer", &self.bearer.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// HTTP client for the backend. Holds no cached state: every call is a
/// fresh round-trip.
#[derive(Clone)]
pub struct SignalingClient {
    http: reqwest::Client,
    base: String,
    credentials: Credentials,
    attempts: u32,
    metrics: Arc<RelayMetrics>,
}

impl SignalingClient {
    pub fn new(http: reqwest::Client, base_url: &str, credentials: Credentials, attempts: u32) -> Self {
        Self {
            http,
            base: base_url.trim().trim_end_matches('/').to_string(),
            credentials,
            attempts: attempts.clamp(1, 5),
            metrics: Arc::new(RelayMetrics::new()),
        }
    }

    pub fn from_config(cfg: &CoordinatorConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(cfg.http_timeout())
            .build()
            .map_err(|e| anyhow::anyhow!("build http client: {e}"))?;
        let credentials = cfg.access_token.as_deref().map(Credentials::bearer).unwrap_or_default();
        Ok(Self::new(http, &cfg.relay_base_url, credentials, cfg.relay_attempts()))
    }

    pub fn metrics(&self) -> &Arc<RelayMetrics> {
        &self.metrics
    }

    fn session_url(&self, session: &SessionId, tail: &str) -> String {
        format!("{}/sessions/sessions/{}/{}", self.base, encode(session.as_str()), tail)
    }

    async fn send(&self, build: impl Fn() -> RequestBuilder) -> Result<Response> {
        let resp = send_with_retry(|| self.credentials.apply(build()), self.attempts, &self.metrics).await?;
        ensure_success(resp).await
    }

    async fn get_json<T: DeserializeOwned>(&self, url: String) -> Result<T> {
        let resp = self.send(|| self.http.get(&url)).await?;
        Ok(resp.json::<T>().await?)
    }
}

async fn ensure_success(resp: Response) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(CallError::RelayRejected {
        status: status.as_u16(),
        body: body.chars().take(512).collect(),
    })
}

#[async_trait]
impl SignalingRelay for SignalingClient {
    async fn post_offer(&self, session: &SessionId, offer: &SessionDescription) -> Result<()> {
        let url = self.session_url(session, "offer/");
        let body = OfferBody { offer: offer.clone() };
        self.send(|| self.http.post(&url).json(&body)).await?;
        debug!(session = %session, "offer posted");
        Ok(())
    }

    async fn post_answer(&self, session: &SessionId, answer: &SessionDescription) -> Result<()> {
        let url = self.session_url(session, "answer/");
        let body = AnswerBody { answer: answer.clone() };
        self.send(|| self.http.post(&url).json(&body)).await?;
        debug!(session = %session, "answer posted");
        Ok(())
    }

    async fn get_signaling(&self, session: &SessionId) -> Result<SignalingDocument> {
        self.get_json(self.session_url(session, "signaling/")).await
    }

    async fn approve(&self, session: &SessionId) -> Result<()> {
        let url = self.session_url(session, "approve/");
        self.send(|| self.http.post(&url)).await?;
        debug!(session = %session, "session approved");
        Ok(())
    }
}

#[async_trait]
impl SessionDirectory for SignalingClient {
    async fn get_session(&self, session: &SessionId) -> Result<SessionInfo> {
        self.get_json(self.session_url(session, "")).await
    }
}

#[async_trait]
impl AudioUploader for SignalingClient {
    /// Single attempt; multipart bodies are not replayable.
    async fn upload_audio(&self, session: &SessionId, artifact: AudioArtifact) -> Result<UploadReceipt> {
        let url = self.session_url(session, "upload-audio/");
        let size = artifact.bytes.len();
        let part = Part::bytes(artifact.bytes.to_vec())
            .file_name(format!("session-{}.{}", session, extension_for(&artifact.mime_type)))
            .mime_str(&artifact.mime_type)
            .map_err(|e| CallError::UploadFailed(format!("bad mime type: {e}")))?;
        let form = Form::new().part("audio", part);
        let req = self.credentials.apply(self.http.post(&url).multipart(form));
        self.metrics.request();
        let started = std::time::Instant::now();
        let resp = match req.send().await {
            Ok(r) => r,
            Err(e) => {
                self.metrics.failed(&e);
                return Err(CallError::UploadFailed(e.to_string()));
            }
        };
        let status = resp.status();
        if !status.is_success() {
            self.metrics.rejected(status.as_u16());
            let text = resp.text().await.unwrap_or_default();
            return Err(CallError::UploadFailed(format!("{status} {text}")));
        }
        self.metrics.success(started.elapsed().as_millis() as u64);
        self.metrics.uploaded(size as u64);
        Ok(UploadReceipt { bytes: size })
    }
}

#[async_trait]
impl FeedbackSink for SignalingClient {
    async fn submit_feedback(&self, feedback: &FeedbackRequest) -> Result<()> {
        let url = format!("{}/sessions/feedback/", self.base);
        let req = self.credentials.apply(self.http.post(&url).json(feedback));
        self.metrics.request();
        let resp = req.send().await.map_err(|e| {
            self.metrics.failed(&e);
            CallError::SubmissionFailed(e.to_string())
        })?;
        let status = resp.status();
        if !status.is_success() {
            self.metrics.rejected(status.as_u16());
            let text = resp.text().await.unwrap_or_default();
            return Err(CallError::SubmissionFailed(format!("{status} {text}")));
        }
        self.metrics.success(0);
        Ok(())
    }
}

fn extension_for(mime: &str) -> &'static str {
    match mime.split(';').next().unwrap_or("").trim() {
        "audio/webm" => "webm",
        "audio/ogg" => "ogg",
        "audio/wav" | "audio/x-wav" => "wav",
        "audio/mpeg" => "mp3",
        _ => "bin",
    }
}
