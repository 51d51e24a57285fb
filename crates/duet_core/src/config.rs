/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - DUET Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_ICE_URLS: [&str; 2] = ["stun:stun.l.google.com:19302", "stun:stun1.l.google.com:19302"];

#[derive(Clone, Debug, serde::Deserialize)]
pub struct CoordinatorConfig {
    /// Backend API root, e.g. `http://127.0.0.1:8000/api`.
    #[serde(alias = "base_url")]
    pub relay_base_url: String,
    /// Bearer token for the backend. Passed explicitly into the relay client.
    #[serde(default)]
    pub access_token: Option<String>,
    /// HTTP client timeout for relay requests (seconds).
    #[serde(default)]
    pub http_timeout_secs: Option<u64>,
    /// Attempts per relay call before the error is handed to the poll loop.
    #[serde(default)]
    pub relay_attempts: Option<u32>,
    #[serde(default)]
    pub signaling_poll_ms: Option<u64>,
    #[serde(default)]
    pub metadata_poll_ms: Option<u64>,
    /// Upper bound on waiting for ICE gathering before posting a description.
    #[serde(default)]
    pub ice_gathering_timeout_ms: Option<u64>,
    /// How long teardown waits on the recorder upload.
    #[serde(default)]
    pub recorder_stop_timeout_secs: Option<u64>,
    #[serde(default)]
    pub ice_urls: Option<Vec<String>>,
    #[serde(default)]
    pub ice_username: Option<String>,
    #[serde(default)]
    pub ice_credential: Option<String>,
    #[serde(default)]
    pub recording_mime_type: Option<String>,
    /// Responder approves the session on join when it is not approved yet.
    #[serde(default)]
    pub auto_approve: Option<bool>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            relay_base_url: "http://127.0.0.1:8000/api".to_string(),
            access_token: None,
            http_timeout_secs: None,
            relay_attempts: None,
            signaling_poll_ms: None,
            metadata_poll_ms: None,
            ice_gathering_timeout_ms: None,
            recorder_stop_timeout_secs: None,
            ice_urls: None,
            ice_username: None,
            ice_credential: None,
            recording_mime_type: None,
            auto_approve: None,
        }
    }
}

impl CoordinatorConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        let cfg: CoordinatorConfig = serde_json::from_str(text).context("decode CoordinatorConfig")?;
        if cfg.relay_base_url.trim().is_empty() {
            anyhow::bail!("relay_base_url must not be empty");
        }
        Ok(cfg)
    }

    pub fn load(path: &std::path::Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
        Self::from_json(&text)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs.unwrap_or(10).clamp(1, 120))
    }

    pub fn relay_attempts(&self) -> u32 {
        self.relay_attempts.unwrap_or(1).clamp(1, 5)
    }

    pub fn timings(&self) -> Timings {
        Timings {
            signaling_poll: Duration::from_millis(self.signaling_poll_ms.unwrap_or(2_000).clamp(250, 30_000)),
            metadata_poll: Duration::from_millis(self.metadata_poll_ms.unwrap_or(2_000).clamp(250, 30_000)),
            ice_gathering_timeout: Duration::from_millis(
                self.ice_gathering_timeout_ms.unwrap_or(6_000).clamp(500, 30_000),
            ),
            recorder_stop_timeout: Duration::from_secs(self.recorder_stop_timeout_secs.unwrap_or(10).clamp(1, 120)),
            countdown_tick: Duration::from_secs(1),
        }
    }

    pub fn ice_urls(&self) -> Vec<String> {
        let urls = self
            .ice_urls
            .clone()
            .unwrap_or_default()
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();
        if urls.is_empty() {
            return DEFAULT_ICE_URLS.iter().map(|s| s.to_string()).collect();
        }
        urls
    }

    pub fn recording_mime_type(&self) -> String {
        self.recording_mime_type
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(crate::recorder::RECORDING_MIME_TYPE)
            .to_string()
    }

    pub fn auto_approve(&self) -> bool {
        self.auto_approve.unwrap_or(true)
    }
}

/// Resolved intervals and bounds used by the negotiator and lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Timings {
    pub signaling_poll: Duration,
    pub metadata_poll: Duration,
    pub ice_gathering_timeout: Duration,
    pub recorder_stop_timeout: Duration,
    pub countdown_tick: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        CoordinatorConfig::default().timings()
    }
}

pub fn default_config_path() -> PathBuf {
    match directories::ProjectDirs::from("org", "duet", "duet") {
        Some(dirs) => dirs.config_dir().join("config.json"),
        None => PathBuf::from("duet.json"),
    }
}

/// An explicit path, then `DUET_CONFIG`, then the platform config dir.
pub fn resolve_config_path(explicit: Option<PathBuf>) -> PathBuf {
    if let Some(path) = explicit {
        return path;
    }
    match std::env::var("DUET_CONFIG") {
        Ok(path) if !path.trim().is_empty() => PathBuf::from(path),
        _ => default_config_path(),
    }
}
