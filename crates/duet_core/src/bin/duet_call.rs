/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - DUET Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{anyhow, Context, Result};
use duet_core::config::{resolve_config_path, CoordinatorConfig};
use duet_core::media::SyntheticCapture;
use duet_core::signaling::SignalingClient;
use duet_core::webrtc_link::WebrtcPeerLinkFactory;
use duet_core::{CallDeps, CallOptions, CallPhase, SessionLifecycle};
use duet_protocol::{Role, SessionId};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

struct CallArgs {
    session: SessionId,
    role: Role,
    rating: Option<u8>,
    comment: String,
    config: Option<PathBuf>,
}

fn parse_args(args: &[String]) -> Result<CallArgs> {
    let mut session = None;
    let mut role = None;
    let mut rating = None;
    let mut comment = String::new();
    let mut config = None;
    let mut it = args.iter();
    while let Some(arg) = it.next() {
        let mut value = || it.next().ok_or_else(|| anyhow!("{arg} requires a value"));
        match arg.as_str() {
            "--session" => session = Some(SessionId::new(value()?.trim())),
            "--role" => role = Some(value()?.parse::<Role>().map_err(|e| anyhow!(e))?),
            "--rating" => rating = Some(value()?.parse::<u8>().context("--rating must be 1-5")?),
            "--comment" => comment = value()?.clone(),
            "--config" => config = Some(PathBuf::from(value()?)),
            other => warn!("ignoring unknown argument {other}"),
        }
    }
    Ok(CallArgs {
        session: session.ok_or_else(|| anyhow!("--session is required"))?,
        role: role.ok_or_else(|| anyhow!("--role is required (requester|responder)"))?,
        rating,
        comment,
        config,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .try_init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let call = parse_args(&args)?;
    let cfg_path = resolve_config_path(call.config.clone());
    info!("duet_call {} starting", duet_core::version());
    info!("config: {}", cfg_path.display());
    let cfg = CoordinatorConfig::load(&cfg_path).with_context(|| format!("load {}", cfg_path.display()))?;

    let client = Arc::new(SignalingClient::from_config(&cfg)?);
    let deps = CallDeps::over_http(
        client.clone(),
        Arc::new(SyntheticCapture),
        Arc::new(WebrtcPeerLinkFactory::from_config(&cfg)),
    );
    let lc = SessionLifecycle::new(deps, CallOptions::from_config(&cfg));

    let mut views = lc.subscribe();
    tokio::spawn(async move {
        let mut last = None;
        while views.changed().await.is_ok() {
            let v = views.borrow_and_update().clone();
            let key = (v.phase, v.connection_state, v.waiting_text.clone());
            if last.as_ref() != Some(&key) {
                info!(
                    phase = ?v.phase,
                    link = ?v.connection_state,
                    remote = v.remote_stream_present,
                    "{}",
                    v.waiting_text.as_deref().unwrap_or("in call")
                );
                last = Some(key);
            }
            debug!(countdown = %v.countdown_text(), muted = v.muted, "tick");
        }
    });

    if let Err(e) = lc.start(call.session.clone(), call.role).await {
        error!(session = %call.session, "call could not start: {e}");
        lc.dispose().await;
        return Err(e.into());
    }

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let finished = tokio::select! {
        _ = &mut ctrl_c => {
            info!("hangup requested");
            lc.hangup().await;
            lc.wait_finished().await
        }
        v = lc.wait_finished() => v,
    };
    info!(phase = ?finished.phase, reason = ?finished.end_reason, "call finished");
    if let Some(outcome) = lc.upload_outcome() {
        info!(?outcome, "recording");
    }
    info!(metrics = ?client.metrics().snapshot(), "relay traffic");

    if let Some(rating) = call.rating {
        if finished.phase == CallPhase::CollectingFeedback {
            if let Err(e) = lc.submit_feedback(rating, &call.comment).await {
                warn!("feedback not sent: {e}");
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_call_flags() {
        let a = parse_args(&args(&["--config", "x.json", "--session", "42", "--role", "speaker", "--rating", "5"])).unwrap();
        assert_eq!(a.session, SessionId::from("42"));
        assert_eq!(a.role, Role::Responder);
        assert_eq!(a.rating, Some(5));
        assert!(a.comment.is_empty());
        assert_eq!(a.config, Some(PathBuf::from("x.json")));
    }

    #[test]
    fn requires_session_and_role() {
        assert!(parse_args(&args(&["--role", "requester"])).is_err());
        assert!(parse_args(&args(&["--session", "1"])).is_err());
        assert!(parse_args(&args(&["--session"])).is_err());
        assert!(parse_args(&args(&["--session", "1", "--role", "user", "--config"])).is_err());
    }
}
