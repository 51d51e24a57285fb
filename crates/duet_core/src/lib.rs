/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - DUET Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

pub mod config;
pub mod error;
pub mod feedback;
pub mod http_retry;
pub mod lifecycle;
pub mod media;
pub mod negotiator;
pub mod net_metrics;
pub mod poll;
pub mod recorder;
pub mod signaling;
pub mod view;
pub mod webrtc_link;

#[cfg(test)]
mod testing;

pub use error::{CallError, Result};
pub use lifecycle::{CallDeps, CallOptions, SessionLifecycle};
pub use view::{CallPhase, CallView, EndReason};

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
