/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - DUET Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use rand::{thread_rng, Rng};
use reqwest::{RequestBuilder, Response, StatusCode};
use std::time::{Duration, Instant};

use crate::net_metrics::RelayMetrics;

/// Sends a relay request up to `attempts` times (clamped to 1..=5), backing
/// off with jitter on transport errors, 429 and 5xx. The last response or
/// error is returned as-is; status handling is left to the caller.
pub async fn send_with_retry<F>(mut build: F, attempts: u32, metrics: &RelayMetrics) -> reqwest::Result<Response>
where
    F: FnMut() -> RequestBuilder,
{
    let max_attempts = attempts.clamp(1, 5);
    let mut backoff = Duration::from_millis(200);
    let mut attempt = 0;
    loop {
        attempt += 1;
        metrics.request();
        let started = Instant::now();
        match build().send().await {
            Ok(resp) => {
                let status = resp.status();
                if status.is_success() {
                    metrics.success(started.elapsed().as_millis() as u64);
                    return Ok(resp);
                }
                metrics.rejected(status.as_u16());
                if should_retry_status(status) && attempt < max_attempts {
                    metrics.retry();
                    sleep_with_jitter(backoff).await;
                    backoff = backoff.saturating_mul(2).min(Duration::from_secs(5));
                    continue;
                }
                return Ok(resp);
            }
            Err(e) => {
                metrics.failed(&e);
                if attempt >= max_attempts {
                    return Err(e);
                }
                metrics.retry();
                sleep_with_jitter(backoff).await;
                backoff = backoff.saturating_mul(2).min(Duration::from_secs(5));
            }
        }
    }
}

fn should_retry_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

async fn sleep_with_jitter(base: Duration) {
    let jitter_ms: u64 = thread_rng().gen_range(0..=200);
    tokio::time::sleep(base + Duration::from_millis(jitter_ms)).await;
}
