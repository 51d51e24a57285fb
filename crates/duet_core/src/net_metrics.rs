/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - DUET Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Counters for relay traffic, shared by every call made through one client.
#[derive(Default)]
pub struct RelayMetrics {
    requests: AtomicU64,
    successes: AtomicU64,
    rejections: AtomicU64,
    timeouts: AtomicU64,
    unreachable: AtomicU64,
    retries: AtomicU64,
    uploaded_bytes: AtomicU64,
    rtt_ms: AtomicU64,
    last_error: Mutex<Option<String>>,
}

/// Point-in-time copy of [`RelayMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RelaySnapshot {
    pub requests: u64,
    pub successes: u64,
    pub rejections: u64,
    pub timeouts: u64,
    pub unreachable: u64,
    pub retries: u64,
    pub uploaded_bytes: u64,
    /// Smoothed round trip of successful requests, 0 until one completes.
    pub rtt_ms: u64,
    pub last_error: Option<String>,
}

impl RelayMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn success(&self, rtt_ms: u64) {
        self.successes.fetch_add(1, Ordering::Relaxed);
        if rtt_ms > 0 {
            // 1/8 weight for the newest sample; the first one seeds the average.
            let _ = self.rtt_ms.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |prev| {
                Some(if prev == 0 { rtt_ms } else { (prev.saturating_mul(7) + rtt_ms) / 8 })
            });
        }
        *self.error_slot() = None;
    }

    pub fn rejected(&self, status: u16) {
        self.rejections.fetch_add(1, Ordering::Relaxed);
        *self.error_slot() = Some(format!("http {status}"));
    }

    pub fn failed(&self, err: &reqwest::Error) {
        let counter = if err.is_timeout() { &self.timeouts } else { &self.unreachable };
        counter.fetch_add(1, Ordering::Relaxed);
        *self.error_slot() = Some(err.to_string());
    }

    pub fn uploaded(&self, n: u64) {
        self.uploaded_bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RelaySnapshot {
        RelaySnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            rejections: self.rejections.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            unreachable: self.unreachable.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            uploaded_bytes: self.uploaded_bytes.load(Ordering::Relaxed),
            rtt_ms: self.rtt_ms.load(Ordering::Relaxed),
            last_error: self.error_slot().clone(),
        }
    }

    fn error_slot(&self) -> std::sync::MutexGuard<'_, Option<String>> {
        self.last_error.lock().unwrap_or_else(|e| e.into_inner())
    }
}
