/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - DUET Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Cancellable fixed-interval polling.
//!
//! Every relay loop in the coordinator (offer/answer, metadata, approval) is a
//! [`poll_until`]: the step runs on each tick until it yields
//! `ControlFlow::Break`. Steps never overlap; a tick that fires while the
//! previous step is still in flight is skipped. Cancelling the handle (or its
//! parent token) drops any step still in flight, so a late relay reply is
//! discarded rather than applied.

use std::future::Future;
use std::ops::ControlFlow;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub struct PollHandle<T> {
    label: &'static str,
    token: CancellationToken,
    join: Option<JoinHandle<Option<T>>>,
}

impl<T> PollHandle<T> {
    pub fn cancel(&self) {
        if !self.token.is_cancelled() {
            debug!(poll = self.label, "poll cancelled");
        }
        self.token.cancel();
    }

    /// Waits for the loop to end. `None` when it was cancelled first.
    pub async fn finished(mut self) -> Option<T> {
        let join = self.join.take()?;
        join.await.ok().flatten()
    }
}

impl<T> Drop for PollHandle<T> {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Spawns a loop that runs `step` immediately and then every `every` until it
/// breaks or `parent` is cancelled.
pub fn poll_until<T, F, Fut>(label: &'static str, every: Duration, parent: &CancellationToken, mut step: F) -> PollHandle<T>
where
    T: Send + 'static,
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ControlFlow<T>> + Send,
{
    let token = parent.child_token();
    let cancel = token.clone();
    let join = tokio::spawn(async move {
        let mut tick = tokio::time::interval(every);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return None,
                _ = tick.tick() => {}
            }
            let flow = tokio::select! {
                biased;
                _ = cancel.cancelled() => return None,
                flow = step() => flow,
            };
            if let ControlFlow::Break(v) = flow {
                debug!(poll = label, "poll satisfied");
                return Some(v);
            }
        }
    });
    PollHandle {
        label,
        token,
        join: Some(join),
    }
}
