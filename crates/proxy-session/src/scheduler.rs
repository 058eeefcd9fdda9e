//! Cancellable deadline scheduling
//!
//! Runs a callback once at a wall-clock instant. Platform timers have a
//! ceiling on the delay they accept, so waits longer than `MAX_TIMER_DELAY`
//! are chained: sleep the maximum, re-read the clock, sleep again until the
//! target is reached. Cancellation is checked before the first wait and
//! races every individual wait, so an abort mid-chain disarms the pending
//! timer and the callback never runs.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::clock::{Clock, SystemClock, Timer, TokioTimer};

/// Longest single wait, `2^31 - 1` milliseconds (about 24.8 days).
pub const MAX_TIMER_DELAY: Duration = Duration::from_millis(2_147_483_647);

/// How a scheduled wait ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleOutcome<T> {
    /// The target was reached and the callback ran to completion.
    Fired(T),
    /// Cancelled before the callback started. The callback never ran.
    Aborted,
}

impl<T> ScheduleOutcome<T> {
    pub fn is_aborted(&self) -> bool {
        matches!(self, ScheduleOutcome::Aborted)
    }

    pub fn fired(self) -> Option<T> {
        match self {
            ScheduleOutcome::Fired(value) => Some(value),
            ScheduleOutcome::Aborted => None,
        }
    }
}

/// Run `callback` at `target` on the system clock and tokio timer.
pub async fn schedule_callback<F, Fut>(
    callback: F,
    target: DateTime<Utc>,
    cancel: &CancellationToken,
) -> ScheduleOutcome<Fut::Output>
where
    F: FnOnce() -> Fut,
    Fut: Future,
{
    schedule_callback_with(callback, target, cancel, &SystemClock, &TokioTimer).await
}

/// Run `callback` at `target`, reading time from `clock` and waiting on
/// `timer`.
///
/// A target at or before now fires after one yield to the runtime, never
/// synchronously inside the call. Whatever the callback returns, including
/// an `Err`, is handed back as `Fired`.
pub async fn schedule_callback_with<F, Fut>(
    callback: F,
    target: DateTime<Utc>,
    cancel: &CancellationToken,
    clock: &dyn Clock,
    timer: &dyn Timer,
) -> ScheduleOutcome<Fut::Output>
where
    F: FnOnce() -> Fut,
    Fut: Future,
{
    if cancel.is_cancelled() {
        return ScheduleOutcome::Aborted;
    }

    while let Some(remaining) = remaining_until(target, clock.now()) {
        let delay = remaining.min(MAX_TIMER_DELAY);
        trace!(
            delay_ms = delay.as_millis() as u64,
            remaining_ms = remaining.as_millis() as u64,
            "arming timer"
        );
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return ScheduleOutcome::Aborted,
            _ = timer.sleep(delay) => {}
        }
    }

    tokio::task::yield_now().await;
    if cancel.is_cancelled() {
        return ScheduleOutcome::Aborted;
    }

    ScheduleOutcome::Fired(callback().await)
}

/// Time left until `target`, or `None` once it has been reached.
fn remaining_until(target: DateTime<Utc>, now: DateTime<Utc>) -> Option<Duration> {
    (target - now).to_std().ok().filter(|d| !d.is_zero())
}

/// A callback scheduled on its own task.
///
/// `abort()` and drop both cancel the wait. Once the callback has started
/// it runs to completion; aborting only prevents callbacks that have not
/// started yet, so a callback may safely replace the task that runs it.
#[derive(Debug)]
pub struct ScheduledTask {
    target: DateTime<Utc>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl ScheduledTask {
    pub fn spawn<F, Fut>(
        target: DateTime<Utc>,
        clock: Arc<dyn Clock>,
        timer: Arc<dyn Timer>,
        callback: F,
    ) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let outcome =
                schedule_callback_with(callback, target, &token, clock.as_ref(), timer.as_ref())
                    .await;
            if outcome.is_aborted() {
                debug!(target_time = %target, "scheduled callback aborted");
            }
        });
        Self {
            target,
            cancel,
            handle,
        }
    }

    pub fn target_time(&self) -> DateTime<Utc> {
        self.target
    }

    pub fn abort(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
