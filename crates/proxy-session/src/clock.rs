//! Injectable wall clock and timer
//!
//! The scheduler never reads time or sleeps directly. Production code uses
//! `SystemClock` and `TokioTimer`; tests drive the clock and timer in
//! `manual` by hand, which makes every armed timer observable and lets a
//! test decide exactly when each one fires.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use chrono::{DateTime, Utc};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Arms one timer per call. The returned future completes once `delay`
/// has elapsed; dropping it disarms the timer.
pub trait Timer: Send + Sync {
    fn sleep(&self, delay: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokioTimer;

impl Timer for TokioTimer {
    fn sleep(&self, delay: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(tokio::time::sleep(delay))
    }
}
