//! Proxy session lifecycle
//!
//! Owns one rotating, quota-limited proxy connection for the life of the
//! process: activation, scheduled credential rotation, pause on quota
//! exhaustion, and restart-safe usage caching. The credential service and
//! usage cache are injected (`guardian::CredentialService`,
//! `guardian::UsageCache`), as are the clock and timer the scheduler runs on.
//!
//! Session lifecycle:
//! 1. Manager built → last cached usage loaded, state `NotReady`
//! 2. `start()` → `Activating`, pass fetched → `Active`, `Paused` or `Error`
//! 3. Rotation scheduled at `min(pass expiry, quota reset) - margin`
//! 4. Quota hits zero (rotation or usage refresh) → `Paused`, resume attempt
//!    scheduled at the quota reset
//! 5. `stop()` → `Ready` from `Active`, `NotReady` from `Paused`
//! 6. `reset()` on sign-out → `NotReady`, optionally forgetting usage

pub mod clock;
pub mod error;
pub mod events;
pub mod manager;
pub mod refresh;
pub mod scheduler;
pub mod status;
mod telemetry;

pub use clock::{Clock, SystemClock, Timer, TokioTimer};
pub use error::{Error, Result};
pub use events::{ManagerEvent, ProxyState};
pub use manager::{ManagerBuilder, ManagerConfig, ProxySessionManager};
pub use refresh::spawn_usage_refresh_task;
pub use scheduler::{
    MAX_TIMER_DELAY, ScheduleOutcome, ScheduledTask, schedule_callback, schedule_callback_with,
};
pub use status::{PassStatus, classify_pass_status};
