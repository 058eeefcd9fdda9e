//! Client side of the proxy credential service
//!
//! Models what the credential service hands out and how the last answer
//! survives a restart:
//!
//! - `ProxyPass`: a time-bounded bearer credential for the proxy
//! - `ProxyUsage`: a `{max, remaining, reset_at}` quota snapshot in bytes
//! - `CredentialService`: the fetch boundary the session manager depends on,
//!   with `GuardianClient` as the HTTP implementation
//! - `UsageCache`: restart-persistent storage for the last usage snapshot
//!
//! Nothing here holds session state. The session manager in `proxy-session`
//! owns the lifecycle and calls into this crate at its suspension points.

pub mod cache;
pub mod client;
pub mod constants;
pub mod error;
pub mod pass;
pub mod service;
pub mod usage;

pub use cache::{FileUsageCache, MemoryUsageCache, UsageCache};
pub use client::GuardianClient;
pub use constants::*;
pub use error::{Error, Result};
pub use pass::ProxyPass;
pub use service::{CredentialService, FetchOptions, FetchReason, PassResponse};
pub use usage::ProxyUsage;
