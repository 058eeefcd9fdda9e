//! The credential service boundary
//!
//! The session manager only sees this trait. `GuardianClient` implements it
//! over HTTP; tests implement it with scripted responses.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use crate::error::Result;
use crate::pass::ProxyPass;
use crate::usage::ProxyUsage;

/// Why a fetch is being made. Carried for logging and request tagging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchReason {
    /// First pass for a new activation
    Activation,
    /// Renewal of an existing pass, scheduled or explicit
    Rotation,
    /// Usage-only re-check
    UsageCheck,
}

impl FetchReason {
    pub fn label(&self) -> &'static str {
        match self {
            FetchReason::Activation => "activation",
            FetchReason::Rotation => "rotation",
            FetchReason::UsageCheck => "usage_check",
        }
    }
}

/// Per-call options for the credential service.
#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub reason: FetchReason,
    /// Upper bound on the whole request, connect through body
    pub timeout: Duration,
}

impl FetchOptions {
    pub fn new(reason: FetchReason, timeout: Duration) -> Self {
        Self { reason, timeout }
    }
}

/// The service's answer to a pass request that reached it.
///
/// `status` follows HTTP: 200 issued, 429 quota exceeded (usage present,
/// pass absent), anything else is an issuance failure. `usage` is present
/// whenever the service reported it, whatever the status.
#[derive(Debug, Clone)]
pub struct PassResponse {
    pub status: u16,
    pub error: Option<String>,
    pub pass: Option<ProxyPass>,
    pub usage: Option<ProxyUsage>,
}

/// Issues proxy passes and usage snapshots.
///
/// `Err` from either method means the service could not be reached or did
/// not answer (transport failure). A response the service did send, even a
/// rejection, comes back as `Ok(PassResponse)` from `fetch_proxy_pass`.
///
/// Uses `Pin<Box<dyn Future>>` return types so it can be held as
/// `Arc<dyn CredentialService>`.
pub trait CredentialService: Send + Sync {
    fn fetch_proxy_pass<'a>(
        &'a self,
        options: &'a FetchOptions,
    ) -> Pin<Box<dyn Future<Output = Result<PassResponse>> + Send + 'a>>;

    fn fetch_proxy_usage<'a>(
        &'a self,
        options: &'a FetchOptions,
    ) -> Pin<Box<dyn Future<Output = Result<ProxyUsage>> + Send + 'a>>;
}
