//! Classification of pass responses by HTTP status
//!
//! Only the status is classified here. Whether a quota-exceeded answer
//! pauses the session is decided by the usage snapshot that came with it,
//! since a 429 without a zero-remaining snapshot is just a failed issuance.

/// How the credential service answered a pass request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassStatus {
    /// 2xx: a pass should be in the body
    Issued,
    /// 429: quota exceeded for the current period
    QuotaExceeded,
    /// Anything else the service answered with
    Rejected,
}

impl PassStatus {
    /// Label for logs and the fetch outcome metric.
    pub fn label(&self) -> &'static str {
        match self {
            PassStatus::Issued => "issued",
            PassStatus::QuotaExceeded => "quota_exceeded",
            PassStatus::Rejected => "rejected",
        }
    }
}

pub fn classify_pass_status(status: u16) -> PassStatus {
    match status {
        200..=299 => PassStatus::Issued,
        429 => PassStatus::QuotaExceeded,
        _ => PassStatus::Rejected,
    }
}
