//! Error types for credential service and usage cache operations

/// Errors from credential service and usage cache operations.
///
/// `Http` and `Rejected` are what the session manager treats as transport
/// failures. The parse variants describe malformed payloads.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("credential service rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("invalid proxy pass: {0}")]
    InvalidPass(String),

    #[error("invalid usage snapshot: {0}")]
    InvalidUsage(String),

    #[error("usage cache parse error: {0}")]
    CacheParse(String),

    #[error("I/O error: {0}")]
    Io(String),
}

/// Result alias for guardian operations.
pub type Result<T> = std::result::Result<T, Error>;
