//! Error types for session operations

/// Errors inside the session manager.
///
/// None of these cross the manager's public operations: a failed fetch
/// becomes a state transition and a log line. They surface from
/// configuration checks and internal fetch helpers.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid manager configuration: {0}")]
    InvalidConfig(String),

    #[error("credential service unavailable: {0}")]
    Transport(#[from] guardian::Error),
}

/// Result alias for session operations.
pub type Result<T> = std::result::Result<T, Error>;
