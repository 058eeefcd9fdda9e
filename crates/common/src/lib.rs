//! Shared types for the proxy session workspace
//!
//! Holds the pieces every member needs but none owns: the redacting
//! `Secret` wrapper used for bearer tokens and proxy passes, and the
//! configuration error type returned while loading daemon settings.

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
