//! Quota snapshot: how many bytes are left and when the period resets
//!
//! Byte counts are `u64`. Quotas in the tens of gigabytes are past the 2^53
//! range a JSON number can carry exactly, so counts travel as decimal strings
//! on the wire and in the cache. Deserialization also accepts plain integers.
//!
//! Exhaustion is `remaining == 0`, compared exactly. A snapshot with zero
//! remaining is real data; "never fetched" is `Option::None` at the holder.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyUsage {
    /// Quota size for the period, in bytes
    #[serde(with = "byte_count")]
    pub max: u64,
    /// Bytes left in the period. Expected `<= max`, not enforced.
    #[serde(with = "byte_count")]
    pub remaining: u64,
    /// When the period rolls over
    pub reset_at: DateTime<Utc>,
}

impl ProxyUsage {
    pub fn new(max: u64, remaining: u64, reset_at: DateTime<Utc>) -> Self {
        Self {
            max,
            remaining,
            reset_at,
        }
    }

    /// Parse the string form the credential service sends in response headers.
    pub fn parse(max: &str, remaining: &str, reset_at: &str) -> Result<Self> {
        let max = parse_bytes(max, "max")?;
        let remaining = parse_bytes(remaining, "remaining")?;
        let reset_at = DateTime::parse_from_rfc3339(reset_at.trim())
            .map_err(|e| Error::InvalidUsage(format!("reset {reset_at:?}: {e}")))?
            .with_timezone(&Utc);
        Ok(Self::new(max, remaining, reset_at))
    }

    pub fn exhausted(&self) -> bool {
        self.remaining == 0
    }

    /// `max - remaining`, clamped at zero if the service over-reports remaining.
    pub fn used_bytes(&self) -> u64 {
        self.max.saturating_sub(self.remaining)
    }
}

fn parse_bytes(value: &str, field: &str) -> Result<u64> {
    value
        .trim()
        .parse::<u64>()
        .map_err(|e| Error::InvalidUsage(format!("{field} {value:?}: {e}")))
}

/// Serde adapter: `u64` as a decimal string, reading strings or integers.
mod byte_count {
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Text(String),
        Number(u64),
    }

    pub fn serialize<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        match Repr::deserialize(deserializer)? {
            Repr::Number(n) => Ok(n),
            Repr::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
        }
    }
}
