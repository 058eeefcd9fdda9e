//! Proxy pass: a bearer credential with a validity window
//!
//! The token is opaque to the session manager. When it is issued by the
//! credential service it is a JWT, and the window comes from its `nbf`/`exp`
//! claims. The signature is not checked here; the proxy that consumes the
//! pass does that.

use base64::Engine as _;
use base64::engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use common::Secret;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// A time-bounded proxy credential. Never mutated once built; rotation
/// replaces the whole value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyPass {
    token: Secret<String>,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
}

/// The claims we read from an issued token.
#[derive(Debug, Deserialize)]
struct WindowClaims {
    nbf: Option<i64>,
    iat: Option<i64>,
    exp: i64,
}

impl ProxyPass {
    /// Build a pass with an explicit window. Rejects `not_before > not_after`.
    pub fn new(
        token: impl Into<String>,
        not_before: DateTime<Utc>,
        not_after: DateTime<Utc>,
    ) -> Result<Self> {
        if not_before > not_after {
            return Err(Error::InvalidPass(format!(
                "not_before {not_before} is after not_after {not_after}"
            )));
        }
        Ok(Self {
            token: Secret::new(token.into()),
            not_before,
            not_after,
        })
    }

    /// Build a pass from an issued JWT, taking the window from its claims.
    ///
    /// `nbf` falls back to `iat`, then to the epoch. `exp` is required.
    pub fn from_token(token: impl Into<String>) -> Result<Self> {
        let token = token.into();
        let claims = decode_claims(&token)?;

        let not_before_secs = claims.nbf.or(claims.iat).unwrap_or(0);
        let not_before = timestamp(not_before_secs, "nbf")?;
        let not_after = timestamp(claims.exp, "exp")?;

        Self::new(token, not_before, not_after)
    }

    /// The raw bearer token. Never log this; use `fingerprint()`.
    pub fn token(&self) -> &str {
        self.token.expose()
    }

    pub fn not_before(&self) -> DateTime<Utc> {
        self.not_before
    }

    pub fn not_after(&self) -> DateTime<Utc> {
        self.not_after
    }

    /// `not_before <= now < not_after`
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        self.not_before <= now && now < self.not_after
    }

    /// Short, stable identifier for log lines.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.token.expose().as_bytes());
        digest[..6].iter().map(|b| format!("{b:02x}")).collect()
    }
}

/// Decode the claims segment of a JWT.
///
/// Accepts both URL-safe and standard alphabets, padded or not, since
/// issuers are not consistent about either.
fn decode_claims(token: &str) -> Result<WindowClaims> {
    let mut segments = token.split('.');
    let (Some(_header), Some(body), Some(_signature), None) = (
        segments.next(),
        segments.next(),
        segments.next(),
        segments.next(),
    ) else {
        return Err(Error::InvalidPass("token is not a three-part JWT".into()));
    };

    let body = body.trim_end_matches('=');
    let bytes = URL_SAFE_NO_PAD
        .decode(body)
        .or_else(|_| STANDARD_NO_PAD.decode(body))
        .map_err(|e| Error::InvalidPass(format!("claims are not base64: {e}")))?;

    serde_json::from_slice(&bytes)
        .map_err(|e| Error::InvalidPass(format!("claims are not valid JSON: {e}")))
}

fn timestamp(secs: i64, claim: &str) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp(secs, 0)
        .ok_or_else(|| Error::InvalidPass(format!("{claim} claim out of range: {secs}")))
}
