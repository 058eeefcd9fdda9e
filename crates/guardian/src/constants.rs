//! Credential service endpoints and wire names
//!
//! These identify the public service surface. The bearer token that
//! authorizes calls is configuration, never a constant.

/// Production credential service
pub const DEFAULT_BASE_URL: &str = "https://vpn.mozilla.org";

/// Issues a proxy pass (POST). Usage rides along in the response headers.
pub const TOKEN_PATH: &str = "/api/v1/fpn/token";

/// Reports the current usage snapshot without issuing a pass (GET)
pub const USAGE_PATH: &str = "/api/v1/fpn/usage";

/// Quota size in bytes, decimal string
pub const QUOTA_LIMIT_HEADER: &str = "x-quota-limit";

/// Bytes left in the current period, decimal string
pub const QUOTA_REMAINING_HEADER: &str = "x-quota-remaining";

/// RFC 3339 instant at which the quota period rolls over
pub const QUOTA_RESET_HEADER: &str = "x-quota-reset";
