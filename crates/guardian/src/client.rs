//! HTTP implementation of the credential service
//!
//! Two calls, both authorized with the account's bearer token:
//! 1. `POST {base}/api/v1/fpn/token` issues a pass as `{"token": "<jwt>"}`
//! 2. `GET {base}/api/v1/fpn/usage` reports usage only
//!
//! Both carry the usage snapshot in `X-Quota-*` response headers. A pass
//! response with a non-success status is still a response: the status, body
//! and any usage headers are handed to the caller instead of an error.

use std::future::Future;
use std::pin::Pin;

use common::Secret;
use reqwest::header::HeaderMap;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::constants::{
    QUOTA_LIMIT_HEADER, QUOTA_REMAINING_HEADER, QUOTA_RESET_HEADER, TOKEN_PATH, USAGE_PATH,
};
use crate::error::{Error, Result};
use crate::pass::ProxyPass;
use crate::service::{CredentialService, FetchOptions, PassResponse};
use crate::usage::ProxyUsage;

/// Body of a successful pass response.
#[derive(Debug, Deserialize)]
struct TokenBody {
    token: String,
}

/// Credential service client over reqwest.
pub struct GuardianClient {
    http: reqwest::Client,
    base_url: String,
    auth_token: Secret<String>,
}

impl GuardianClient {
    pub fn new(
        http: reqwest::Client,
        base_url: impl Into<String>,
        auth_token: Secret<String>,
    ) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_owned();
        Self {
            http,
            base_url,
            auth_token,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn request_pass(&self, options: &FetchOptions) -> Result<PassResponse> {
        let response = self
            .http
            .post(format!("{}{TOKEN_PATH}", self.base_url))
            .bearer_auth(self.auth_token.expose())
            .timeout(options.timeout)
            .send()
            .await
            .map_err(|e| Error::Http(format!("pass request failed: {e}")))?;

        let status = response.status();
        let usage = usage_from_headers(response.headers());
        debug!(
            status = status.as_u16(),
            reason = options.reason.label(),
            has_usage = usage.is_some(),
            "pass response received"
        );

        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| String::from("<no body>"));
            return Ok(PassResponse {
                status: status.as_u16(),
                error: Some(body),
                pass: None,
                usage,
            });
        }

        // A malformed body on a 2xx is an issuance failure, not a transport one
        let (pass, error) = match response.json::<TokenBody>().await {
            Ok(body) => match ProxyPass::from_token(body.token) {
                Ok(pass) => (Some(pass), None),
                Err(e) => (None, Some(e.to_string())),
            },
            Err(e) => (None, Some(format!("invalid pass body: {e}"))),
        };

        Ok(PassResponse {
            status: status.as_u16(),
            error,
            pass,
            usage,
        })
    }

    async fn request_usage(&self, options: &FetchOptions) -> Result<ProxyUsage> {
        let response = self
            .http
            .get(format!("{}{USAGE_PATH}", self.base_url))
            .bearer_auth(self.auth_token.expose())
            .timeout(options.timeout)
            .send()
            .await
            .map_err(|e| Error::Http(format!("usage request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| String::from("<no body>"));
            return Err(Error::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        usage_from_headers(response.headers())
            .ok_or_else(|| Error::InvalidUsage("usage response carried no quota headers".into()))
    }
}

impl CredentialService for GuardianClient {
    fn fetch_proxy_pass<'a>(
        &'a self,
        options: &'a FetchOptions,
    ) -> Pin<Box<dyn Future<Output = Result<PassResponse>> + Send + 'a>> {
        Box::pin(self.request_pass(options))
    }

    fn fetch_proxy_usage<'a>(
        &'a self,
        options: &'a FetchOptions,
    ) -> Pin<Box<dyn Future<Output = Result<ProxyUsage>> + Send + 'a>> {
        Box::pin(self.request_usage(options))
    }
}

/// Read the `X-Quota-*` headers. Missing headers mean no snapshot;
/// malformed ones are logged and also mean no snapshot.
fn usage_from_headers(headers: &HeaderMap) -> Option<ProxyUsage> {
    let (max, remaining, reset) = (
        header_str(headers, QUOTA_LIMIT_HEADER)?,
        header_str(headers, QUOTA_REMAINING_HEADER)?,
        header_str(headers, QUOTA_RESET_HEADER)?,
    );
    match ProxyUsage::parse(max, remaining, reset) {
        Ok(usage) => Some(usage),
        Err(e) => {
            warn!(error = %e, "ignoring malformed quota headers");
            None
        }
    }
}

fn header_str<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}
