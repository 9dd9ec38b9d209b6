//! Client certificate trust check.
//!
//! The mutual-TLS handshake is terminated by the reverse proxy in front of
//! the relay. After verifying the client certificate the proxy writes the
//! result into a header (by default `X-Client-Verified: SUCCESS`).
//!
//! # Deployment invariant
//!
//! The header is only evidence of a verified client when the relay is not
//! reachable except through that proxy, and the proxy overwrites the header
//! on every request instead of passing a client-supplied value through.
//! Nothing here can detect a deployment that breaks this; it has to be
//! guaranteed by network topology.

use anyhow::{Context, Result};
use axum::http::{HeaderMap, HeaderName};

use crate::Config;

/// Placeholder shown in logs and diagnostics when the header is absent.
pub const NOT_SET: &str = "Not Set";

/// Outcome of inspecting the trust header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustVerdict {
    /// Header present exactly once with the success sentinel.
    Verified,
    /// Header absent.
    Missing,
    /// Header present with anything else.
    Rejected(String),
}

impl TrustVerdict {
    pub fn is_verified(&self) -> bool {
        matches!(self, TrustVerdict::Verified)
    }
}

/// Which header to read and which value counts as verified.
#[derive(Debug, Clone)]
pub struct TrustPolicy {
    header: HeaderName,
    sentinel: String,
}

impl TrustPolicy {
    pub fn new(header: &str, sentinel: &str) -> Result<Self> {
        let header = HeaderName::try_from(header)
            .with_context(|| format!("Invalid trust header name: {}", header))?;

        Ok(Self {
            header,
            sentinel: sentinel.to_string(),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(&config.trust_header, &config.trust_sentinel)
    }

    pub fn header_name(&self) -> &HeaderName {
        &self.header
    }

    pub fn sentinel(&self) -> &str {
        &self.sentinel
    }

    /// Inspect the headers of one request.
    ///
    /// The comparison is exact and case-sensitive. A repeated header is
    /// rejected even if one of the copies carries the sentinel.
    pub fn evaluate(&self, headers: &HeaderMap) -> TrustVerdict {
        let mut values = headers.get_all(&self.header).iter();

        let value = match (values.next(), values.next()) {
            (None, _) => return TrustVerdict::Missing,
            (Some(_), Some(_)) => return TrustVerdict::Rejected("<multiple values>".to_string()),
            (Some(value), None) => value,
        };

        match value.to_str() {
            Ok(v) if v == self.sentinel => TrustVerdict::Verified,
            Ok(v) => TrustVerdict::Rejected(v.to_string()),
            Err(_) => TrustVerdict::Rejected("<non-ascii value>".to_string()),
        }
    }

    /// The raw header value for logs, or [`NOT_SET`].
    pub fn presented(&self, headers: &HeaderMap) -> String {
        headers
            .get(&self.header)
            .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
            .unwrap_or_else(|| NOT_SET.to_string())
    }
}
