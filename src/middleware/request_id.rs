//! Correlation ids.
//!
//! An inbound `X-Request-ID` is reused verbatim; otherwise a random 128-bit
//! value is rendered as 32 lowercase hex digits. The id is echoed on the
//! response and stored in the request extensions as a [`RequestId`].

use std::fmt;

use http::HeaderMap;
use http::header::HeaderName;

pub const REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");

/// The correlation id of one request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestId(String);

impl RequestId {
    /// Reuses a non-empty inbound `X-Request-ID`, or generates a fresh one.
    pub fn resolve(headers: &HeaderMap) -> Self {
        headers
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(|v| Self(v.to_owned()))
            .unwrap_or_else(Self::generate)
    }

    pub fn generate() -> Self {
        Self(format!("{:032x}", rand::random::<u128>()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
