//! What goes to, and comes back from, the origin.

use axum::http::{HeaderMap, Method, StatusCode, header};
use bytes::Bytes;
use futures::stream::BoxStream;
use std::{fmt, io};
use url::Url;

/// Streaming response body. Dropping it cancels the underlying transfer.
pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

/// A fully prepared outgoing request (signed, for object storage).
#[derive(Debug, Clone)]
pub struct SignedRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
}

impl SignedRequest {
    pub fn has_range(&self) -> bool {
        self.headers.contains_key(header::RANGE)
    }
}

/// Status, headers and a not-yet-read body from the origin.
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ByteStream,
}

impl UpstreamResponse {
    pub fn new(status: StatusCode, headers: HeaderMap, body: ByteStream) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    /// Response whose body is already in memory.
    #[cfg(test)]
    pub fn from_bytes(status: StatusCode, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        use futures::StreamExt;

        let body: Bytes = body.into();
        Self::new(status, headers, futures::stream::once(async move { Ok(body) }).boxed())
    }

    pub fn has_content_range(&self) -> bool {
        self.headers.contains_key(header::CONTENT_RANGE)
    }

    /// Declared `content-length`, when present and numeric.
    pub fn content_length(&self) -> Option<usize> {
        self.headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
    }
}

impl fmt::Debug for UpstreamResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}
