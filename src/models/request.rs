//! The inbound request as seen by the proxy core.

use crate::errors::ProxyError;
use axum::http::{HeaderMap, Method, Uri, header};
use url::Url;

/// Method, absolute URL and headers of an inbound request.
///
/// Built once by the HTTP handler and never mutated afterwards.
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
}

impl RequestDescriptor {
    pub fn new(method: Method, url: Url, headers: HeaderMap) -> Self {
        Self {
            method,
            url,
            headers,
        }
    }

    /// Rebuild the absolute URL from the request target and the `Host` header.
    ///
    /// Origin-form targets (`/path?query`) are resolved against
    /// `http://<host>`; absolute-form targets are used as-is.
    pub fn from_parts(method: Method, uri: &Uri, headers: HeaderMap) -> Result<Self, ProxyError> {
        let raw = if uri.scheme().is_some() && uri.authority().is_some() {
            uri.to_string()
        } else {
            let host = headers
                .get(header::HOST)
                .and_then(|v| v.to_str().ok())
                .filter(|h| !h.is_empty())
                .unwrap_or("localhost");
            let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
            format!("http://{}{}", host, path_and_query)
        };

        let url = Url::parse(&raw)
            .map_err(|err| ProxyError::InvalidRequest(format!("cannot parse `{}`: {}", raw, err)))?;
        Ok(Self::new(method, url, headers))
    }

    pub fn is_head(&self) -> bool {
        self.method == Method::HEAD
    }

    /// True when the client asked for a byte range.
    pub fn has_range(&self) -> bool {
        self.headers.contains_key(header::RANGE)
    }

    /// The same request asking for the whole object. Byte offsets into the
    /// original say nothing about a resized variant.
    pub fn without_range(mut self) -> Self {
        self.headers.remove(header::RANGE);
        self.headers.remove(header::IF_RANGE);
        self
    }
}
