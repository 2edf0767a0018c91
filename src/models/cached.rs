//! Responses as the cache store keeps them.

use axum::{
    body::Body,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use bytes::Bytes;

/// A finished response with its body in memory. Cheap to clone.
#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl CachedResponse {
    pub fn new(status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    /// Bytes this entry costs a size-bounded store.
    pub fn weight(&self) -> usize {
        self.body.len()
    }

    /// Same status and headers, no body (HEAD, 304).
    pub fn without_body(&self) -> Self {
        Self::new(self.status, self.headers.clone(), Bytes::new())
    }
}

impl IntoResponse for CachedResponse {
    fn into_response(self) -> Response {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}
