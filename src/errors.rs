use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

/// Request-level failure kinds.
///
/// Only the transport kinds and malformed requests turn into error bodies.
/// `RangeIntegrityExhausted` and `UnprocessableImage` are logged and resolved
/// into a degraded response, so they never reach `into_response`.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("method not allowed")]
    MethodNotAllowed,
    #[error("listing a bucket is not allowed")]
    ListBucketDenied,
    #[error("url origin is disabled")]
    OriginDisabled,
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("upstream transport failed: {0}")]
    Transport(String),
    #[error("upstream timed out: {0}")]
    Timeout(String),
    #[error("range request for {url} never returned content-range after {attempts} attempts")]
    RangeIntegrityExhausted { url: String, attempts: u32 },
    #[error("unprocessable image: {0}")]
    UnprocessableImage(String),
}

/// Errors raised while fetching origin bytes.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("listing a bucket is not allowed")]
    ListBucketDenied,
    #[error("url origin is disabled")]
    OriginDisabled,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("timed out: {0}")]
    Timeout(String),
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout(err.to_string())
        } else {
            FetchError::Transport(err.to_string())
        }
    }
}

impl From<FetchError> for ProxyError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::ListBucketDenied => ProxyError::ListBucketDenied,
            FetchError::OriginDisabled => ProxyError::OriginDisabled,
            FetchError::Transport(msg) => ProxyError::Transport(msg),
            FetchError::Timeout(msg) => ProxyError::Timeout(msg),
        }
    }
}

/// Errors raised by the transform engine.
#[derive(Debug, Error)]
pub enum TransformError {
    #[error("unprocessable image: {0}")]
    UnprocessableImage(String),
    #[error("encode failed: {0}")]
    EncodeFailed(String),
    #[error("resize to {width}x{height} exceeds the pixel budget")]
    TooLarge { width: u32, height: u32 },
}

impl From<TransformError> for ProxyError {
    fn from(err: TransformError) -> Self {
        ProxyError::UnprocessableImage(err.to_string())
    }
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            ProxyError::ListBucketDenied | ProxyError::OriginDisabled => StatusCode::NOT_FOUND,
            ProxyError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::Transport(_) => StatusCode::BAD_GATEWAY,
            ProxyError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::RangeIntegrityExhausted { .. } | ProxyError::UnprocessableImage(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    status: u16,
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status();
        match self {
            // Policy rejections carry no body.
            ProxyError::MethodNotAllowed
            | ProxyError::ListBucketDenied
            | ProxyError::OriginDisabled => status.into_response(),
            other => {
                if status.is_server_error() {
                    tracing::error!(error = %other, "request failed");
                }
                let body = Json(ErrorBody {
                    error: other.to_string(),
                    status: status.as_u16(),
                });
                (status, body).into_response()
            }
        }
    }
}
