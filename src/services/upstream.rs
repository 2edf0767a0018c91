use crate::{
    errors::FetchError,
    models::upstream::{SignedRequest, UpstreamResponse},
};
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use std::{io, time::Duration};

/// Sends prepared requests to an origin.
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Send `request` and return once status and headers are in. The body is
    /// left unread; dropping the response abandons the transfer.
    async fn send(&self, request: SignedRequest) -> Result<UpstreamResponse, FetchError>;
}

/// `reqwest`-backed transport shared by every request.
#[derive(Clone)]
pub struct ReqwestUpstream {
    client: reqwest::Client,
}

impl ReqwestUpstream {
    pub fn new(timeout: Option<Duration>) -> Result<Self, FetchError> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Upstream for ReqwestUpstream {
    async fn send(&self, request: SignedRequest) -> Result<UpstreamResponse, FetchError> {
        tracing::debug!(method = %request.method, url = %request.url, "sending upstream request");

        let resp = self
            .client
            .request(request.method, request.url)
            .headers(request.headers)
            .send()
            .await?;

        let status = resp.status();
        let headers = resp.headers().clone();
        let body = resp.bytes_stream().map_err(io::Error::other).boxed();

        Ok(UpstreamResponse::new(status, headers, body))
    }
}
