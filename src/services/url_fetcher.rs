//! Unsigned fetches of absolute URLs embedded in the request path.

use crate::{
    errors::FetchError,
    models::{
        request::RequestDescriptor,
        upstream::{SignedRequest, UpstreamResponse},
    },
    services::upstream::Upstream,
};
use axum::http::{HeaderMap, Method};
use std::sync::Arc;
use url::Url;

/// Request headers passed on to a third-party origin. Nothing else leaves
/// the proxy, credentials and cookies included.
const FORWARDED_HEADERS: &[&str] = &["accept", "if-none-match", "if-modified-since", "range"];

pub struct UrlFetcher {
    upstream: Arc<dyn Upstream>,
    enabled: bool,
}

impl UrlFetcher {
    pub fn new(upstream: Arc<dyn Upstream>, enabled: bool) -> Self {
        Self { upstream, enabled }
    }

    pub async fn fetch(
        &self,
        target: &Url,
        request: &RequestDescriptor,
    ) -> Result<(SignedRequest, UpstreamResponse), FetchError> {
        if !self.enabled {
            tracing::debug!(url = %target, "url origin disabled");
            return Err(FetchError::OriginDisabled);
        }

        let mut headers = HeaderMap::new();
        for (name, value) in &request.headers {
            if FORWARDED_HEADERS.contains(&name.as_str()) {
                headers.append(name.clone(), value.clone());
            }
        }

        let outgoing = SignedRequest {
            method: Method::GET,
            url: target.clone(),
            headers,
        };
        let response = self.upstream.send(outgoing.clone()).await?;
        tracing::debug!(url = %target, status = %response.status, "url origin responded");
        Ok((outgoing, response))
    }
}
