//! Request orchestration: dispatch, cache, fetch, transform, respond.

use crate::{
    config::AppConfig,
    errors::ProxyError,
    models::{
        cached::CachedResponse,
        params::ImageParams,
        request::RequestDescriptor,
        selection::Origin,
        upstream::ByteStream,
    },
    services::{
        body::{Buffered, CacheFill, CacheTarget, buffer_up_to},
        cache::CacheStore,
        dispatcher::dispatch,
        s3_fetcher::S3Fetcher,
        transform::TransformEngine,
        upstream::Upstream,
        url_fetcher::UrlFetcher,
    },
};
use axum::{
    body::Body,
    http::{HeaderMap, HeaderValue, Method, StatusCode, header},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use std::sync::Arc;

/// Thirty days.
const CACHE_CONTROL: &str = "public, max-age=2592000";

/// Shared, cheaply clonable proxy state handed to every request.
#[derive(Clone)]
pub struct ProxyService {
    storage: Arc<S3Fetcher>,
    url_origin: Arc<UrlFetcher>,
    engine: TransformEngine,
    cache: Arc<dyn CacheStore>,
    max_transform_bytes: usize,
    cache_max_entry_bytes: usize,
}

impl ProxyService {
    pub fn new(cfg: &AppConfig, upstream: Arc<dyn Upstream>, cache: Arc<dyn CacheStore>) -> Self {
        Self {
            storage: Arc::new(S3Fetcher::new(cfg, upstream.clone())),
            url_origin: Arc::new(UrlFetcher::new(upstream, cfg.allow_url_origin)),
            engine: TransformEngine::from_config(cfg),
            cache,
            max_transform_bytes: cfg.max_transform_bytes,
            cache_max_entry_bytes: cfg.cache_max_entry_bytes,
        }
    }

    pub async fn handle(&self, request: RequestDescriptor) -> Result<Response, ProxyError> {
        if !matches!(request.method, Method::GET | Method::HEAD) {
            tracing::debug!(method = %request.method, "method not allowed");
            return Err(ProxyError::MethodNotAllowed);
        }

        let dispatched = dispatch(&request);
        let transform = dispatched.content.transform_params();
        // A resized variant is always fetched and served whole.
        let request = if transform.is_some() {
            request.without_range()
        } else {
            request
        };
        // Ranged responses are partial; they neither read nor fill the cache.
        let cacheable = !request.has_range();

        if cacheable {
            if let Some(hit) = self.cache.lookup(&dispatched.cache_key).await {
                tracing::debug!(key = %dispatched.cache_key, "cache hit");
                let hit = if request.is_head() { hit.without_body() } else { hit };
                return Ok(hit.into_response());
            }
        }

        let (_, mut upstream) = match &dispatched.origin {
            Origin::ObjectStorage => self.storage.fetch(&request).await?,
            Origin::GenericUrl(url) => self.url_origin.fetch(url, &request).await?,
        };
        let status = upstream.status;
        let declared_len = upstream.content_length();
        let mut headers = std::mem::take(&mut upstream.headers);
        strip_hop_by_hop(&mut headers);

        // Bodiless passthrough. The body stream is dropped unread.
        if request.is_head() || status == StatusCode::NOT_MODIFIED {
            return Ok(CachedResponse::new(status, headers, Bytes::new()).into_response());
        }

        headers.remove(header::CONTENT_LENGTH);

        if !status.is_success() {
            tracing::debug!(%status, "relaying upstream error");
            return Ok(self.stream(status, headers, upstream.body, None));
        }

        if let Some(mime) = dispatched.content.mime() {
            headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(mime));
        }
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static(CACHE_CONTROL));

        let fill_key = (cacheable && status == StatusCode::OK).then(|| dispatched.cache_key.clone());
        let Some(params) = transform.filter(|_| status == StatusCode::OK) else {
            return Ok(self.stream(status, headers, upstream.body, fill_key));
        };

        if declared_len.is_some_and(|len| len > self.max_transform_bytes) {
            tracing::warn!(
                key = %dispatched.cache_key,
                declared_len = ?declared_len,
                limit = self.max_transform_bytes,
                "image too large to transform, streaming original"
            );
            return Ok(self.stream(status, headers, upstream.body, fill_key));
        }

        let original = match buffer_up_to(upstream.body, self.max_transform_bytes)
            .await
            .map_err(|err| ProxyError::Transport(format!("reading upstream body: {err}")))?
        {
            Buffered::Complete(bytes) => bytes,
            Buffered::Overflow(body) => {
                tracing::warn!(
                    key = %dispatched.cache_key,
                    limit = self.max_transform_bytes,
                    "image too large to transform, streaming original"
                );
                return Ok(self.stream(status, headers, body, fill_key));
            }
        };

        let body = match self.transform(&original, params, &dispatched.cache_key).await {
            Some(transformed) => {
                mark_variant(&mut headers, &params);
                transformed
            }
            None => original,
        };

        let response = CachedResponse::new(status, headers, body);
        if let Some(key) = fill_key.filter(|_| response.weight() <= self.cache_max_entry_bytes) {
            let cache = self.cache.clone();
            let entry = response.clone();
            tokio::spawn(async move {
                cache.put(key, entry).await;
            });
        }

        Ok(response.into_response())
    }

    /// Relay `body` as it arrives. With a `fill_key` the bytes are also
    /// copied into the cache once the client has read them all.
    fn stream(
        &self,
        status: StatusCode,
        headers: HeaderMap,
        body: ByteStream,
        fill_key: Option<String>,
    ) -> Response {
        let body = match fill_key {
            Some(key) => {
                let target = CacheTarget {
                    cache: self.cache.clone(),
                    key,
                    status,
                    headers: headers.clone(),
                };
                Body::from_stream(CacheFill::new(body, self.cache_max_entry_bytes, target))
            }
            None => Body::from_stream(body),
        };
        let mut response = Response::new(body);
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        response
    }

    /// Run the engine off the async workers. `None` means serve the original.
    async fn transform(&self, original: &Bytes, params: ImageParams, key: &str) -> Option<Bytes> {
        let engine = self.engine;
        let input = original.clone();
        match tokio::task::spawn_blocking(move || engine.apply(input, &params)).await {
            Ok(Ok(transformed)) => Some(transformed),
            Ok(Err(err)) => {
                let err = ProxyError::from(err);
                tracing::warn!(error = %err, key, "serving original bytes");
                None
            }
            Err(err) => {
                tracing::warn!(error = %err, key, "transform task failed, serving original bytes");
                None
            }
        }
    }
}

/// Connection-scoped headers are never relayed.
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in [header::CONNECTION, header::TRANSFER_ENCODING] {
        headers.remove(name);
    }
    headers.remove("keep-alive");
}

/// Byte ranges and dates of the original do not describe a resized body, and
/// its validator must not match the original's.
fn mark_variant(headers: &mut HeaderMap, params: &ImageParams) {
    for name in [header::ACCEPT_RANGES, header::CONTENT_RANGE, header::LAST_MODIFIED] {
        headers.remove(name);
    }
    match headers.get(header::ETAG).and_then(|etag| variant_etag(etag, params)) {
        Some(variant) => {
            headers.insert(header::ETAG, variant);
        }
        None => {
            headers.remove(header::ETAG);
        }
    }
}

/// `"abc"` resized with `w=800` becomes `W/"abc-w800"`. Weak validators never
/// satisfy `If-Range`.
fn variant_etag(etag: &HeaderValue, params: &ImageParams) -> Option<HeaderValue> {
    let raw = etag.to_str().ok()?;
    let opaque = raw.strip_prefix("W/").unwrap_or(raw).trim_matches('"');
    let suffix: String = params
        .cache_params()
        .iter()
        .map(|(name, value)| format!("{name}{value}"))
        .collect();
    HeaderValue::from_str(&format!("W/\"{opaque}-{suffix}\"")).ok()
}
