//! Signed fetches from the S3-compatible bucket.

use crate::{
    config::{AppConfig, BucketAddressing},
    errors::{FetchError, ProxyError},
    models::{
        request::RequestDescriptor,
        upstream::{SignedRequest, UpstreamResponse},
    },
    services::{signer::SigV4Signer, upstream::Upstream},
};
use axum::http::{HeaderMap, Method};
use std::sync::Arc;
use url::Url;

/// Total attempts for a ranged request, first one included.
pub const RANGE_ATTEMPTS: u32 = 3;

/// Present on the inbound request but rewritten or removed before the
/// request reaches storage, so they cannot be signed.
const UNSIGNABLE_HEADERS: &[&str] = &["x-forwarded-proto", "x-real-ip", "accept-encoding"];

/// Headers added by the fronting CDN.
const EDGE_HEADER_PREFIX: &str = "cf-";

/// Outcome of one ranged attempt.
enum RangeAttempt {
    /// Final answer: it carried `content-range`, or failed outright.
    Success(UpstreamResponse),
    /// Full object came back for a ranged request; already cancelled.
    Retry,
    /// Still no `content-range` on the last attempt; returned as-is.
    GiveUp(UpstreamResponse),
}

pub struct S3Fetcher {
    upstream: Arc<dyn Upstream>,
    signer: SigV4Signer,
    bucket: BucketAddressing,
    endpoint: String,
    allow_list_bucket: bool,
    allowed_headers: Option<Vec<String>>,
}

impl S3Fetcher {
    pub fn new(cfg: &AppConfig, upstream: Arc<dyn Upstream>) -> Self {
        let endpoint = cfg
            .storage_endpoint
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .trim_end_matches('/')
            .to_string();

        Self {
            upstream,
            signer: SigV4Signer::from_config(cfg),
            bucket: cfg.bucket.clone(),
            endpoint,
            allow_list_bucket: cfg.allow_list_bucket,
            allowed_headers: cfg.allowed_headers.clone(),
        }
    }

    /// Sign and send the request, returning what was sent alongside the
    /// response. HEAD goes out as GET; the caller drops the body.
    pub async fn fetch(
        &self,
        request: &RequestDescriptor,
    ) -> Result<(SignedRequest, UpstreamResponse), FetchError> {
        if !self.allow_list_bucket && self.is_list_request(request.url.path()) {
            tracing::debug!(path = request.url.path(), "refusing bucket listing");
            return Err(FetchError::ListBucketDenied);
        }

        let url = self.resolve_upstream(&request.url)?;
        let headers = self.filter_headers(&request.headers);
        let signed = self.signer.sign(Method::GET, url, headers);

        let response = if signed.has_range() {
            self.fetch_range(&signed).await?
        } else {
            self.upstream.send(signed.clone()).await?
        };

        tracing::debug!(url = %signed.url, status = %response.status, "storage responded");
        Ok((signed, response))
    }

    /// Upstream URL: https on 443, host picked by the addressing mode. Path
    /// and query are carried over unchanged.
    pub fn resolve_upstream(&self, url: &Url) -> Result<Url, FetchError> {
        let host = match &self.bucket {
            BucketAddressing::PathStyle => self.endpoint.clone(),
            BucketAddressing::HostStyle => {
                let label = url
                    .host_str()
                    .and_then(|h| h.split('.').next())
                    .unwrap_or_default();
                format!("{}.{}", label, self.endpoint)
            }
            BucketAddressing::NamedBucket(name) => format!("{}.{}", name, self.endpoint),
        };

        let mut upstream = url.clone();
        upstream.set_fragment(None);
        upstream
            .set_scheme("https")
            .map_err(|_| FetchError::Transport(format!("cannot switch `{}` to https", url)))?;
        upstream
            .set_port(Some(443))
            .map_err(|_| FetchError::Transport(format!("cannot set port on `{}`", url)))?;
        upstream
            .set_host(Some(&host))
            .map_err(|err| FetchError::Transport(format!("invalid upstream host `{}`: {}", host, err)))?;
        Ok(upstream)
    }

    /// Whether `path` would address the bucket itself rather than an object.
    pub fn is_list_request(&self, path: &str) -> bool {
        let path = path.strip_prefix('/').unwrap_or(path);
        let path = path.strip_suffix('/').unwrap_or(path);
        match self.bucket {
            BucketAddressing::PathStyle => path.split('/').count() < 2,
            _ => path.is_empty(),
        }
    }

    /// Drop everything that would break the signature once the request is
    /// in flight, then apply the allow-list if one is configured.
    pub fn filter_headers(&self, headers: &HeaderMap) -> HeaderMap {
        let mut filtered = HeaderMap::new();
        for (name, value) in headers {
            let key = name.as_str();
            if UNSIGNABLE_HEADERS.contains(&key) || key.starts_with(EDGE_HEADER_PREFIX) {
                continue;
            }
            if let Some(allowed) = &self.allowed_headers {
                if !allowed.iter().any(|a| a == key) {
                    continue;
                }
            }
            filtered.append(name.clone(), value.clone());
        }
        filtered
    }

    /// Some intermediaries answer a ranged GET with the whole object. Retry
    /// until `content-range` shows up, a request fails, or attempts run out.
    async fn fetch_range(&self, signed: &SignedRequest) -> Result<UpstreamResponse, FetchError> {
        let mut attempt = 1;
        loop {
            let response = self.upstream.send(signed.clone()).await?;
            match classify_range_attempt(response, attempt) {
                RangeAttempt::Success(response) => {
                    if attempt > 1 && response.has_content_range() {
                        tracing::info!(url = %signed.url, attempt, "range retry succeeded");
                    }
                    return Ok(response);
                }
                RangeAttempt::Retry => {
                    tracing::warn!(
                        url = %signed.url,
                        attempt,
                        remaining = RANGE_ATTEMPTS - attempt,
                        "range requested but response has no content-range, retrying"
                    );
                    attempt += 1;
                }
                RangeAttempt::GiveUp(response) => {
                    let err = ProxyError::RangeIntegrityExhausted {
                        url: signed.url.to_string(),
                        attempts: attempt,
                    };
                    tracing::warn!(error = %err, "returning response without content-range");
                    return Ok(response);
                }
            }
        }
    }
}

fn classify_range_attempt(response: UpstreamResponse, attempt: u32) -> RangeAttempt {
    if response.has_content_range() || !response.status.is_success() {
        return RangeAttempt::Success(response);
    }
    if attempt >= RANGE_ATTEMPTS {
        return RangeAttempt::GiveUp(response);
    }
    // Dropping the unread body aborts the transfer.
    drop(response);
    RangeAttempt::Retry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::test_support::{
        LogCapture, ScriptedUpstream, config_with, headers, response, response_with_drop_flag,
        test_config,
    };
    use axum::http::{StatusCode, header};
    use std::sync::atomic::{AtomicBool, Ordering};

    fn fetcher(cfg: &AppConfig, upstream: Arc<ScriptedUpstream>) -> S3Fetcher {
        S3Fetcher::new(cfg, upstream)
    }

    fn get(target: &str, header_pairs: &[(&str, &str)]) -> RequestDescriptor {
        let url = Url::parse(&format!("http://localhost:8787{}", target)).unwrap();
        RequestDescriptor::new(Method::GET, url, headers(header_pairs))
    }

    const RANGE: &[(&str, &str)] = &[("range", "bytes=0-9")];
    const PARTIAL: &[(&str, &str)] = &[("content-range", "bytes 0-9/1000")];

    #[test]
    fn test_resolve_path_style() {
        let f = fetcher(&test_config(), ScriptedUpstream::new(vec![]));
        let url = Url::parse("http://localhost:8787/bucket/photo.jpg?w=80").unwrap();
        assert_eq!(
            f.resolve_upstream(&url).unwrap().as_str(),
            "https://s3.us-west-004.backblazeb2.com/bucket/photo.jpg?w=80"
        );
    }

    #[test]
    fn test_resolve_host_style() {
        let cfg = config_with(&[("BUCKET_NAME", "$host")]);
        let f = fetcher(&cfg, ScriptedUpstream::new(vec![]));
        let url = Url::parse("http://photos.img.example.com/a/b.png").unwrap();
        assert_eq!(
            f.resolve_upstream(&url).unwrap().as_str(),
            "https://photos.s3.us-west-004.backblazeb2.com/a/b.png"
        );
    }

    #[test]
    fn test_resolve_named_bucket_strips_endpoint_scheme() {
        let cfg = config_with(&[
            ("BUCKET_NAME", "media"),
            ("STORAGE_ENDPOINT", "https://s3.eu-central-003.backblazeb2.com/"),
        ]);
        let f = fetcher(&cfg, ScriptedUpstream::new(vec![]));
        let url = Url::parse("http://cdn.example.com:8080/x.webp").unwrap();
        assert_eq!(
            f.resolve_upstream(&url).unwrap().as_str(),
            "https://media.s3.eu-central-003.backblazeb2.com/x.webp"
        );
    }

    #[test]
    fn test_list_guard_per_addressing_mode() {
        let path_style = fetcher(&test_config(), ScriptedUpstream::new(vec![]));
        assert!(path_style.is_list_request("/"));
        assert!(path_style.is_list_request("/bucket"));
        assert!(path_style.is_list_request("/bucket/"));
        assert!(!path_style.is_list_request("/bucket/a.png"));

        let named = fetcher(&config_with(&[("BUCKET_NAME", "media")]), ScriptedUpstream::new(vec![]));
        assert!(named.is_list_request("/"));
        assert!(!named.is_list_request("/a.png"));
    }

    #[tokio::test]
    async fn test_list_request_is_denied_without_upstream_call() {
        let upstream = ScriptedUpstream::new(vec![]);
        let f = fetcher(&test_config(), upstream.clone());
        let err = f.fetch(&get("/", &[])).await.unwrap_err();
        assert!(matches!(err, FetchError::ListBucketDenied));
        assert_eq!(upstream.calls(), 0);
    }

    #[tokio::test]
    async fn test_list_request_allowed_by_config() {
        let upstream = ScriptedUpstream::new(vec![Ok(response(200, &[], "<ListBucketResult/>"))]);
        let cfg = config_with(&[("ALLOW_LIST_BUCKET", "true")]);
        let f = fetcher(&cfg, upstream.clone());
        let (_, resp) = f.fetch(&get("/bucket/", &[])).await.unwrap();
        assert_eq!(resp.status, StatusCode::OK);
        assert_eq!(upstream.calls(), 1);
    }

    #[test]
    fn test_filter_headers_drops_unsignable() {
        let f = fetcher(&test_config(), ScriptedUpstream::new(vec![]));
        let filtered = f.filter_headers(&headers(&[
            ("x-real-ip", "10.0.0.1"),
            ("x-forwarded-proto", "https"),
            ("accept-encoding", "gzip, br"),
            ("cf-connecting-ip", "10.0.0.1"),
            ("cf-ray", "abc"),
            ("accept", "image/webp"),
            ("if-none-match", "\"etag\""),
        ]));
        assert_eq!(filtered.len(), 2);
        assert!(filtered.contains_key(header::ACCEPT));
        assert!(filtered.contains_key(header::IF_NONE_MATCH));
    }

    #[test]
    fn test_filter_headers_applies_allow_list() {
        let cfg = config_with(&[("ALLOWED_HEADERS", "range,if-none-match")]);
        let f = fetcher(&cfg, ScriptedUpstream::new(vec![]));
        let filtered = f.filter_headers(&headers(&[
            ("range", "bytes=0-1"),
            ("accept", "*/*"),
            ("if-none-match", "\"x\""),
        ]));
        assert_eq!(filtered.len(), 2);
        assert!(!filtered.contains_key(header::ACCEPT));
    }

    #[tokio::test]
    async fn test_head_is_sent_as_signed_get() {
        let upstream = ScriptedUpstream::new(vec![Ok(response(200, &[], "x"))]);
        let f = fetcher(&test_config(), upstream.clone());
        let url = Url::parse("http://localhost:8787/bucket/a.png").unwrap();
        let head = RequestDescriptor::new(Method::HEAD, url, HeaderMap::new());

        let (signed, _) = f.fetch(&head).await.unwrap();
        assert_eq!(signed.method, Method::GET);
        assert!(signed.headers.contains_key(header::AUTHORIZATION));
        assert_eq!(upstream.sent()[0].method, Method::GET);
    }

    #[tokio::test]
    async fn test_range_retry_returns_first_good_response() {
        let first = Arc::new(AtomicBool::new(false));
        let second = Arc::new(AtomicBool::new(false));
        let third = Arc::new(AtomicBool::new(false));
        let upstream = ScriptedUpstream::new(vec![
            Ok(response_with_drop_flag(200, &[], first.clone())),
            Ok(response_with_drop_flag(200, &[], second.clone())),
            Ok(response_with_drop_flag(206, PARTIAL, third.clone())),
        ]);
        let f = fetcher(&test_config(), upstream.clone());

        let (_, resp) = f.fetch(&get("/bucket/big.bin", RANGE)).await.unwrap();
        assert_eq!(resp.status, StatusCode::PARTIAL_CONTENT);
        assert_eq!(upstream.calls(), 3);
        assert!(first.load(Ordering::SeqCst));
        assert!(second.load(Ordering::SeqCst));
        assert!(!third.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_range_retry_exhaustion_returns_last_response() {
        let last = Arc::new(AtomicBool::new(false));
        let upstream = ScriptedUpstream::new(vec![
            Ok(response(200, &[], "full")),
            Ok(response(200, &[], "full")),
            Ok(response_with_drop_flag(200, &[], last.clone())),
            Ok(response(206, PARTIAL, "never reached")),
        ]);
        let f = fetcher(&test_config(), upstream.clone());
        let logs = LogCapture::warnings();

        let (_, resp) = f.fetch(&get("/bucket/big.bin", RANGE)).await.unwrap();
        assert_eq!(resp.status, StatusCode::OK);
        assert!(!resp.has_content_range());
        assert_eq!(upstream.calls(), RANGE_ATTEMPTS as usize);
        assert!(!last.load(Ordering::SeqCst));

        let logs = logs.contents();
        assert!(logs.contains("WARN"));
        assert!(logs.contains("returning response without content-range"));
        assert!(logs.contains("/bucket/big.bin"));
    }

    #[tokio::test]
    async fn test_range_failure_status_stops_retrying() {
        let upstream = ScriptedUpstream::new(vec![
            Ok(response(416, &[], "")),
            Ok(response(206, PARTIAL, "unused")),
        ]);
        let f = fetcher(&test_config(), upstream.clone());

        let (_, resp) = f.fetch(&get("/bucket/big.bin", RANGE)).await.unwrap();
        assert_eq!(resp.status, StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(upstream.calls(), 1);
    }

    #[tokio::test]
    async fn test_unranged_request_is_sent_once() {
        let upstream = ScriptedUpstream::new(vec![Ok(response(200, &[], "whole"))]);
        let f = fetcher(&test_config(), upstream.clone());
        let (signed, resp) = f.fetch(&get("/bucket/a.txt", &[])).await.unwrap();
        assert!(!signed.has_range());
        assert_eq!(resp.status, StatusCode::OK);
        assert_eq!(upstream.calls(), 1);
    }

    #[tokio::test]
    async fn test_transport_error_on_retry_propagates() {
        let upstream = ScriptedUpstream::new(vec![
            Ok(response(200, &[], "full")),
            Err(FetchError::Timeout("slow".into())),
        ]);
        let f = fetcher(&test_config(), upstream.clone());
        let err = f.fetch(&get("/bucket/big.bin", RANGE)).await.unwrap_err();
        assert!(matches!(err, FetchError::Timeout(_)));
        assert_eq!(upstream.calls(), 2);
    }
}
