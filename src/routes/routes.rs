//! The proxy owns the whole URL space: there are no fixed routes, and every
//! method on every path reaches `proxy_request`. Method filtering happens in
//! the service so rejected methods get the same empty 405 everywhere.

use crate::{handlers::proxy_handlers::proxy_request, services::proxy::ProxyService};
use axum::Router;

/// Build the router. The caller attaches `ProxyService` with `with_state`.
pub fn routes() -> Router<ProxyService> {
    Router::new().fallback(proxy_request)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{
        cache::MemoryCache,
        test_support::{ScriptedUpstream, config_with, response},
    };
    use axum::http::{StatusCode, header};
    use std::sync::Arc;
    use tokio::net::TcpListener;

    /// Serve the router on an ephemeral port and return its base URL.
    async fn spawn_app(upstream: Arc<ScriptedUpstream>) -> String {
        let cfg = config_with(&[("BUCKET_NAME", "media")]);
        let service = ProxyService::new(&cfg, upstream, Arc::new(MemoryCache::new(8, 1 << 20)));
        let app = routes().with_state(service);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_any_path_reaches_the_proxy() {
        let upstream = ScriptedUpstream::new(vec![Ok(response(200, &[], "hello"))]);
        let base = spawn_app(upstream.clone()).await;

        let resp = reqwest::get(format!("{}/deeply/nested/file.txt", base)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_TYPE], "text/plain");
        assert_eq!(resp.text().await.unwrap(), "hello");
        assert_eq!(
            upstream.sent()[0].url.as_str(),
            "https://media.s3.us-west-004.backblazeb2.com/deeply/nested/file.txt"
        );
    }

    #[tokio::test]
    async fn test_post_is_method_not_allowed() {
        let upstream = ScriptedUpstream::new(vec![]);
        let base = spawn_app(upstream.clone()).await;

        let resp = reqwest::Client::new()
            .post(format!("{}/a.png", base))
            .body("payload")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert!(resp.bytes().await.unwrap().is_empty());
        assert_eq!(upstream.calls(), 0);
    }
}
