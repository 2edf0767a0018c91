//! Upstream body handling: bounded buffering and streaming cache fills.

use crate::{
    models::{cached::CachedResponse, upstream::ByteStream},
    services::cache::CacheStore,
};
use axum::http::{HeaderMap, StatusCode};
use bytes::Bytes;
use futures::{Stream, StreamExt, stream};
use std::{
    io,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

/// Outcome of reading a body into memory under a byte limit.
pub enum Buffered {
    Complete(Bytes),
    /// The limit was crossed. The stream replays what was read, then the rest.
    Overflow(ByteStream),
}

/// Read `body` into memory unless it grows past `limit` bytes.
pub async fn buffer_up_to(mut body: ByteStream, limit: usize) -> io::Result<Buffered> {
    let mut chunks = Vec::new();
    let mut len = 0usize;
    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        len += chunk.len();
        chunks.push(chunk);
        if len > limit {
            let replay = stream::iter(chunks.into_iter().map(Ok::<_, io::Error>)).chain(body).boxed();
            return Ok(Buffered::Overflow(replay));
        }
    }
    Ok(Buffered::Complete(join(chunks)))
}

fn join(mut chunks: Vec<Bytes>) -> Bytes {
    if chunks.len() == 1 {
        return chunks.pop().unwrap_or_default();
    }
    Bytes::from(chunks.concat())
}

/// Where a streamed response lands once it has been read to the end.
pub struct CacheTarget {
    pub cache: Arc<dyn CacheStore>,
    pub key: String,
    pub status: StatusCode,
    pub headers: HeaderMap,
}

/// Passes chunks through untouched while keeping a copy of up to `limit`
/// bytes. A body that ends cleanly within the limit is written to the cache on
/// a detached task. Overflow, a body error or an early drop writes nothing.
pub struct CacheFill {
    inner: ByteStream,
    copy: Option<Vec<Bytes>>,
    len: usize,
    limit: usize,
    target: Option<CacheTarget>,
}

impl CacheFill {
    pub fn new(inner: ByteStream, limit: usize, target: CacheTarget) -> Self {
        Self {
            inner,
            copy: Some(Vec::new()),
            len: 0,
            limit,
            target: Some(target),
        }
    }

    fn finish(&mut self) {
        let (Some(chunks), Some(target)) = (self.copy.take(), self.target.take()) else {
            return;
        };
        let entry = CachedResponse::new(target.status, target.headers, join(chunks));
        tokio::spawn(async move {
            target.cache.put(target.key, entry).await;
        });
    }
}

impl Stream for CacheFill {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match this.inner.poll_next_unpin(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                if let Some(copy) = this.copy.as_mut() {
                    this.len += chunk.len();
                    if this.len > this.limit {
                        tracing::debug!(limit = this.limit, "body too large to cache");
                        this.copy = None;
                    } else {
                        copy.push(chunk.clone());
                    }
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(err))) => {
                this.copy = None;
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(None) => {
                this.finish();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::cache::MemoryCache;
    use std::time::Duration;

    fn chunks(parts: &'static [&'static str]) -> ByteStream {
        stream::iter(parts.iter().map(|p| Ok(Bytes::from_static(p.as_bytes())))).boxed()
    }

    fn target(cache: &Arc<MemoryCache>) -> CacheTarget {
        CacheTarget {
            cache: cache.clone(),
            key: "k".into(),
            status: StatusCode::OK,
            headers: HeaderMap::new(),
        }
    }

    async fn drain(stream: impl Stream<Item = io::Result<Bytes>>) -> Vec<u8> {
        let parts: Vec<Bytes> = stream.map(|c| c.unwrap()).collect().await;
        parts.concat()
    }

    #[tokio::test]
    async fn test_buffer_joins_chunks() {
        match buffer_up_to(chunks(&["ab", "cd"]), 16).await.unwrap() {
            Buffered::Complete(bytes) => assert_eq!(bytes, Bytes::from_static(b"abcd")),
            Buffered::Overflow(_) => panic!("four bytes fit in sixteen"),
        }
    }

    #[tokio::test]
    async fn test_buffer_overflow_replays_everything() {
        match buffer_up_to(chunks(&["abc", "def", "ghi"]), 4).await.unwrap() {
            Buffered::Complete(_) => panic!("nine bytes do not fit in four"),
            Buffered::Overflow(rest) => assert_eq!(drain(rest).await, b"abcdefghi"),
        }
    }

    #[tokio::test]
    async fn test_buffer_error_propagates() {
        let body = stream::iter(vec![
            Ok(Bytes::from_static(b"ab")),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")),
        ])
        .boxed();
        assert!(buffer_up_to(body, 16).await.is_err());
    }

    #[tokio::test]
    async fn test_fill_caches_complete_body() {
        let cache = Arc::new(MemoryCache::new(4, 1024));
        let fill = CacheFill::new(chunks(&["hello ", "world"]), 64, target(&cache));
        assert_eq!(drain(fill).await, b"hello world");

        tokio::time::sleep(Duration::from_millis(20)).await;
        let hit = cache.lookup("k").await.unwrap();
        assert_eq!(hit.body, Bytes::from_static(b"hello world"));
    }

    #[tokio::test]
    async fn test_fill_skips_body_over_limit() {
        let cache = Arc::new(MemoryCache::new(4, 1024));
        let fill = CacheFill::new(chunks(&["hello ", "world"]), 8, target(&cache));
        assert_eq!(drain(fill).await, b"hello world");

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(cache.lookup("k").await.is_none());
    }

    #[tokio::test]
    async fn test_fill_dropped_early_caches_nothing() {
        let cache = Arc::new(MemoryCache::new(4, 1024));
        let mut fill = CacheFill::new(chunks(&["hello ", "world"]), 64, target(&cache));
        assert_eq!(fill.next().await.unwrap().unwrap(), Bytes::from_static(b"hello "));
        drop(fill);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(cache.lookup("k").await.is_none());
    }
}
