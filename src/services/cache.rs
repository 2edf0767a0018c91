//! Response cache keyed by the canonical cache key.

use crate::models::cached::CachedResponse;
use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;

/// Key → response store. Writes are fire-and-forget from the caller's side,
/// so implementations must not assume the request is still alive.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn lookup(&self, key: &str) -> Option<CachedResponse>;
    async fn put(&self, key: String, response: CachedResponse);
}

/// In-process LRU bounded both by entry count and by total body bytes.
pub struct MemoryCache {
    inner: Mutex<Entries>,
    max_bytes: usize,
}

struct Entries {
    lru: LruCache<String, CachedResponse>,
    bytes: usize,
}

impl MemoryCache {
    /// A capacity of 0 is treated as 1.
    pub fn new(capacity: usize, max_bytes: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(Entries {
                lru: LruCache::new(capacity),
                bytes: 0,
            }),
            max_bytes,
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.inner.lock().lru.len()
    }

    #[cfg(test)]
    pub fn bytes(&self) -> usize {
        self.inner.lock().bytes
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn lookup(&self, key: &str) -> Option<CachedResponse> {
        self.inner.lock().lru.get(key).cloned()
    }

    async fn put(&self, key: String, response: CachedResponse) {
        let weight = response.weight();
        if weight > self.max_bytes {
            tracing::debug!(key = %key, weight, max_bytes = self.max_bytes, "response too large to cache");
            return;
        }

        let mut inner = self.inner.lock();
        tracing::debug!(key = %key, status = %response.status, entries = inner.lru.len(), "caching response");
        // `push` hands back either the replaced value or the evicted LRU entry.
        if let Some((_, old)) = inner.lru.push(key, response) {
            inner.bytes -= old.weight();
        }
        inner.bytes += weight;

        while inner.bytes > self.max_bytes {
            match inner.lru.pop_lru() {
                Some((_, evicted)) => inner.bytes -= evicted.weight(),
                None => break,
            }
        }
    }
}
