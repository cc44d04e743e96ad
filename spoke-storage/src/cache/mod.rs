//! Two-level read-through, write-invalidate cache tier.
//!
//! Level 1 is a process-local byte-bounded LRU; level 2 is a shared
//! network cache with TTL expiry. Reads check L1, then L2 (repopulating
//! L1), then coalesce concurrent misses for the same key into one
//! authoritative load whose result populates both levels. Mutations
//! invalidate matching keys across both levels before the write returns;
//! an L2 failure there is logged and metered but never fails the
//! operation.

pub mod keys;
pub mod l1;
pub mod l2;

pub use l1::{L1Cache, L1Stats};
pub use l2::L2Cache;

use crate::config::CachePolicyConfig;
use crate::context::OpContext;
use crate::errors::StorageError;
use crate::observability::StorageMetrics;
use bytes::Bytes;
use dashmap::DashMap;
use keys::KeyFamily;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::warn;

pub struct TieredCache {
    l1: L1Cache,
    l2: Option<L2Cache>,
    policy: CachePolicyConfig,
    flight: DashMap<String, Arc<Mutex<()>>>,
    metrics: Arc<StorageMetrics>,
}

impl TieredCache {
    pub fn new(
        policy: CachePolicyConfig,
        l2: Option<L2Cache>,
        metrics: Arc<StorageMetrics>,
    ) -> Self {
        Self {
            l1: L1Cache::new(policy.l1_max_bytes),
            l2,
            policy,
            flight: DashMap::new(),
            metrics,
        }
    }

    /// Raw read path: L1, then L2 with L1 repopulation. Cancellation and
    /// deadline errors surface; L2 transport errors degrade to a miss.
    pub async fn get_bytes(
        &self,
        ctx: &OpContext,
        key: &str,
    ) -> Result<Option<Bytes>, StorageError> {
        ctx.check()?;
        let family = keys::family_label(key);

        if let Some(payload) = self.l1.get(key) {
            self.metrics.record_cache_event("l1", family, "hit");
            return Ok(Some(payload));
        }
        self.metrics.record_cache_event("l1", family, "miss");

        let Some(l2) = &self.l2 else {
            return Ok(None);
        };
        match l2.get(ctx, key).await {
            Ok(Some(payload)) => {
                self.metrics.record_cache_event("l2", family, "hit");
                self.admit_l1(key, payload.clone());
                Ok(Some(payload))
            }
            Ok(None) => {
                self.metrics.record_cache_event("l2", family, "miss");
                Ok(None)
            }
            Err(e @ StorageError::Canceled) | Err(e @ StorageError::DeadlineExceeded) => Err(e),
            Err(e) => {
                self.metrics.record_cache_event("l2", family, "error");
                warn!(key, error = %e, "network cache read failed, falling through");
                Ok(None)
            }
        }
    }

    /// Populate both levels. L2 failures are logged and metered only.
    pub async fn put_bytes(&self, ctx: &OpContext, key: &str, payload: Bytes) {
        self.admit_l1(key, payload.clone());

        if let Some(l2) = &self.l2 {
            let ttl = keys::family_of(key)
                .unwrap_or(KeyFamily::Module)
                .ttl(&self.policy.ttl);
            if let Err(e) = l2.set(ctx, key, &payload, ttl).await {
                self.metrics
                    .record_cache_event("l2", keys::family_label(key), "error");
                warn!(key, error = %e, "network cache write failed");
            }
        }
    }

    /// Read-through for serialized entities. Concurrent misses for the
    /// same key coalesce into one `load` call. `NotFound` results are
    /// not cached.
    pub async fn get_with<T, F, Fut>(
        &self,
        ctx: &OpContext,
        key: &str,
        load: F,
    ) -> Result<T, StorageError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        if let Some(payload) = self.get_bytes(ctx, key).await? {
            match serde_json::from_slice(&payload) {
                Ok(value) => return Ok(value),
                Err(e) => {
                    // A corrupt entry is dropped and reloaded from the
                    // authoritative store.
                    warn!(key, error = %e, "dropping undecodable cache entry");
                    self.l1.remove(key);
                }
            }
        }

        let gate = self
            .flight
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        // The gate entry must be released on every exit path, including
        // a waiter whose context cancels while queued behind the loader.
        let result = async {
            let _guard = ctx.bound(gate.lock()).await?;

            // Another task may have completed the load while we waited.
            if let Some(payload) = self.get_bytes(ctx, key).await? {
                if let Ok(value) = serde_json::from_slice(&payload) {
                    return Ok(value);
                }
            }

            let result = load().await;
            if let Ok(value) = &result {
                let payload = Bytes::from(serde_json::to_vec(value)?);
                self.put_bytes(ctx, key, payload).await;
            }
            result
        }
        .await;
        self.flight.remove(key);
        result
    }

    /// Read-through for raw byte payloads (content blobs, artifacts).
    pub async fn get_bytes_with<F, Fut>(
        &self,
        ctx: &OpContext,
        key: &str,
        load: F,
    ) -> Result<Bytes, StorageError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Bytes, StorageError>>,
    {
        if let Some(payload) = self.get_bytes(ctx, key).await? {
            return Ok(payload);
        }

        let gate = self
            .flight
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let result = async {
            let _guard = ctx.bound(gate.lock()).await?;

            if let Some(payload) = self.get_bytes(ctx, key).await? {
                return Ok(payload);
            }

            let result = load().await;
            if let Ok(payload) = &result {
                self.put_bytes(ctx, key, payload.clone()).await;
            }
            result
        }
        .await;
        self.flight.remove(key);
        result
    }

    /// Apply glob-style invalidation patterns to both levels. L2
    /// failures are non-fatal; entries there expire by TTL anyway.
    pub async fn invalidate(&self, ctx: &OpContext, patterns: &[String]) {
        for pattern in patterns {
            let family = keys::family_label(pattern);
            let removed = if pattern.contains('*') {
                self.l1.remove_matching(pattern).len() as u64
            } else {
                u64::from(self.l1.remove(pattern))
            };
            if removed > 0 {
                self.metrics
                    .record_cache_event("l1", family, "invalidation");
            }

            if let Some(l2) = &self.l2 {
                let outcome = if pattern.contains('*') {
                    l2.delete_pattern(ctx, pattern).await
                } else {
                    l2.delete(ctx, std::slice::from_ref(pattern)).await
                };
                match outcome {
                    Ok(n) if n > 0 => {
                        self.metrics
                            .record_cache_event("l2", family, "invalidation");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        self.metrics.record_cache_event("l2", family, "error");
                        warn!(pattern, error = %e, "network cache invalidation failed");
                    }
                }
            }
        }
    }

    pub async fn l2_ping(&self, ctx: &OpContext) -> Result<(), StorageError> {
        match &self.l2 {
            Some(l2) => l2.ping(ctx).await,
            None => Ok(()),
        }
    }

    pub fn has_l2(&self) -> bool {
        self.l2.is_some()
    }

    pub fn clear_local(&self) {
        self.l1.clear();
    }

    pub fn l1_stats(&self) -> L1Stats {
        self.l1.stats()
    }

    #[cfg(test)]
    fn flight_len(&self) -> usize {
        self.flight.len()
    }

    fn admit_l1(&self, key: &str, payload: Bytes) {
        for evicted in self.l1.put(key, payload) {
            self.metrics
                .record_cache_event("l1", keys::family_label(&evicted), "eviction");
        }
    }
}

impl std::fmt::Debug for TieredCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TieredCache")
            .field("l1", &self.l1.stats())
            .field("has_l2", &self.l2.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn tier() -> TieredCache {
        TieredCache::new(
            CachePolicyConfig::default(),
            None,
            Arc::new(StorageMetrics::new()),
        )
    }

    #[tokio::test]
    async fn test_read_through_populates_l1() {
        let metrics = Arc::new(StorageMetrics::new());
        let cache = TieredCache::new(CachePolicyConfig::default(), None, Arc::clone(&metrics));
        let ctx = OpContext::background();
        let loads = AtomicUsize::new(0);

        let value: String = cache
            .get_with(&ctx, "module:acme", || async {
                loads.fetch_add(1, Ordering::SeqCst);
                Ok("acme".to_string())
            })
            .await
            .unwrap();
        assert_eq!(value, "acme");
        assert_eq!(loads.load(Ordering::SeqCst), 1);

        // Second read is served from L1.
        let value: String = cache
            .get_with(&ctx, "module:acme", || async {
                loads.fetch_add(1, Ordering::SeqCst);
                Ok("stale".to_string())
            })
            .await
            .unwrap();
        assert_eq!(value, "acme");
        assert_eq!(loads.load(Ordering::SeqCst), 1);

        // Every hit and miss is metered with the key family label.
        assert_eq!(metrics.cache_event_count("l1", "module", "hit"), 1);
        assert!(metrics.cache_event_count("l1", "module", "miss") >= 1);
    }

    #[tokio::test]
    async fn test_not_found_is_not_cached() {
        let cache = tier();
        let ctx = OpContext::background();
        let loads = AtomicUsize::new(0);

        for _ in 0..2 {
            let result: Result<String, _> = cache
                .get_with(&ctx, "module:ghost", || async {
                    loads.fetch_add(1, Ordering::SeqCst);
                    Err(StorageError::NotFound("module ghost".to_string()))
                })
                .await;
            assert!(result.is_err());
        }
        assert_eq!(loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_invalidation_forces_reload() {
        let cache = tier();
        let ctx = OpContext::background();
        let loads = AtomicUsize::new(0);

        let load = || async {
            loads.fetch_add(1, Ordering::SeqCst);
            Ok("value".to_string())
        };
        let _: String = cache.get_with(&ctx, "version_list:acme", load).await.unwrap();
        cache
            .invalidate(&ctx, &["version_list:acme".to_string()])
            .await;

        let _: String = cache
            .get_with(&ctx, "version_list:acme", || async {
                loads.fetch_add(1, Ordering::SeqCst);
                Ok("value".to_string())
            })
            .await
            .unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_pattern_invalidation() {
        let cache = tier();
        let ctx = OpContext::background();

        cache
            .put_bytes(&ctx, "version:acme:v1", Bytes::from_static(b"1"))
            .await;
        cache
            .put_bytes(&ctx, "version:acme:v2", Bytes::from_static(b"2"))
            .await;
        cache
            .put_bytes(&ctx, "version:other:v1", Bytes::from_static(b"3"))
            .await;

        cache
            .invalidate(&ctx, &["version:acme:*".to_string()])
            .await;

        assert!(cache
            .get_bytes(&ctx, "version:acme:v1")
            .await
            .unwrap()
            .is_none());
        assert!(cache
            .get_bytes(&ctx, "version:other:v1")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_single_flight_coalesces_concurrent_misses() {
        let cache = Arc::new(tier());
        let loads = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            let loads = Arc::clone(&loads);
            handles.push(tokio::spawn(async move {
                let ctx = OpContext::background();
                cache
                    .get_with(&ctx, "latest:acme", move || {
                        let loads = loads.clone();
                        async move {
                            loads.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                            Ok("v9".to_string())
                        }
                    })
                    .await
            }));
        }
        for handle in handles {
            let value: String = handle.await.unwrap().unwrap();
            assert_eq!(value, "v9");
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_waiter_releases_single_flight_entry() {
        let cache = Arc::new(tier());

        // A slow loader holds the per-key gate.
        let loader_cache = Arc::clone(&cache);
        let loader = tokio::spawn(async move {
            let ctx = OpContext::background();
            loader_cache
                .get_with(&ctx, "latest:acme", || async {
                    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
                    Ok("v9".to_string())
                })
                .await
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        // A waiter queued behind it runs out of deadline while waiting.
        let ctx = OpContext::background()
            .with_deadline(std::time::Duration::from_millis(10));
        let waited: Result<String, _> = cache
            .get_with(&ctx, "latest:acme", || async { Ok("unused".to_string()) })
            .await;
        assert!(matches!(waited, Err(StorageError::DeadlineExceeded)));

        let value: String = loader.await.unwrap().unwrap();
        assert_eq!(value, "v9");
        // Neither the cancelled waiter nor the loader leaked its gate.
        assert_eq!(cache.flight_len(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_context_surfaces() {
        let cache = tier();
        let token = tokio_util::sync::CancellationToken::new();
        token.cancel();
        let ctx = OpContext::background().with_cancellation(token);

        let result = cache.get_bytes(&ctx, "module:acme").await;
        assert!(matches!(result, Err(StorageError::Canceled)));
    }
}
