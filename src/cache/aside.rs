use super::store::{key_matches, CacheEntry, CacheStore};
use crate::metrics;
use axum::http::{HeaderMap, HeaderValue};
use chrono::{DateTime, SecondsFormat, Utc};
use dashmap::DashMap;
use serde::{de::DeserializeOwned, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, warn};

/// Whether a value came from the store or from the source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Miss,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStatus::Hit => "HIT",
            CacheStatus::Miss => "MISS",
        }
    }
}

/// A value tagged with its cache status
#[derive(Debug, Clone)]
pub struct Cached<T> {
    pub value: T,
    pub status: CacheStatus,
    /// When the value was written to the store (now, on a miss)
    pub cached_at: SystemTime,
}

impl<T> Cached<T> {
    pub fn is_hit(&self) -> bool {
        self.status == CacheStatus::Hit
    }

    /// Set `X-Cache` and `X-Cache-Time`
    pub fn apply_headers(&self, headers: &mut HeaderMap) {
        headers.insert("X-Cache", HeaderValue::from_static(self.status.as_str()));

        let time = DateTime::<Utc>::from(self.cached_at).to_rfc3339_opts(SecondsFormat::Secs, true);
        if let Ok(value) = HeaderValue::from_str(&time) {
            headers.insert("X-Cache-Time", value);
        }
    }
}

/// Computations running for one key
#[derive(Debug, Default)]
struct InFlight {
    computing: usize,
    /// Bumped by every invalidation of the key
    generation: u64,
}

/// Registers a computation for its lifetime
struct ComputeGuard<'a> {
    in_flight: &'a DashMap<String, InFlight>,
    key: &'a str,
    generation: u64,
}

impl<'a> ComputeGuard<'a> {
    fn begin(in_flight: &'a DashMap<String, InFlight>, key: &'a str) -> Self {
        let mut entry = in_flight.entry(key.to_string()).or_default();
        entry.computing += 1;
        let generation = entry.generation;
        drop(entry);

        Self {
            in_flight,
            key,
            generation,
        }
    }

    /// `false` once the key was invalidated after the computation began
    fn is_current(&self) -> bool {
        self.in_flight
            .get(self.key)
            .map_or(true, |entry| entry.generation == self.generation)
    }
}

impl Drop for ComputeGuard<'_> {
    fn drop(&mut self) {
        if let Some(mut entry) = self.in_flight.get_mut(self.key) {
            entry.computing = entry.computing.saturating_sub(1);
        }
        self.in_flight.remove_if(self.key, |_, entry| entry.computing == 0);
    }
}

/// Get-or-compute over a shared store.
///
/// Values are stored as JSON. Every store failure is logged and treated as
/// a miss; a failed write never fails the caller. A value computed while its
/// key is invalidated is returned but never left in the store.
#[derive(Clone)]
pub struct CacheAside {
    store: Arc<dyn CacheStore>,
    default_ttl_secs: u64,
    in_flight: Arc<DashMap<String, InFlight>>,
}

impl CacheAside {
    pub fn new(store: Arc<dyn CacheStore>, default_ttl_secs: u64) -> Self {
        Self {
            store,
            default_ttl_secs,
            in_flight: Arc::new(DashMap::new()),
        }
    }

    pub fn default_ttl_secs(&self) -> u64 {
        self.default_ttl_secs
    }

    pub fn backend(&self) -> &'static str {
        self.store.backend()
    }

    /// Return the stored value for `key`, or compute and store it
    pub async fn get_or_compute<T, E, F, Fut>(
        &self,
        key: &str,
        ttl_secs: u64,
        compute: F,
    ) -> Result<Cached<T>, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.get_or_compute_if(key, ttl_secs, compute, |_| true)
            .await
    }

    /// Like [`get_or_compute`](Self::get_or_compute), but only stores values
    /// for which `should_store` returns `true`
    pub async fn get_or_compute_if<T, E, F, Fut, P>(
        &self,
        key: &str,
        ttl_secs: u64,
        compute: F,
        should_store: P,
    ) -> Result<Cached<T>, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: FnOnce(&T) -> bool,
    {
        if let Some(hit) = self.lookup(key).await {
            metrics::record_cache_lookup(true);
            return Ok(hit);
        }
        metrics::record_cache_lookup(false);

        let guard = ComputeGuard::begin(&self.in_flight, key);
        let value = compute().await?;
        let cached_at = SystemTime::now();

        if should_store(&value) && guard.is_current() {
            self.store_value(key, &value, ttl_secs).await;

            // An invalidation may have landed between the check and the write
            if !guard.is_current() {
                debug!(key, "Key invalidated during computation, dropping stored value");
                if let Err(e) = self.store.delete(key).await {
                    warn!(key, error = %e, "Failed to drop superseded cache value");
                }
            }
        } else if !guard.is_current() {
            debug!(key, "Key invalidated during computation, not storing");
        }

        Ok(Cached {
            value,
            status: CacheStatus::Miss,
            cached_at,
        })
    }

    async fn lookup<T: DeserializeOwned>(&self, key: &str) -> Option<Cached<T>> {
        let entry = match self.store.get(key).await {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                debug!(key, "Cache miss");
                return None;
            }
            Err(e) => {
                warn!(key, error = %e, backend = self.store.backend(), "Cache read failed, going to source");
                return None;
            }
        };

        match serde_json::from_slice(&entry.value) {
            Ok(value) => {
                debug!(key, "Cache hit");
                Some(Cached {
                    value,
                    status: CacheStatus::Hit,
                    cached_at: entry.written_at,
                })
            }
            Err(e) => {
                warn!(key, error = %e, "Discarding undecodable cache entry");
                self.invalidate(key).await;
                None
            }
        }
    }

    async fn store_value<T: Serialize>(&self, key: &str, value: &T, ttl_secs: u64) {
        let bytes = match serde_json::to_vec(value) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(key, error = %e, "Cache value not serializable, skipping write");
                return;
            }
        };

        if let Err(e) = self.store.set(CacheEntry::new(key, bytes, ttl_secs)).await {
            warn!(key, error = %e, backend = self.store.backend(), "Cache write failed");
        } else {
            debug!(key, ttl_secs, "Cached value");
        }
    }

    /// Delete one key. Returns whether it existed.
    pub async fn invalidate(&self, key: &str) -> bool {
        if let Some(mut entry) = self.in_flight.get_mut(key) {
            entry.generation += 1;
        }

        match self.store.delete(key).await {
            Ok(removed) => {
                if removed {
                    metrics::record_cache_invalidation(1);
                }
                debug!(key, removed, "Invalidated cache key");
                removed
            }
            Err(e) => {
                warn!(key, error = %e, "Cache invalidation failed");
                false
            }
        }
    }

    /// Delete the listed keys together with their query variants
    /// (`news:list?page=2` for `news:list`). Keys containing `*` are
    /// deleted as patterns.
    pub async fn invalidate_with_variants(&self, keys: &[String]) -> u64 {
        let mut removed = 0;
        for key in keys {
            if key.contains('*') {
                removed += self.invalidate_pattern(key).await;
                continue;
            }
            if self.invalidate(key).await {
                removed += 1;
            }
            removed += self.invalidate_pattern(&format!("{}?*", key)).await;
        }
        removed
    }

    /// Delete every key matching a `*` wildcard pattern, e.g. `news:*`
    pub async fn invalidate_pattern(&self, pattern: &str) -> u64 {
        for mut entry in self.in_flight.iter_mut() {
            if key_matches(pattern, entry.key()) {
                entry.generation += 1;
            }
        }

        match self.store.delete_matching(pattern).await {
            Ok(removed) => {
                metrics::record_cache_invalidation(removed);
                debug!(pattern, removed, "Invalidated cache pattern");
                removed
            }
            Err(e) => {
                warn!(pattern, error = %e, "Cache pattern invalidation failed");
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::store::{MemoryStore, StoreError};
    use async_trait::async_trait;
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::oneshot;

    fn aside() -> CacheAside {
        CacheAside::new(Arc::new(MemoryStore::new(100)), 300)
    }

    async fn counted(
        cache: &CacheAside,
        key: &str,
        ttl: u64,
        calls: &AtomicUsize,
    ) -> Cached<Vec<String>> {
        cache
            .get_or_compute(key, ttl, || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, Infallible>(vec!["Branch opening".to_string()])
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_second_call_within_ttl_is_hit() {
        let cache = aside();
        let calls = AtomicUsize::new(0);

        let first = counted(&cache, "news:list", 1800, &calls).await;
        assert_eq!(first.status, CacheStatus::Miss);

        let second = counted(&cache, "news:list", 1800, &calls).await;
        assert_eq!(second.status, CacheStatus::Hit);
        assert_eq!(second.value, vec!["Branch opening".to_string()]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_recomputes_after_ttl() {
        let cache = aside();
        let calls = AtomicUsize::new(0);

        counted(&cache, "news:42", 1, &calls).await;
        tokio::time::sleep(Duration::from_millis(1100)).await;
        let again = counted(&cache, "news:42", 1, &calls).await;

        assert_eq!(again.status, CacheStatus::Miss);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_compute_error_is_not_cached() {
        let cache = aside();

        let err = cache
            .get_or_compute::<String, _, _, _>("news:list", 60, || async { Err("db down") })
            .await
            .unwrap_err();
        assert_eq!(err, "db down");

        let ok = cache
            .get_or_compute("news:list", 60, || async { Ok::<_, &str>("fresh".to_string()) })
            .await
            .unwrap();
        assert_eq!(ok.status, CacheStatus::Miss);
        assert_eq!(ok.value, "fresh");
    }

    #[tokio::test]
    async fn test_should_store_predicate() {
        let cache = aside();
        let calls = AtomicUsize::new(0);
        let counter = &calls;

        for _ in 0..2 {
            cache
                .get_or_compute_if(
                    "news:missing",
                    60,
                    || async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, Infallible>(404u16)
                    },
                    |status| *status < 300,
                )
                .await
                .unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_invalidate_keys_and_query_variants() {
        let cache = aside();
        let calls = AtomicUsize::new(0);

        counted(&cache, "news:list", 600, &calls).await;
        counted(&cache, "news:list?page=2", 600, &calls).await;
        counted(&cache, "news:list-archive", 600, &calls).await;
        counted(&cache, "news:7", 600, &calls).await;
        counted(&cache, "branches:list", 600, &calls).await;

        assert_eq!(
            cache
                .invalidate_with_variants(&["news:list".to_string(), "news:missing".to_string()])
                .await,
            2
        );
        assert!(!counted(&cache, "news:list", 600, &calls).await.is_hit());
        assert!(!counted(&cache, "news:list?page=2", 600, &calls).await.is_hit());
        assert!(counted(&cache, "news:list-archive", 600, &calls).await.is_hit());
        assert!(counted(&cache, "news:7", 600, &calls).await.is_hit());
        assert!(counted(&cache, "branches:list", 600, &calls).await.is_hit());
    }

    #[tokio::test]
    async fn test_invalidate_with_wildcard_entry() {
        let cache = aside();
        let calls = AtomicUsize::new(0);

        counted(&cache, "news:7", 600, &calls).await;
        counted(&cache, "news:8?lang=en", 600, &calls).await;
        counted(&cache, "branches:list", 600, &calls).await;

        assert_eq!(cache.invalidate_with_variants(&["news:*".to_string()]).await, 2);
        assert!(counted(&cache, "branches:list", 600, &calls).await.is_hit());
    }

    #[tokio::test]
    async fn test_invalidation_during_compute_is_not_overwritten() {
        let cache = aside();
        let (started_tx, started_rx) = oneshot::channel::<()>();
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let slow = {
            let cache = cache.clone();
            tokio::spawn(async move {
                cache
                    .get_or_compute("news:list", 600, || async move {
                        let _ = started_tx.send(());
                        let _ = release_rx.await;
                        Ok::<_, Infallible>("before the write".to_string())
                    })
                    .await
                    .unwrap()
            })
        };

        started_rx.await.unwrap();
        cache.invalidate("news:list").await;
        release_tx.send(()).unwrap();

        let stale = slow.await.unwrap();
        assert_eq!(stale.status, CacheStatus::Miss);
        assert_eq!(stale.value, "before the write");

        let next = cache
            .get_or_compute("news:list", 600, || async {
                Ok::<_, Infallible>("after the write".to_string())
            })
            .await
            .unwrap();
        assert_eq!(next.status, CacheStatus::Miss);
        assert_eq!(next.value, "after the write");
        assert!(cache.in_flight.is_empty());
    }

    #[tokio::test]
    async fn test_pattern_invalidation_during_compute() {
        let cache = aside();
        let (started_tx, started_rx) = oneshot::channel::<()>();
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let slow = {
            let cache = cache.clone();
            tokio::spawn(async move {
                cache
                    .get_or_compute("news:list?page=2", 600, || async move {
                        let _ = started_tx.send(());
                        let _ = release_rx.await;
                        Ok::<_, Infallible>(2u32)
                    })
                    .await
                    .unwrap()
            })
        };

        started_rx.await.unwrap();
        cache.invalidate_pattern("news:*").await;
        release_tx.send(()).unwrap();
        slow.await.unwrap();

        let calls = AtomicUsize::new(0);
        let counter = &calls;
        let next = cache
            .get_or_compute("news:list?page=2", 600, || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, Infallible>(3u32)
            })
            .await
            .unwrap();
        assert_eq!(next.value, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalidate_pattern() {
        let cache = aside();
        let calls = AtomicUsize::new(0);

        counted(&cache, "news:list", 600, &calls).await;
        counted(&cache, "news:7", 600, &calls).await;
        counted(&cache, "branches:list", 600, &calls).await;

        assert_eq!(cache.invalidate_pattern("news:*").await, 2);
        assert!(counted(&cache, "branches:list", 600, &calls).await.is_hit());
    }

    struct BrokenStore;

    #[async_trait]
    impl CacheStore for BrokenStore {
        async fn get(&self, _key: &str) -> Result<Option<CacheEntry>, StoreError> {
            Err(StoreError::Corrupt("store offline".to_string()))
        }
        async fn set(&self, _entry: CacheEntry) -> Result<(), StoreError> {
            Err(StoreError::Corrupt("store offline".to_string()))
        }
        async fn delete(&self, _key: &str) -> Result<bool, StoreError> {
            Err(StoreError::Corrupt("store offline".to_string()))
        }
        async fn delete_matching(&self, _pattern: &str) -> Result<u64, StoreError> {
            Err(StoreError::Corrupt("store offline".to_string()))
        }
        fn backend(&self) -> &'static str {
            "broken"
        }
    }

    #[tokio::test]
    async fn test_store_failure_goes_to_source() {
        let cache = CacheAside::new(Arc::new(BrokenStore), 60);
        let calls = AtomicUsize::new(0);

        let first = counted(&cache, "news:list", 60, &calls).await;
        let second = counted(&cache, "news:list", 60, &calls).await;

        assert_eq!(first.status, CacheStatus::Miss);
        assert_eq!(second.status, CacheStatus::Miss);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(!cache.invalidate("news:list").await);
        assert_eq!(cache.invalidate_pattern("news:*").await, 0);
    }

    #[test]
    fn test_apply_headers() {
        let cached = Cached {
            value: (),
            status: CacheStatus::Hit,
            cached_at: SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000),
        };
        let mut headers = HeaderMap::new();
        cached.apply_headers(&mut headers);

        assert_eq!(headers["X-Cache"], "HIT");
        assert_eq!(headers["X-Cache-Time"], "2023-11-14T22:13:20Z");
    }
}
