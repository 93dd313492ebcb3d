//! TTL cache for unit-of-work results.
//!
//! Values are stored as JSON strings in a [`KeyValueStore`]. A value is only
//! ever written after the computation that produced it has succeeded, so a hit
//! never observes a partial result.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::{GuardResult, StoreError};
use crate::store::KeyValueStore;

/// Default time-to-live for cached results.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(3600);

/// Deterministic cache key for a unit of work.
///
/// Derived from the task name, a scope (usually the owning audit's id, so a
/// whole scope can be invalidated at once) and a digest of the canonicalized
/// arguments. Object keys are sorted before hashing, so `{"a":1,"b":2}` and
/// `{"b":2,"a":1}` produce the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    task: String,
    scope: String,
    digest: String,
}

impl CacheKey {
    pub fn new(task: impl Into<String>, scope: impl fmt::Display, args: &Value) -> Self {
        let canonical = canonicalize(args).to_string();
        let digest = hex::encode(Sha256::digest(canonical.as_bytes()));
        Self {
            task: task.into(),
            scope: scope.to_string(),
            digest,
        }
    }

    pub fn task(&self) -> &str {
        &self.task
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    fn render(&self, namespace: &str) -> String {
        format!("{}:{}:{}:{}", namespace, self.task, self.scope, self.digest)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.task, self.scope, &self.digest[..12])
    }
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k.clone(), canonicalize(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Cache manager with single-flight computation.
pub struct CacheManager {
    store: Arc<dyn KeyValueStore>,
    namespace: String,
    default_ttl: Duration,
    in_flight: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl CacheManager {
    pub fn new(store: Arc<dyn KeyValueStore>, namespace: impl Into<String>) -> Self {
        Self {
            store,
            namespace: namespace.into(),
            default_ttl: DEFAULT_CACHE_TTL,
            in_flight: DashMap::new(),
        }
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Read a cached value. Entries that no longer decode as `T` are misses.
    pub async fn get<T: DeserializeOwned>(&self, key: &CacheKey) -> GuardResult<Option<T>> {
        let rendered = key.render(&self.namespace);
        let Some(raw) = self.store.get(&rendered).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(value) => Ok(Some(value)),
            Err(err) => {
                warn!(key = %key, error = %err, "Discarding undecodable cache entry");
                Ok(None)
            }
        }
    }

    /// Store a value. `ttl` of `None` uses the manager's default.
    pub async fn set<T: Serialize>(
        &self,
        key: &CacheKey,
        value: &T,
        ttl: Option<Duration>,
    ) -> GuardResult<()> {
        let raw = serde_json::to_string(value).map_err(StoreError::from)?;
        let ttl = ttl.unwrap_or(self.default_ttl);
        self.store
            .set_ex(&key.render(&self.namespace), &raw, ttl)
            .await?;
        debug!(key = %key, ttl_secs = ttl.as_secs(), "Cached result");
        Ok(())
    }

    /// Delete every entry whose key (without namespace) matches `pattern`.
    pub async fn invalidate(&self, pattern: &str) -> GuardResult<usize> {
        let full = format!("{}:{}", self.namespace, pattern);
        let keys = self.store.keys(&full).await?;
        let removed = self.store.delete(&keys).await?;
        debug!(pattern = %full, removed, "Cache invalidated");
        Ok(removed)
    }

    /// Delete every entry in a scope, across all tasks.
    pub async fn invalidate_scope(&self, scope: impl fmt::Display) -> GuardResult<usize> {
        self.invalidate(&format!("*:{}:*", scope)).await
    }

    /// Return the cached value or compute, cache and return it.
    ///
    /// Concurrent callers with the same key in this process run `compute` at
    /// most once; the rest wait and read the freshly cached value. Failed
    /// computations are never cached. Cache store failures degrade to a miss.
    pub async fn get_or_compute<T, E, F, Fut>(
        &self,
        key: &CacheKey,
        ttl: Option<Duration>,
        compute: F,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.get_or_compute_when(key, ttl, compute, |_| true).await
    }

    /// Like [`get_or_compute`](Self::get_or_compute), but only stores values
    /// for which `cacheable` holds.
    pub async fn get_or_compute_when<T, E, F, Fut, P>(
        &self,
        key: &CacheKey,
        ttl: Option<Duration>,
        compute: F,
        cacheable: P,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: FnOnce(&T) -> bool,
    {
        if let Some(hit) = self.lookup(key).await {
            return Ok(hit);
        }

        let rendered = key.render(&self.namespace);
        let lock = self
            .in_flight
            .entry(rendered.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();

        let result = {
            let _guard = lock.lock().await;

            // Another caller may have filled the entry while we waited
            if let Some(hit) = self.lookup(key).await {
                Ok(hit)
            } else {
                match compute().await {
                    Ok(value) => {
                        if !cacheable(&value) {
                            debug!(key = %key, "Result not cacheable, skipping");
                        } else if let Err(err) = self.set(key, &value, ttl).await {
                            warn!(key = %key, error = %err, "Failed to cache result");
                        }
                        Ok(value)
                    }
                    Err(err) => Err(err),
                }
            }
        };

        self.in_flight
            .remove_if(&rendered, |_, l| Arc::ptr_eq(l, &lock) && Arc::strong_count(l) <= 2);
        result
    }

    async fn lookup<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<T> {
        match self.get(key).await {
            Ok(Some(hit)) => {
                debug!(key = %key, "Cache hit");
                Some(hit)
            }
            Ok(None) => None,
            Err(err) => {
                warn!(key = %key, error = %err, "Cache read failed, treating as miss");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;
    use crate::error::GuardError;
    use crate::store::MemoryStore;
    use crate::testing::ManualClock;

    fn cache() -> (Arc<ManualClock>, Arc<CacheManager>) {
        let clock = Arc::new(ManualClock::new(0));
        let store = Arc::new(MemoryStore::new(clock.clone()));
        (clock, Arc::new(CacheManager::new(store, "cache")))
    }

    #[test]
    fn test_key_ignores_argument_order() {
        let a = CacheKey::new("links", "audit-1", &json!({"url": "x", "depth": 2}));
        let b = CacheKey::new("links", "audit-1", &json!({"depth": 2, "url": "x"}));
        let c = CacheKey::new("links", "audit-1", &json!({"depth": 3, "url": "x"}));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn test_round_trip_and_expiry() {
        let (clock, cache) = cache();
        let key = CacheKey::new("meta", "audit-1", &json!([]));

        cache
            .set(&key, &json!({"titleLength": 42}), Some(Duration::from_secs(5)))
            .await
            .unwrap();
        let hit: Option<Value> = cache.get(&key).await.unwrap();
        assert_eq!(hit, Some(json!({"titleLength": 42})));

        clock.advance(Duration::from_secs(5));
        let miss: Option<Value> = cache.get(&key).await.unwrap();
        assert!(miss.is_none());
    }

    #[tokio::test]
    async fn test_invalidate_scope_only_touches_that_scope() {
        let (_clock, cache) = cache();
        let k1 = CacheKey::new("links", "audit-1", &json!(null));
        let k2 = CacheKey::new("meta", "audit-1", &json!(null));
        let k3 = CacheKey::new("links", "audit-2", &json!(null));
        for key in [&k1, &k2, &k3] {
            cache.set(key, &1, None).await.unwrap();
        }

        assert_eq!(cache.invalidate_scope("audit-1").await.unwrap(), 2);
        assert!(cache.get::<i32>(&k1).await.unwrap().is_none());
        assert_eq!(cache.get::<i32>(&k3).await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_get_or_compute_single_flight() {
        let (_clock, cache) = cache();
        let calls = Arc::new(AtomicUsize::new(0));
        let key = CacheKey::new("crawl", "audit-1", &json!({"url": "https://example.com"}));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let calls = calls.clone();
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_compute(&key, None, move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok::<_, GuardError>(7u32)
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), 7);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_uncacheable_values_are_not_stored() {
        let (_clock, cache) = cache();
        let key = CacheKey::new("crawl", "audit-1", &json!({}));

        let value: Result<u32, GuardError> = cache
            .get_or_compute_when(&key, None, || async { Ok(7) }, |v| *v > 10)
            .await;
        assert_eq!(value.unwrap(), 7);
        assert_eq!(cache.get::<u32>(&key).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_failures_are_not_cached() {
        let (_clock, cache) = cache();
        let key = CacheKey::new("serp", "audit-1", &json!(null));

        let failed: Result<u32, GuardError> = cache
            .get_or_compute(&key, None, || async {
                Err(GuardError::InvalidArgument("boom".into()))
            })
            .await;
        assert!(failed.is_err());
        assert!(cache.get::<u32>(&key).await.unwrap().is_none());

        let ok: Result<u32, GuardError> =
            cache.get_or_compute(&key, None, || async { Ok(3) }).await;
        assert_eq!(ok.unwrap(), 3);
    }
}
