//! Test doubles for code built on the guard primitives.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::clock::Clock;
use crate::error::{StoreError, StoreResult};
use crate::store::KeyValueStore;

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start_millis: i64) -> Self {
        Self {
            now: AtomicI64::new(start_millis),
        }
    }

    pub fn advance(&self, by: Duration) {
        let ms = i64::try_from(by.as_millis()).unwrap_or(i64::MAX);
        self.now.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn set(&self, millis: i64) {
        self.now.store(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Store wrapper that can be switched into an outage.
///
/// `set_unavailable(true)` fails every call; `fail_next(n)` fails just the
/// next `n` calls. Call counts are recorded for assertions.
pub struct FlakyStore {
    inner: Arc<dyn KeyValueStore>,
    unavailable: AtomicBool,
    fail_budget: AtomicUsize,
    calls: AtomicUsize,
}

impl FlakyStore {
    pub fn new(inner: Arc<dyn KeyValueStore>) -> Self {
        Self {
            inner,
            unavailable: AtomicBool::new(false),
            fail_budget: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn fail_next(&self, n: usize) {
        self.fail_budget.store(n, Ordering::SeqCst);
    }

    /// Total calls seen, failed or not.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn check(&self) -> StoreResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("simulated outage".to_string()));
        }
        let consumed = self
            .fail_budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if consumed {
            return Err(StoreError::Unavailable("simulated failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for FlakyStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.check()?;
        self.inner.get(key).await
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        self.check()?;
        self.inner.set_ex(key, value, ttl).await
    }

    async fn delete(&self, keys: &[String]) -> StoreResult<usize> {
        self.check()?;
        self.inner.delete(keys).await
    }

    async fn keys(&self, pattern: &str) -> StoreResult<Vec<String>> {
        self.check()?;
        self.inner.keys(pattern).await
    }

    async fn incr(&self, key: &str) -> StoreResult<i64> {
        self.check()?;
        self.inner.incr(key).await
    }

    async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> StoreResult<i64> {
        self.check()?;
        self.inner.incr_with_ttl(key, ttl).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        self.check()?;
        self.inner.expire(key, ttl).await
    }

    async fn zadd(&self, key: &str, member: &str, score: i64) -> StoreResult<()> {
        self.check()?;
        self.inner.zadd(key, member, score).await
    }

    async fn zrem(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.check()?;
        self.inner.zrem(key, member).await
    }

    async fn zremrangebyscore(&self, key: &str, min: i64, max: i64) -> StoreResult<usize> {
        self.check()?;
        self.inner.zremrangebyscore(key, min, max).await
    }

    async fn zcard(&self, key: &str) -> StoreResult<usize> {
        self.check()?;
        self.inner.zcard(key).await
    }

    async fn zadd_within_limit(
        &self,
        key: &str,
        member: &str,
        score: i64,
        window_start: i64,
        limit: usize,
        ttl: Duration,
    ) -> StoreResult<bool> {
        self.check()?;
        self.inner
            .zadd_within_limit(key, member, score, window_start, limit, ttl)
            .await
    }

    async fn lpush_trim(&self, key: &str, value: &str, cap: usize) -> StoreResult<()> {
        self.check()?;
        self.inner.lpush_trim(key, value, cap).await
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> StoreResult<Vec<String>> {
        self.check()?;
        self.inner.lrange(key, start, stop).await
    }
}
