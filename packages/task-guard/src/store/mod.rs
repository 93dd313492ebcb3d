//! Key-value store abstraction shared by the limiter, the cache and the
//! activity monitor.
//!
//! Every method is atomic with respect to the single key it touches. No
//! operation spans more than one key, so any backend offering Redis-like
//! single-key atomicity can implement the trait.

use std::time::Duration;

use async_trait::async_trait;
use globset::{GlobBuilder, GlobMatcher};

use crate::error::{StoreError, StoreResult};

mod memory;
pub use memory::MemoryStore;

#[cfg(feature = "redis")]
mod redis;
#[cfg(feature = "redis")]
pub use self::redis::RedisStore;

/// Key-value store with string, counter, sorted-set and list primitives.
///
/// Sorted-set scores are epoch milliseconds.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read a string value.
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Write a string value that expires after `ttl`.
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()>;

    /// Delete keys, returning how many existed.
    async fn delete(&self, keys: &[String]) -> StoreResult<usize>;

    /// List keys matching a Redis-style glob pattern. A backend that parses
    /// patterns itself fails with `InvalidPattern` on one it cannot read.
    async fn keys(&self, pattern: &str) -> StoreResult<Vec<String>>;

    /// Increment an integer counter, creating it at zero first if missing.
    async fn incr(&self, key: &str) -> StoreResult<i64>;

    /// Increment a counter and, in the same atomic step, give it `ttl` if it
    /// has no expiry yet (always the case for a counter this call created).
    async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> StoreResult<i64>;

    /// Set a key's time-to-live. Returns false if the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool>;

    /// Add (or re-score) a sorted-set member.
    async fn zadd(&self, key: &str, member: &str, score: i64) -> StoreResult<()>;

    /// Remove a sorted-set member. Returns true if it was present.
    async fn zrem(&self, key: &str, member: &str) -> StoreResult<bool>;

    /// Remove members whose score lies in `[min, max]`.
    async fn zremrangebyscore(&self, key: &str, min: i64, max: i64) -> StoreResult<usize>;

    /// Number of members in a sorted set.
    async fn zcard(&self, key: &str) -> StoreResult<usize>;

    /// Prune members scored below `window_start`, then add `member` only if
    /// fewer than `limit` remain. The whole sequence is one atomic step, and
    /// the key's TTL is refreshed to `ttl` on success.
    async fn zadd_within_limit(
        &self,
        key: &str,
        member: &str,
        score: i64,
        window_start: i64,
        limit: usize,
        ttl: Duration,
    ) -> StoreResult<bool>;

    /// Push to the head of a list and trim it to at most `cap` entries.
    async fn lpush_trim(&self, key: &str, value: &str, cap: usize) -> StoreResult<()>;

    /// Read list entries between `start` and `stop` inclusive (negative indices
    /// count from the tail, as in Redis).
    async fn lrange(&self, key: &str, start: isize, stop: isize) -> StoreResult<Vec<String>>;
}

/// Compile a Redis `KEYS`/`SCAN MATCH` pattern: `*`, `?`, `[...]` classes
/// and backslash escapes. `*` also matches `/`, as it does in Redis.
pub(crate) fn key_matcher(pattern: &str) -> StoreResult<GlobMatcher> {
    GlobBuilder::new(pattern)
        .literal_separator(false)
        .backslash_escape(true)
        .build()
        .map(|glob| glob.compile_matcher())
        .map_err(|e| StoreError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: e.kind().to_string(),
        })
}

/// Resolve Redis-style inclusive list bounds against a list length.
pub(crate) fn resolve_range(len: usize, start: isize, stop: isize) -> Option<(usize, usize)> {
    if len == 0 {
        return None;
    }
    let len_i = len as isize;
    let norm = |i: isize| if i < 0 { (len_i + i).max(0) } else { i };
    let start = norm(start);
    let stop = norm(stop).min(len_i - 1);
    if start > stop || start >= len_i {
        return None;
    }
    Some((start as usize, stop as usize))
}
