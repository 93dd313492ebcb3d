//! Reliability primitives for fallible, slow units of work.
//!
//! A general-purpose library that turns calls to unreliable dependencies into
//! units of work that are cached, rate-limited, retried and circuit-broken,
//! without knowing anything about what the work actually is.
//!
//! # Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use task_guard::{CacheManager, MemoryStore, SlidingWindowLimiter, SystemClock};
//!
//! let clock = Arc::new(SystemClock);
//! let store = Arc::new(MemoryStore::new(clock.clone()));
//!
//! let limiter = SlidingWindowLimiter::new(store.clone(), clock, "task_limit");
//! if limiter.allow("crawl", 10, Duration::from_secs(60)).await? {
//!     // run the work
//! }
//!
//! let cache = CacheManager::new(store, "cache");
//! cache.set("crawl:abc", &result, None).await?;
//! ```
//!
//! # Modules
//!
//! - [`store`] - Key-value store abstraction (MemoryStore, RedisStore)
//! - [`rate_limit`] - Sliding-window-log rate limiter
//! - [`cache`] - TTL cache with single-flight computation
//! - [`retry`] - Exponential backoff for transient failures
//! - [`circuit`] - Per-dependency circuit breakers
//! - [`chunked`] - Bounded-memory batch processing
//! - [`activity`] - Sliding-window anomaly detection per actor
//! - [`testing`] - Test doubles (ManualClock, FlakyStore)

pub mod activity;
pub mod cache;
pub mod chunked;
pub mod circuit;
pub mod clock;
pub mod error;
pub mod rate_limit;
pub mod retry;
pub mod store;
pub mod testing;

pub use activity::{ActivityAlert, ActivityEntry, ActivityMonitor, ActivityRule};
pub use cache::{CacheKey, CacheManager, DEFAULT_CACHE_TTL};
pub use chunked::ChunkedProcessor;
pub use circuit::{BreakerConfig, CircuitBreaker, CircuitError, CircuitRegistry, CircuitState};
pub use clock::{Clock, SystemClock};
pub use error::{GuardError, GuardResult, StoreError, StoreResult};
pub use rate_limit::{SlidingWindowLimiter, SlotReservation, StoreFailurePolicy};
pub use retry::{RetryPolicy, Transient};
pub use store::{KeyValueStore, MemoryStore};

#[cfg(feature = "redis")]
pub use store::RedisStore;

pub use testing::{FlakyStore, ManualClock};
