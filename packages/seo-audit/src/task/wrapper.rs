use std::sync::Arc;
use std::time::Duration;

use task_guard::{CacheManager, RetryPolicy, SlidingWindowLimiter};

use super::{Cached, Guarded, RateLimited, Retrying, Scoped, StoragePool, UnitOfWork};

/// Per-task window and how long a caller may wait for a slot.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimit {
    pub limit: usize,
    pub window: Duration,
    pub poll_interval: Duration,
    /// `None` waits until a slot frees up or the run is cancelled
    pub max_wait: Option<Duration>,
}

impl RateLimit {
    /// `limit` runs per `window`, waiting at most one window for a slot.
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit,
            window,
            poll_interval: Duration::from_secs(1),
            max_wait: Some(window),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_max_wait(mut self, max_wait: Option<Duration>) -> Self {
        self.max_wait = max_wait;
        self
    }
}

/// Assembles the decorator chain around a unit of work.
///
/// Layers are optional, but their order is fixed regardless of the order the
/// builder methods are called in.
///
/// ```rust,ignore
/// let links = TaskWrapper::new(Arc::new(LinksStage::new(fetcher)))
///     .cached(cache.clone(), Duration::from_secs(3600))
///     .rate_limited(limiter.clone(), RateLimit::new(10, Duration::from_secs(60)))
///     .scoped(pool.clone())
///     .retrying(RetryPolicy::new(3))
///     .build();
/// ```
pub struct TaskWrapper {
    unit: Arc<dyn UnitOfWork>,
    cache: Option<(Arc<CacheManager>, Duration)>,
    rate_limit: Option<(Arc<SlidingWindowLimiter>, RateLimit)>,
    pool: Option<Arc<StoragePool>>,
    retry: Option<RetryPolicy>,
}

impl TaskWrapper {
    pub fn new(unit: Arc<dyn UnitOfWork>) -> Self {
        Self {
            unit,
            cache: None,
            rate_limit: None,
            pool: None,
            retry: None,
        }
    }

    pub fn cached(mut self, cache: Arc<CacheManager>, ttl: Duration) -> Self {
        self.cache = Some((cache, ttl));
        self
    }

    pub fn rate_limited(mut self, limiter: Arc<SlidingWindowLimiter>, limit: RateLimit) -> Self {
        self.rate_limit = Some((limiter, limit));
        self
    }

    pub fn scoped(mut self, pool: Arc<StoragePool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn retrying(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    /// Wrap innermost first, ending with [`Guarded`].
    pub fn build(self) -> Arc<dyn UnitOfWork> {
        let mut unit = self.unit;
        if let Some(pool) = self.pool {
            unit = Arc::new(Scoped::new(unit, pool));
        }
        if let Some((limiter, limit)) = self.rate_limit {
            unit = Arc::new(RateLimited::new(unit, limiter, limit));
        }
        if let Some((cache, ttl)) = self.cache {
            unit = Arc::new(Cached::new(unit, cache, ttl));
        }
        if let Some(policy) = self.retry {
            unit = Arc::new(Retrying::new(unit, policy));
        }
        Arc::new(Guarded::new(unit))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use serde_json::json;
    use task_guard::{ManualClock, MemoryStore};
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::error::{AuditError, AuditResult};
    use crate::models::{AuditId, StageOutput};
    use crate::storage::{AuditRepository, MemoryAuditStore};
    use crate::task::{WorkContext, WorkUnit};

    #[derive(Default)]
    struct NeedsStorage {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl UnitOfWork for NeedsStorage {
        fn name(&self) -> &str {
            "needs_storage"
        }

        async fn run(&self, _unit: &WorkUnit, ctx: &WorkContext) -> AuditResult<StageOutput> {
            ctx.storage()?;
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(StageOutput::complete(json!({"ok": true})))
        }
    }

    #[tokio::test]
    async fn test_cache_hit_skips_rate_limit_and_storage() {
        let clock = Arc::new(ManualClock::new(1_000));
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let cache = Arc::new(CacheManager::new(store.clone(), "cache"));
        let limiter = Arc::new(SlidingWindowLimiter::new(store, clock, "task_limit"));
        let repository = AuditRepository::new(Arc::new(MemoryAuditStore::new()));
        let pool = Arc::new(StoragePool::new(repository, 1));

        let stage = Arc::new(NeedsStorage::default());
        let wrapped = TaskWrapper::new(stage.clone())
            .cached(cache, Duration::from_secs(60))
            .rate_limited(limiter.clone(), RateLimit::new(1, Duration::from_secs(60)))
            .scoped(pool.clone())
            .retrying(RetryPolicy::none())
            .build();

        let unit = WorkUnit::new("needs_storage", AuditId::new(), json!({}));
        let ctx = WorkContext::new(CancellationToken::new());
        for _ in 0..3 {
            wrapped.run(&unit, &ctx).await.unwrap();
        }

        assert_eq!(stage.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            limiter
                .in_window("needs_storage", Duration::from_secs(60))
                .await
                .unwrap(),
            1
        );
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn test_unscoped_stage_fails_as_task_error() {
        let wrapped = TaskWrapper::new(Arc::new(NeedsStorage::default())).build();
        let unit = WorkUnit::new("needs_storage", AuditId::new(), json!({}));
        let ctx = WorkContext::new(CancellationToken::new());

        let err = wrapped.run(&unit, &ctx).await.unwrap_err();
        assert!(matches!(
            err,
            AuditError::TaskExecution(ref task) if task.error_type == "StorageError"
        ));
    }
}
