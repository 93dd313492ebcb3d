use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use task_guard::{CacheManager, GuardError, RetryPolicy, SlidingWindowLimiter, SlotReservation};
use tracing::{debug, error, warn};

use super::wrapper::RateLimit;
use super::{UnitOfWork, WorkContext, WorkUnit};
use crate::error::{AuditError, AuditResult, ErrorKind};
use crate::models::StageOutput;

// =============================================================================
// Guarded
// =============================================================================

/// Outermost layer: every failure leaves as a [`AuditError::TaskExecution`]
/// carrying the original error's type and message, logged once.
pub struct Guarded {
    inner: Arc<dyn UnitOfWork>,
}

impl Guarded {
    pub fn new(inner: Arc<dyn UnitOfWork>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl UnitOfWork for Guarded {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn run(&self, unit: &WorkUnit, ctx: &WorkContext) -> AuditResult<StageOutput> {
        match self.inner.run(unit, ctx).await {
            Ok(output) => Ok(output),
            Err(err) => {
                let task_error = err.into_task_error(&unit.task_name);
                if task_error.kind == ErrorKind::Cancelled {
                    warn!(
                        task_name = %task_error.task_name,
                        audit_id = %unit.audit_id,
                        error_type = %task_error.error_type,
                        error_message = %task_error.error_message,
                        "Task cancelled"
                    );
                } else {
                    error!(
                        task_name = %task_error.task_name,
                        audit_id = %unit.audit_id,
                        error_type = %task_error.error_type,
                        error_message = %task_error.error_message,
                        "Task failed"
                    );
                }
                Err(AuditError::TaskExecution(task_error))
            }
        }
    }
}

// =============================================================================
// Retrying
// =============================================================================

pub struct Retrying {
    inner: Arc<dyn UnitOfWork>,
    policy: RetryPolicy,
}

impl Retrying {
    pub fn new(inner: Arc<dyn UnitOfWork>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl UnitOfWork for Retrying {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn run(&self, unit: &WorkUnit, ctx: &WorkContext) -> AuditResult<StageOutput> {
        let inner = &self.inner;
        self.policy
            .run(&unit.task_name, move |attempt| {
                debug!(task_name = %unit.task_name, attempt, "Running task");
                inner.run(unit, ctx)
            })
            .await
    }
}

// =============================================================================
// Cached
// =============================================================================

/// Serves complete results from the cache. Partial results and failures are
/// returned but never stored.
pub struct Cached {
    inner: Arc<dyn UnitOfWork>,
    cache: Arc<CacheManager>,
    ttl: Duration,
}

impl Cached {
    pub fn new(inner: Arc<dyn UnitOfWork>, cache: Arc<CacheManager>, ttl: Duration) -> Self {
        Self { inner, cache, ttl }
    }
}

#[async_trait]
impl UnitOfWork for Cached {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn run(&self, unit: &WorkUnit, ctx: &WorkContext) -> AuditResult<StageOutput> {
        let key = unit.cache_key();
        self.cache
            .get_or_compute_when(
                &key,
                Some(self.ttl),
                || self.inner.run(unit, ctx),
                |output: &StageOutput| output.complete,
            )
            .await
    }
}

// =============================================================================
// RateLimited
// =============================================================================

/// Holds one slot of the per-task window for the duration of a run.
///
/// A run that ends cancelled or timed out, or whose future is dropped, gives
/// its slot back. Runs that finish (successfully or not) keep it.
pub struct RateLimited {
    inner: Arc<dyn UnitOfWork>,
    limiter: Arc<SlidingWindowLimiter>,
    limit: RateLimit,
}

impl RateLimited {
    pub fn new(
        inner: Arc<dyn UnitOfWork>,
        limiter: Arc<SlidingWindowLimiter>,
        limit: RateLimit,
    ) -> Self {
        Self {
            inner,
            limiter,
            limit,
        }
    }
}

#[async_trait]
impl UnitOfWork for RateLimited {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn run(&self, unit: &WorkUnit, ctx: &WorkContext) -> AuditResult<StageOutput> {
        let reservation = self
            .limiter
            .wait_for_slot(
                &unit.task_name,
                self.limit.limit,
                self.limit.window,
                self.limit.poll_interval,
                &ctx.cancel,
                self.limit.max_wait,
            )
            .await
            .map_err(|err| match err {
                GuardError::TimedOut(_) => AuditError::RateLimitExceeded {
                    key: unit.task_name.clone(),
                },
                other => AuditError::from(other),
            })?;

        let mut slot = SlotGuard::new(self.limiter.clone(), reservation);
        let result = self.inner.run(unit, ctx).await;
        match &result {
            Err(AuditError::Cancelled) | Err(AuditError::TimedOut(_)) => slot.release().await,
            _ => slot.keep(),
        }
        result
    }
}

struct SlotGuard {
    limiter: Arc<SlidingWindowLimiter>,
    reservation: Option<SlotReservation>,
}

impl SlotGuard {
    fn new(limiter: Arc<SlidingWindowLimiter>, reservation: SlotReservation) -> Self {
        Self {
            limiter,
            reservation: Some(reservation),
        }
    }

    fn keep(&mut self) {
        self.reservation = None;
    }

    async fn release(&mut self) {
        if let Some(reservation) = self.reservation.take() {
            if let Err(err) = self.limiter.release(&reservation).await {
                warn!(key = %reservation.key(), error = %err, "Failed to release rate limit slot");
            }
        }
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let Some(reservation) = self.reservation.take() else {
            return;
        };
        // Dropped mid-run: the store call is async, so hand it to the runtime
        let limiter = self.limiter.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(err) = limiter.release(&reservation).await {
                        warn!(key = %reservation.key(), error = %err, "Failed to release rate limit slot");
                    }
                });
            }
            Err(_) => {
                warn!(key = %reservation.key(), "No runtime to release rate limit slot, it expires with the window");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;
    use task_guard::{ManualClock, MemoryStore};
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::models::AuditId;

    /// Fails with `error` for the first `failures` runs, then returns `output`.
    struct Scripted {
        calls: AtomicUsize,
        failures: usize,
        error: fn() -> AuditError,
        output: StageOutput,
    }

    impl Scripted {
        fn ok(output: StageOutput) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                failures: 0,
                error: || AuditError::Validation("unused".into()),
                output,
            })
        }

        fn failing(failures: usize, error: fn() -> AuditError) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                failures,
                error,
                output: StageOutput::complete(json!({"ok": true})),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl UnitOfWork for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn run(&self, _unit: &WorkUnit, _ctx: &WorkContext) -> AuditResult<StageOutput> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err((self.error)());
            }
            Ok(self.output.clone())
        }
    }

    struct Hangs;

    #[async_trait]
    impl UnitOfWork for Hangs {
        fn name(&self) -> &str {
            "hangs"
        }

        async fn run(&self, _unit: &WorkUnit, _ctx: &WorkContext) -> AuditResult<StageOutput> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(StageOutput::complete(json!(null)))
        }
    }

    fn unit() -> WorkUnit {
        WorkUnit::new("links", AuditId::new(), json!({}))
    }

    fn ctx() -> WorkContext {
        WorkContext::new(CancellationToken::new())
    }

    fn limiter() -> Arc<SlidingWindowLimiter> {
        let clock = Arc::new(ManualClock::new(1_000));
        let store = Arc::new(MemoryStore::new(clock.clone()));
        Arc::new(SlidingWindowLimiter::new(store, clock, "task_limit"))
    }

    fn cache() -> Arc<CacheManager> {
        let clock = Arc::new(ManualClock::new(0));
        Arc::new(CacheManager::new(Arc::new(MemoryStore::new(clock)), "cache"))
    }

    fn one_per_minute() -> RateLimit {
        RateLimit::new(1, Duration::from_secs(60))
            .with_poll_interval(Duration::from_millis(10))
            .with_max_wait(Some(Duration::from_millis(50)))
    }

    #[tokio::test]
    async fn test_guarded_wraps_original_details() {
        let inner = Scripted::failing(1, || AuditError::Validation("bad url".into()));
        let guarded = Guarded::new(inner);

        let err = guarded.run(&unit(), &ctx()).await.unwrap_err();
        let AuditError::TaskExecution(task) = err else {
            panic!("expected a task execution error");
        };
        assert_eq!(task.task_name, "links");
        assert_eq!(task.error_type, "ValidationError");
        assert!(task.error_message.contains("bad url"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retrying_only_retries_transient() {
        let flaky = Scripted::failing(2, || AuditError::TransientDependency {
            dependency: "serp".into(),
            message: "503".into(),
        });
        let retrying = Retrying::new(flaky.clone(), RetryPolicy::new(3));
        assert!(retrying.run(&unit(), &ctx()).await.is_ok());
        assert_eq!(flaky.calls(), 3);

        let invalid = Scripted::failing(5, || AuditError::Validation("no pages".into()));
        let retrying = Retrying::new(invalid.clone(), RetryPolicy::new(3));
        assert!(retrying.run(&unit(), &ctx()).await.is_err());
        assert_eq!(invalid.calls(), 1);
    }

    #[tokio::test]
    async fn test_cached_skips_partial_results() {
        let cache = cache();
        let partial = Scripted::ok(StageOutput::partial(json!({"pagesCrawled": 2})));
        let cached = Cached::new(partial.clone(), cache.clone(), Duration::from_secs(60));

        cached.run(&unit(), &ctx()).await.unwrap();
        cached.run(&unit(), &ctx()).await.unwrap();
        assert_eq!(partial.calls(), 2);

        let complete = Scripted::ok(StageOutput::complete(json!({"totalImages": 4})));
        let cached = Cached::new(complete.clone(), cache, Duration::from_secs(60));
        let first = cached.run(&unit(), &ctx()).await.unwrap();
        let second = cached.run(&unit(), &ctx()).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(complete.calls(), 1);
    }

    #[tokio::test]
    async fn test_rate_limited_rejects_when_window_full() {
        let limiter = limiter();
        let inner = Scripted::ok(StageOutput::complete(json!({})));
        let limited = RateLimited::new(inner.clone(), limiter.clone(), one_per_minute());

        limited.run(&unit(), &ctx()).await.unwrap();
        let second = limited.run(&unit(), &ctx()).await;
        assert!(matches!(second, Err(AuditError::RateLimitExceeded { .. })));
        assert_eq!(inner.calls(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_run_releases_slot() {
        let limiter = limiter();
        let inner = Scripted::failing(1, || AuditError::Cancelled);
        let limited = RateLimited::new(inner, limiter.clone(), one_per_minute());

        let result = limited.run(&unit(), &ctx()).await;
        assert!(matches!(result, Err(AuditError::Cancelled)));
        assert_eq!(
            limiter.in_window("links", Duration::from_secs(60)).await.unwrap(),
            0
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_run_releases_slot() {
        let limiter = limiter();
        let limited = RateLimited::new(Arc::new(Hangs), limiter.clone(), one_per_minute());

        let unit = unit();
        let ctx = ctx();
        let outcome = tokio::time::timeout(Duration::from_secs(1), limited.run(&unit, &ctx)).await;
        assert!(outcome.is_err());

        let mut remaining = 1;
        for _ in 0..10 {
            tokio::task::yield_now().await;
            remaining = limiter
                .in_window("links", Duration::from_secs(60))
                .await
                .unwrap();
            if remaining == 0 {
                break;
            }
        }
        assert_eq!(remaining, 0);
    }

    #[tokio::test]
    async fn test_rate_limited_wait_is_cancellable() {
        let limiter = limiter();
        let inner = Scripted::ok(StageOutput::complete(json!({})));
        let limited = RateLimited::new(
            inner,
            limiter,
            one_per_minute().with_max_wait(None),
        );
        limited.run(&unit(), &ctx()).await.unwrap();

        let ctx = ctx();
        ctx.cancel.cancel();
        let result = limited.run(&unit(), &ctx).await;
        assert!(matches!(result, Err(AuditError::Cancelled)));
    }
}
