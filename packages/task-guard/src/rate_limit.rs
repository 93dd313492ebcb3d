//! Sliding-window-log rate limiter.
//!
//! Each admitted request is a member of a sorted set scored by its admission
//! time. A request is admitted when fewer than `limit` members score inside
//! the trailing window. Prune, count and add happen in one atomic store step
//! ([`KeyValueStore::zadd_within_limit`]), so concurrent callers across
//! processes can never over-admit.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{GuardError, GuardResult, StoreError};
use crate::store::KeyValueStore;

/// What to do when the backing store cannot be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreFailurePolicy {
    /// Surface the store error. Use for limiters that protect a boundary.
    #[default]
    FailClosed,
    /// Retry the store once, then admit without recording the request.
    FailOpen,
}

/// A slot held in a limiter window.
///
/// Release it with [`SlidingWindowLimiter::release`] when the work it guarded
/// never actually ran (cancelled before start, rejected downstream).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotReservation {
    key: String,
    member: Option<String>,
    acquired_at: i64,
}

impl SlotReservation {
    /// Limiter key the slot was taken from.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Admission time in epoch milliseconds.
    pub fn acquired_at(&self) -> i64 {
        self.acquired_at
    }

    /// False when the slot was granted by [`StoreFailurePolicy::FailOpen`]
    /// without being recorded in the store.
    pub fn is_tracked(&self) -> bool {
        self.member.is_some()
    }
}

/// Sliding-window-log limiter over a [`KeyValueStore`].
pub struct SlidingWindowLimiter {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    namespace: String,
    failure_policy: StoreFailurePolicy,
}

impl SlidingWindowLimiter {
    /// Create a limiter whose keys live under `namespace`. Defaults to
    /// [`StoreFailurePolicy::FailClosed`].
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            store,
            clock,
            namespace: namespace.into(),
            failure_policy: StoreFailurePolicy::default(),
        }
    }

    /// Set the store failure policy.
    pub fn with_failure_policy(mut self, policy: StoreFailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn failure_policy(&self) -> StoreFailurePolicy {
        self.failure_policy
    }

    fn storage_key(&self, key: &str) -> String {
        format!("{}:{}", self.namespace, key)
    }

    /// Check-and-record in one step. Returns `true` if admitted.
    pub async fn allow(&self, key: &str, limit: usize, window: Duration) -> GuardResult<bool> {
        Ok(self.try_acquire(key, limit, window).await?.is_some())
    }

    /// Take a slot if one is free, returning a reservation that can later be
    /// released.
    pub async fn try_acquire(
        &self,
        key: &str,
        limit: usize,
        window: Duration,
    ) -> GuardResult<Option<SlotReservation>> {
        validate(limit, window)?;

        let now = self.clock.now_millis();
        let window_ms = window_millis(window);
        let member = format!("{}-{}", now, Uuid::new_v4());
        let storage_key = self.storage_key(key);

        let mut attempt = self
            .admit(&storage_key, &member, now, window_ms, limit, window)
            .await;

        if attempt.is_err() && self.failure_policy == StoreFailurePolicy::FailOpen {
            attempt = self
                .admit(&storage_key, &member, now, window_ms, limit, window)
                .await;
        }

        match attempt {
            Ok(true) => {
                debug!(key = %key, limit, "Rate limit slot acquired");
                Ok(Some(SlotReservation {
                    key: key.to_string(),
                    member: Some(member),
                    acquired_at: now,
                }))
            }
            Ok(false) => {
                debug!(key = %key, limit, "Rate limit window full");
                Ok(None)
            }
            Err(err) => match self.failure_policy {
                StoreFailurePolicy::FailClosed => Err(GuardError::Store(err)),
                StoreFailurePolicy::FailOpen => {
                    warn!(key = %key, error = %err, "Rate limit store unavailable, admitting untracked");
                    Ok(Some(SlotReservation {
                        key: key.to_string(),
                        member: None,
                        acquired_at: now,
                    }))
                }
            },
        }
    }

    async fn admit(
        &self,
        storage_key: &str,
        member: &str,
        now: i64,
        window_ms: i64,
        limit: usize,
        window: Duration,
    ) -> Result<bool, StoreError> {
        // Members strictly older than `now - window` fall out of the window
        let window_start = now - window_ms + 1;
        self.store
            .zadd_within_limit(storage_key, member, now, window_start, limit, window)
            .await
    }

    /// Give a slot back so the next caller can use it.
    pub async fn release(&self, reservation: &SlotReservation) -> GuardResult<()> {
        let Some(member) = &reservation.member else {
            return Ok(());
        };
        let storage_key = self.storage_key(&reservation.key);
        match self.store.zrem(&storage_key, member).await {
            Ok(_) => {
                debug!(key = %reservation.key, "Rate limit slot released");
                Ok(())
            }
            Err(err) if self.failure_policy == StoreFailurePolicy::FailOpen => {
                warn!(key = %reservation.key, error = %err, "Failed to release rate limit slot");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Number of slots currently taken in the trailing window.
    pub async fn in_window(&self, key: &str, window: Duration) -> GuardResult<usize> {
        let now = self.clock.now_millis();
        let storage_key = self.storage_key(key);
        self.store
            .zremrangebyscore(&storage_key, i64::MIN, now - window_millis(window))
            .await?;
        Ok(self.store.zcard(&storage_key).await?)
    }

    /// Poll until a slot is free.
    ///
    /// Returns [`GuardError::Cancelled`] as soon as `cancel` fires and
    /// [`GuardError::TimedOut`] once `max_wait` has elapsed without a slot.
    pub async fn wait_for_slot(
        &self,
        key: &str,
        limit: usize,
        window: Duration,
        poll_interval: Duration,
        cancel: &CancellationToken,
        max_wait: Option<Duration>,
    ) -> GuardResult<SlotReservation> {
        let deadline = max_wait.map(|d| tokio::time::Instant::now() + d);

        loop {
            if cancel.is_cancelled() {
                return Err(GuardError::Cancelled);
            }

            if let Some(reservation) = self.try_acquire(key, limit, window).await? {
                return Ok(reservation);
            }

            let mut sleep_for = poll_interval;
            if let Some(deadline) = deadline {
                let now = tokio::time::Instant::now();
                if now >= deadline {
                    return Err(GuardError::TimedOut(max_wait.unwrap_or_default()));
                }
                sleep_for = sleep_for.min(deadline - now);
            }

            debug!(key = %key, wait_ms = sleep_for.as_millis() as u64, "Waiting for rate limit slot");

            tokio::select! {
                _ = cancel.cancelled() => return Err(GuardError::Cancelled),
                _ = tokio::time::sleep(sleep_for) => {}
            }
        }
    }
}

fn validate(limit: usize, window: Duration) -> GuardResult<()> {
    if limit == 0 {
        return Err(GuardError::InvalidArgument(
            "rate limit must be at least 1".to_string(),
        ));
    }
    if window.is_zero() {
        return Err(GuardError::InvalidArgument(
            "rate limit window must be non-zero".to_string(),
        ));
    }
    Ok(())
}

fn window_millis(window: Duration) -> i64 {
    i64::try_from(window.as_millis()).unwrap_or(i64::MAX).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::testing::{FlakyStore, ManualClock};

    fn limiter() -> (Arc<ManualClock>, SlidingWindowLimiter) {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let store = Arc::new(MemoryStore::new(clock.clone()));
        (clock.clone(), SlidingWindowLimiter::new(store, clock, "rl"))
    }

    #[tokio::test]
    async fn test_admits_up_to_limit() {
        let (_clock, limiter) = limiter();
        let window = Duration::from_secs(60);

        for _ in 0..3 {
            assert!(limiter.allow("user:1", 3, window).await.unwrap());
        }
        assert!(!limiter.allow("user:1", 3, window).await.unwrap());

        // Other keys are independent
        assert!(limiter.allow("user:2", 3, window).await.unwrap());
    }

    #[tokio::test]
    async fn test_window_slides() {
        let (clock, limiter) = limiter();
        let window = Duration::from_secs(60);

        assert!(limiter.allow("k", 2, window).await.unwrap());
        clock.advance(Duration::from_secs(30));
        assert!(limiter.allow("k", 2, window).await.unwrap());
        assert!(!limiter.allow("k", 2, window).await.unwrap());

        // First request leaves the window, second is still inside
        clock.advance(Duration::from_secs(30));
        assert!(limiter.allow("k", 2, window).await.unwrap());
        assert!(!limiter.allow("k", 2, window).await.unwrap());
        assert_eq!(limiter.in_window("k", window).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_release_frees_slot() {
        let (_clock, limiter) = limiter();
        let window = Duration::from_secs(60);

        let slot = limiter.try_acquire("k", 1, window).await.unwrap().unwrap();
        assert!(limiter.try_acquire("k", 1, window).await.unwrap().is_none());

        limiter.release(&slot).await.unwrap();
        assert!(limiter.try_acquire("k", 1, window).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_rejects_zero_limit() {
        let (_clock, limiter) = limiter();
        let result = limiter.allow("k", 0, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(GuardError::InvalidArgument(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_slot_cancelled() {
        let (_clock, limiter) = limiter();
        let window = Duration::from_secs(60);
        assert!(limiter.allow("k", 1, window).await.unwrap());

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = limiter
            .wait_for_slot("k", 1, window, Duration::from_secs(1), &cancel, None)
            .await;
        assert!(matches!(result, Err(GuardError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_slot_times_out() {
        let (_clock, limiter) = limiter();
        let window = Duration::from_secs(60);
        assert!(limiter.allow("k", 1, window).await.unwrap());

        let cancel = CancellationToken::new();
        let result = limiter
            .wait_for_slot(
                "k",
                1,
                window,
                Duration::from_secs(1),
                &cancel,
                Some(Duration::from_secs(5)),
            )
            .await;
        assert!(matches!(result, Err(GuardError::TimedOut(_))));
    }

    #[tokio::test]
    async fn test_fail_closed_surfaces_store_error() {
        let clock = Arc::new(ManualClock::new(0));
        let store = Arc::new(FlakyStore::new(Arc::new(MemoryStore::new(clock.clone()))));
        store.set_unavailable(true);
        let limiter = SlidingWindowLimiter::new(store, clock, "rl");

        let result = limiter.allow("k", 5, Duration::from_secs(60)).await;
        assert!(matches!(result, Err(GuardError::Store(_))));
    }

    #[tokio::test]
    async fn test_fail_open_retries_then_admits_untracked() {
        let clock = Arc::new(ManualClock::new(0));
        let store = Arc::new(FlakyStore::new(Arc::new(MemoryStore::new(clock.clone()))));
        let limiter = SlidingWindowLimiter::new(store.clone(), clock, "rl")
            .with_failure_policy(StoreFailurePolicy::FailOpen);

        // One transient failure is absorbed by the retry
        store.fail_next(1);
        let slot = limiter
            .try_acquire("k", 5, Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        assert!(slot.is_tracked());

        // Persistent outage admits without recording
        store.set_unavailable(true);
        let slot = limiter
            .try_acquire("k", 5, Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        assert!(!slot.is_tracked());
        limiter.release(&slot).await.unwrap();
    }
}
