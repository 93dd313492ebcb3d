use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

use task_guard::{CircuitError, CircuitRegistry, RetryPolicy, Transient};

/// Retry plus circuit breaker around calls to a named dependency.
///
/// Each attempt passes through the dependency's breaker, so once it opens the
/// remaining attempts fail fast instead of hitting the dependency again.
#[derive(Clone)]
pub struct GuardedDependency {
    retry: RetryPolicy,
    breakers: Arc<CircuitRegistry>,
}

impl GuardedDependency {
    pub fn new(retry: RetryPolicy, breakers: Arc<CircuitRegistry>) -> Self {
        Self { retry, breakers }
    }

    pub fn breakers(&self) -> &Arc<CircuitRegistry> {
        &self.breakers
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub async fn call<T, E, F, Fut>(&self, dependency: &str, mut op: F) -> Result<T, E>
    where
        E: Transient + Display + From<CircuitError<E>>,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let breaker = self.breakers.breaker(dependency);
        let breaker = breaker.as_ref();
        self.retry
            .run(dependency, |_attempt| {
                let attempt = op();
                async move { breaker.call(|| attempt).await.map_err(E::from) }
            })
            .await
    }
}
