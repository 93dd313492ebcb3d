//! Per-dependency circuit breakers.
//!
//! A breaker counts consecutive transient failures of one dependency. At
//! `failure_threshold` it opens and rejects calls without running them for
//! `recovery_timeout`. After that a single trial call is let through
//! (half-open): success closes the breaker, failure opens it again with a
//! fresh timeout.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use dashmap::DashMap;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::retry::Transient;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        };
        f.write_str(s)
    }
}

/// Error from a call made through a breaker.
#[derive(Debug)]
pub enum CircuitError<E> {
    /// The breaker rejected the call without running it
    Open { dependency: String },
    /// The call ran and failed
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for CircuitError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitError::Open { dependency } => write!(f, "circuit open for {}", dependency),
            CircuitError::Inner(err) => err.fmt(f),
        }
    }
}

impl<E> std::error::Error for CircuitError<E>
where
    E: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CircuitError::Open { .. } => None,
            CircuitError::Inner(err) => Some(err),
        }
    }
}

/// An open breaker is worth retrying later; the inner error decides otherwise.
impl<E: Transient> Transient for CircuitError<E> {
    fn is_transient(&self) -> bool {
        match self {
            CircuitError::Open { .. } => true,
            CircuitError::Inner(err) => err.is_transient(),
        }
    }
}

#[derive(Debug)]
enum Phase {
    Closed,
    Open { until: i64 },
    HalfOpen { trial_in_flight: bool },
}

#[derive(Debug)]
struct BreakerState {
    phase: Phase,
    consecutive_failures: u32,
}

/// Breaker guarding one named dependency.
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<BreakerState>,
}

enum Permit {
    Normal,
    Trial,
}

/// Resets an abandoned trial so a dropped call cannot wedge the breaker.
struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.breaker.lock();
            if let Phase::HalfOpen { trial_in_flight } = &mut state.phase {
                *trial_in_flight = false;
            }
        }
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            name: name.into(),
            config,
            clock,
            state: Mutex::new(BreakerState {
                phase: Phase::Closed,
                consecutive_failures: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        // State is a couple of plain fields; a poisoned lock still holds a usable value
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current state as seen by the next caller.
    pub fn state(&self) -> CircuitState {
        let state = self.lock();
        match state.phase {
            Phase::Closed => CircuitState::Closed,
            Phase::Open { until } if self.clock.now_millis() >= until => CircuitState::HalfOpen,
            Phase::Open { .. } => CircuitState::Open,
            Phase::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    fn admit(&self) -> Option<Permit> {
        let now = self.clock.now_millis();
        let mut state = self.lock();
        match state.phase {
            Phase::Closed => Some(Permit::Normal),
            Phase::Open { until } if now >= until => {
                info!(dependency = %self.name, "Circuit half-open, allowing trial call");
                state.phase = Phase::HalfOpen {
                    trial_in_flight: true,
                };
                Some(Permit::Trial)
            }
            Phase::Open { .. } => None,
            Phase::HalfOpen {
                trial_in_flight: true,
            } => None,
            Phase::HalfOpen {
                trial_in_flight: false,
            } => {
                state.phase = Phase::HalfOpen {
                    trial_in_flight: true,
                };
                Some(Permit::Trial)
            }
        }
    }

    fn record_success(&self) {
        let mut state = self.lock();
        if !matches!(state.phase, Phase::Closed) {
            info!(dependency = %self.name, "Circuit closed");
        }
        state.phase = Phase::Closed;
        state.consecutive_failures = 0;
    }

    fn record_failure(&self, permit: &Permit) {
        let now = self.clock.now_millis();
        let recovery = i64::try_from(self.config.recovery_timeout.as_millis()).unwrap_or(i64::MAX);
        let mut state = self.lock();
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);

        let trip = matches!(permit, Permit::Trial)
            || state.consecutive_failures >= self.config.failure_threshold;
        if trip {
            warn!(
                dependency = %self.name,
                failures = state.consecutive_failures,
                recovery_secs = self.config.recovery_timeout.as_secs(),
                "Circuit opened"
            );
            state.phase = Phase::Open {
                until: now.saturating_add(recovery),
            };
        }
    }

    /// Run `op` through the breaker.
    ///
    /// Only transient errors count as dependency failures. A non-transient
    /// error means the dependency answered, which resets the failure count.
    pub async fn call<T, E, F, Fut>(&self, op: F) -> Result<T, CircuitError<E>>
    where
        E: Transient,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let Some(permit) = self.admit() else {
            return Err(CircuitError::Open {
                dependency: self.name.clone(),
            });
        };

        let mut guard = TrialGuard {
            breaker: self,
            armed: matches!(permit, Permit::Trial),
        };

        let result = op().await;
        guard.armed = false;

        match &result {
            Err(err) if err.is_transient() => self.record_failure(&permit),
            _ => self.record_success(),
        }
        result.map_err(CircuitError::Inner)
    }
}

/// One breaker per dependency name, created on first use.
pub struct CircuitRegistry {
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitRegistry {
    pub fn new(config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            breakers: DashMap::new(),
        }
    }

    pub fn breaker(&self, dependency: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(dependency.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    dependency,
                    self.config.clone(),
                    self.clock.clone(),
                ))
            })
            .clone()
    }

    /// Snapshot of every known breaker, sorted by name.
    pub fn states(&self) -> Vec<(String, CircuitState)> {
        let mut states: Vec<_> = self
            .breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().state()))
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }
}
