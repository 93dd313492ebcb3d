//! Wall-clock abstraction.
//!
//! Windows, TTLs and breaker timeouts are measured in epoch milliseconds so the
//! same numbers can be stored in a shared key-value store and compared across
//! processes.

use chrono::Utc;

/// Source of the current time in milliseconds since the Unix epoch.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;
}

/// Clock backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}
