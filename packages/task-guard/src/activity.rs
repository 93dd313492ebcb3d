//! Sliding-window anomaly detection per actor.
//!
//! Every access attempt is pushed onto the actor's capped activity ring
//! (most recent first). After each push the fixed rules are evaluated over the
//! newest entries; a match appends an alert to a global feed and blocks the
//! actor for a while. Detection is advisory: callers combine it with a real
//! limiter rather than relying on it alone.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::error::{GuardResult, StoreError};
use crate::store::KeyValueStore;

const ALERT_FEED_KEY: &str = "security_alerts";

/// One recorded action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub actor: String,
    pub action: String,
    /// Epoch milliseconds
    pub timestamp: i64,
    #[serde(default)]
    pub details: serde_json::Value,
}

/// "At least `threshold` matching actions within `window`".
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityRule {
    pub name: String,
    /// Action to count; `None` counts every action
    pub action: Option<String>,
    pub threshold: usize,
    pub window: Duration,
}

impl ActivityRule {
    /// Five failed logins within five minutes.
    pub fn failed_logins() -> Self {
        Self {
            name: "multiple_failed_logins".to_string(),
            action: Some("login_failed".to_string()),
            threshold: 5,
            window: Duration::from_secs(300),
        }
    }

    /// Fifty actions of any kind within a minute.
    pub fn request_burst() -> Self {
        Self {
            name: "high_request_rate".to_string(),
            action: None,
            threshold: 50,
            window: Duration::from_secs(60),
        }
    }

    fn matches(&self, entry: &ActivityEntry, since: i64) -> bool {
        entry.timestamp >= since
            && self
                .action
                .as_deref()
                .map_or(true, |action| action == entry.action)
    }
}

/// Alert appended to the global feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityAlert {
    pub actor: String,
    pub rule: String,
    pub count: usize,
    pub detected_at: i64,
}

pub struct ActivityMonitor {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    rules: Vec<ActivityRule>,
    ring_cap: usize,
    inspect_last: usize,
    alert_feed_cap: usize,
    block_duration: Duration,
}

impl ActivityMonitor {
    pub fn new(store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            rules: vec![ActivityRule::failed_logins(), ActivityRule::request_burst()],
            ring_cap: 1000,
            inspect_last: 100,
            alert_feed_cap: 1000,
            block_duration: Duration::from_secs(300),
        }
    }

    pub fn with_rules(mut self, rules: Vec<ActivityRule>) -> Self {
        self.rules = rules;
        self
    }

    pub fn with_block_duration(mut self, duration: Duration) -> Self {
        self.block_duration = duration;
        self
    }

    pub fn with_ring_cap(mut self, cap: usize) -> Self {
        self.ring_cap = cap.max(1);
        self.inspect_last = self.inspect_last.min(self.ring_cap);
        self
    }

    fn ring_key(actor: &str) -> String {
        format!("user_activity:{}", actor)
    }

    fn block_key(actor: &str) -> String {
        format!("actor_blocked:{}", actor)
    }

    fn dedupe_key(actor: &str, rule: &str) -> String {
        format!("activity_alerted:{}:{}", actor, rule)
    }

    /// Record an action and evaluate the rules. Returns alerts raised by this
    /// call (already-alerted rules inside their window raise nothing).
    pub async fn log_activity(
        &self,
        actor: &str,
        action: &str,
        details: serde_json::Value,
    ) -> GuardResult<Vec<ActivityAlert>> {
        let entry = ActivityEntry {
            actor: actor.to_string(),
            action: action.to_string(),
            timestamp: self.clock.now_millis(),
            details,
        };
        let raw = serde_json::to_string(&entry).map_err(StoreError::from)?;
        self.store
            .lpush_trim(&Self::ring_key(actor), &raw, self.ring_cap)
            .await?;

        self.check_suspicious(actor).await
    }

    async fn check_suspicious(&self, actor: &str) -> GuardResult<Vec<ActivityAlert>> {
        let recent = self.recent_activity(actor, self.inspect_last).await?;
        let now = self.clock.now_millis();
        let mut raised = Vec::new();

        for rule in &self.rules {
            let window_ms = i64::try_from(rule.window.as_millis()).unwrap_or(i64::MAX);
            let since = now.saturating_sub(window_ms);
            let count = recent.iter().filter(|e| rule.matches(e, since)).count();
            if count < rule.threshold {
                continue;
            }

            // First detection in this window wins; later matches only extend the ring
            let dedupe = Self::dedupe_key(actor, &rule.name);
            if self.store.incr_with_ttl(&dedupe, rule.window).await? > 1 {
                debug!(actor = %actor, rule = %rule.name, "Suspicious activity already alerted");
                continue;
            }

            let alert = ActivityAlert {
                actor: actor.to_string(),
                rule: rule.name.clone(),
                count,
                detected_at: now,
            };
            self.raise(&alert).await?;
            raised.push(alert);
        }

        Ok(raised)
    }

    async fn raise(&self, alert: &ActivityAlert) -> GuardResult<()> {
        warn!(
            actor = %alert.actor,
            rule = %alert.rule,
            count = alert.count,
            block_secs = self.block_duration.as_secs(),
            "Suspicious activity detected, blocking actor"
        );
        let raw = serde_json::to_string(alert).map_err(StoreError::from)?;
        self.store
            .lpush_trim(ALERT_FEED_KEY, &raw, self.alert_feed_cap)
            .await?;
        self.store
            .set_ex(&Self::block_key(&alert.actor), "1", self.block_duration)
            .await?;
        Ok(())
    }

    pub async fn is_blocked(&self, actor: &str) -> GuardResult<bool> {
        Ok(self.store.get(&Self::block_key(actor)).await?.is_some())
    }

    pub async fn unblock(&self, actor: &str) -> GuardResult<()> {
        self.store.delete(&[Self::block_key(actor)]).await?;
        Ok(())
    }

    /// Newest-first entries, at most `limit`.
    pub async fn recent_activity(&self, actor: &str, limit: usize) -> GuardResult<Vec<ActivityEntry>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let raw = self
            .store
            .lrange(&Self::ring_key(actor), 0, limit as isize - 1)
            .await?;
        Ok(decode_all(raw))
    }

    /// Newest-first alerts from the global feed.
    pub async fn alerts(&self, limit: usize) -> GuardResult<Vec<ActivityAlert>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let raw = self.store.lrange(ALERT_FEED_KEY, 0, limit as isize - 1).await?;
        Ok(decode_all(raw))
    }
}

fn decode_all<T: serde::de::DeserializeOwned>(raw: Vec<String>) -> Vec<T> {
    raw.iter()
        .filter_map(|s| match serde_json::from_str(s) {
            Ok(v) => Some(v),
            Err(err) => {
                warn!(error = %err, "Skipping undecodable activity record");
                None
            }
        })
        .collect()
}
