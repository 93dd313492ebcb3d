//! In-memory store implementation for tests and single-process deployments.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use super::{key_matcher, resolve_range, KeyValueStore};
use crate::clock::Clock;
use crate::error::{StoreError, StoreResult};

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    ZSet(HashMap<String, i64>),
    List(VecDeque<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<i64>,
}

/// In-memory key-value store.
///
/// All keys live behind one mutex, so every primitive is trivially atomic.
/// Expired keys are dropped lazily when touched. Data is lost on restart.
pub struct MemoryStore {
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    /// Create a new empty memory store.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = self.clock.now_millis();
        self.lock()
            .map(|map| map.values().filter(|e| !expired(e, now)).count())
            .unwrap_or(0)
    }

    /// Whether the store holds no live keys.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, HashMap<String, Entry>>> {
        self.entries
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))
    }

    /// Lock, drop `key` if it has expired, and run `f`.
    fn with_key<R>(
        &self,
        key: &str,
        f: impl FnOnce(&mut HashMap<String, Entry>, i64) -> StoreResult<R>,
    ) -> StoreResult<R> {
        let now = self.clock.now_millis();
        let mut map = self.lock()?;
        if map.get(key).is_some_and(|e| expired(e, now)) {
            map.remove(key);
        }
        f(&mut map, now)
    }
}

fn expired(entry: &Entry, now: i64) -> bool {
    entry.expires_at.is_some_and(|at| at <= now)
}

fn ttl_millis(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX).max(1)
}

fn zset_mut<'a>(
    map: &'a mut HashMap<String, Entry>,
    key: &str,
) -> StoreResult<&'a mut HashMap<String, i64>> {
    let entry = map.entry(key.to_string()).or_insert_with(|| Entry {
        value: Value::ZSet(HashMap::new()),
        expires_at: None,
    });
    match &mut entry.value {
        Value::ZSet(set) => Ok(set),
        _ => Err(StoreError::WrongType {
            key: key.to_string(),
        }),
    }
}

/// Increment the counter at `key`, creating it at zero first.
fn counter_mut<'a>(
    map: &'a mut HashMap<String, Entry>,
    key: &str,
) -> StoreResult<(i64, &'a mut Entry)> {
    let entry = map.entry(key.to_string()).or_insert_with(|| Entry {
        value: Value::Str("0".to_string()),
        expires_at: None,
    });
    let Value::Str(s) = &mut entry.value else {
        return Err(StoreError::WrongType {
            key: key.to_string(),
        });
    };
    let next = s.parse::<i64>().map_err(|_| StoreError::WrongType {
        key: key.to_string(),
    })? + 1;
    *s = next.to_string();
    Ok((next, entry))
}

fn list_mut<'a>(
    map: &'a mut HashMap<String, Entry>,
    key: &str,
) -> StoreResult<&'a mut VecDeque<String>> {
    let entry = map.entry(key.to_string()).or_insert_with(|| Entry {
        value: Value::List(VecDeque::new()),
        expires_at: None,
    });
    match &mut entry.value {
        Value::List(list) => Ok(list),
        _ => Err(StoreError::WrongType {
            key: key.to_string(),
        }),
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.with_key(key, |map, _| match map.get(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::Str(s),
                ..
            }) => Ok(Some(s.clone())),
            Some(_) => Err(StoreError::WrongType {
                key: key.to_string(),
            }),
        })
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        self.with_key(key, |map, now| {
            map.insert(
                key.to_string(),
                Entry {
                    value: Value::Str(value.to_string()),
                    expires_at: Some(now + ttl_millis(ttl)),
                },
            );
            Ok(())
        })
    }

    async fn delete(&self, keys: &[String]) -> StoreResult<usize> {
        let now = self.clock.now_millis();
        let mut map = self.lock()?;
        let mut removed = 0;
        for key in keys {
            if let Some(entry) = map.remove(key) {
                if !expired(&entry, now) {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    async fn keys(&self, pattern: &str) -> StoreResult<Vec<String>> {
        let matcher = key_matcher(pattern)?;
        let now = self.clock.now_millis();
        let mut map = self.lock()?;
        map.retain(|_, e| !expired(e, now));
        let mut keys: Vec<String> = map
            .keys()
            .filter(|k| matcher.is_match(k.as_str()))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn incr(&self, key: &str) -> StoreResult<i64> {
        self.with_key(key, |map, _| counter_mut(map, key).map(|(next, _)| next))
    }

    async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> StoreResult<i64> {
        self.with_key(key, |map, now| {
            let (next, entry) = counter_mut(map, key)?;
            if entry.expires_at.is_none() {
                entry.expires_at = Some(now + ttl_millis(ttl));
            }
            Ok(next)
        })
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        self.with_key(key, |map, now| match map.get_mut(key) {
            Some(entry) => {
                entry.expires_at = Some(now + ttl_millis(ttl));
                Ok(true)
            }
            None => Ok(false),
        })
    }

    async fn zadd(&self, key: &str, member: &str, score: i64) -> StoreResult<()> {
        self.with_key(key, |map, _| {
            zset_mut(map, key)?.insert(member.to_string(), score);
            Ok(())
        })
    }

    async fn zrem(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.with_key(key, |map, _| {
            if !map.contains_key(key) {
                return Ok(false);
            }
            let set = zset_mut(map, key)?;
            let removed = set.remove(member).is_some();
            if set.is_empty() {
                map.remove(key);
            }
            Ok(removed)
        })
    }

    async fn zremrangebyscore(&self, key: &str, min: i64, max: i64) -> StoreResult<usize> {
        self.with_key(key, |map, _| {
            if !map.contains_key(key) {
                return Ok(0);
            }
            let set = zset_mut(map, key)?;
            let before = set.len();
            set.retain(|_, score| *score < min || *score > max);
            Ok(before - set.len())
        })
    }

    async fn zcard(&self, key: &str) -> StoreResult<usize> {
        self.with_key(key, |map, _| match map.get(key) {
            None => Ok(0),
            Some(Entry {
                value: Value::ZSet(set),
                ..
            }) => Ok(set.len()),
            Some(_) => Err(StoreError::WrongType {
                key: key.to_string(),
            }),
        })
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
        self.with_key(key, |map, now| {
            let set = zset_mut(map, key)?;
            set.retain(|_, s| *s >= window_start);
            if set.len() >= limit {
                return Ok(false);
            }
            set.insert(member.to_string(), score);
            if let Some(entry) = map.get_mut(key) {
                entry.expires_at = Some(now + ttl_millis(ttl));
            }
            Ok(true)
        })
    }

    async fn lpush_trim(&self, key: &str, value: &str, cap: usize) -> StoreResult<()> {
        self.with_key(key, |map, _| {
            let list = list_mut(map, key)?;
            list.push_front(value.to_string());
            list.truncate(cap);
            Ok(())
        })
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> StoreResult<Vec<String>> {
        self.with_key(key, |map, _| match map.get(key) {
            None => Ok(Vec::new()),
            Some(Entry {
                value: Value::List(list),
                ..
            }) => Ok(resolve_range(list.len(), start, stop)
                .map(|(a, b)| list.range(a..=b).cloned().collect())
                .unwrap_or_default()),
            Some(_) => Err(StoreError::WrongType {
                key: key.to_string(),
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ManualClock;

    fn store() -> (Arc<ManualClock>, MemoryStore) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let store = MemoryStore::new(clock.clone());
        (clock, store)
    }

    #[tokio::test]
    async fn test_set_ex_expires() {
        let (clock, store) = store();
        store
            .set_ex("k", "v", Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some("v".to_string()));

        clock.advance(Duration::from_secs(10));
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_incr_and_expire() {
        let (clock, store) = store();
        assert_eq!(store.incr("c").await.unwrap(), 1);
        assert_eq!(store.incr("c").await.unwrap(), 2);
        assert!(store.expire("c", Duration::from_secs(1)).await.unwrap());
        clock.advance(Duration::from_secs(2));
        assert_eq!(store.incr("c").await.unwrap(), 1);
        assert!(!store.expire("missing", Duration::from_secs(1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_incr_with_ttl_expires_from_first_increment() {
        let (clock, store) = store();
        let ttl = Duration::from_secs(10);
        assert_eq!(store.incr_with_ttl("c", ttl).await.unwrap(), 1);

        // Later increments do not push the expiry out
        clock.advance(Duration::from_secs(6));
        assert_eq!(store.incr_with_ttl("c", ttl).await.unwrap(), 2);
        clock.advance(Duration::from_secs(4));
        assert_eq!(store.incr_with_ttl("c", ttl).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_incr_with_ttl_heals_counter_without_expiry() {
        let (clock, store) = store();
        store.incr("c").await.unwrap();
        assert_eq!(store.incr_with_ttl("c", Duration::from_secs(1)).await.unwrap(), 2);
        clock.advance(Duration::from_secs(1));
        assert_eq!(store.len(), 0);
    }

    #[tokio::test]
    async fn test_zadd_within_limit_prunes_old_members() {
        let (_clock, store) = store();
        let ttl = Duration::from_secs(60);

        assert!(store.zadd_within_limit("z", "a", 100, 0, 2, ttl).await.unwrap());
        assert!(store.zadd_within_limit("z", "b", 200, 0, 2, ttl).await.unwrap());
        assert!(!store.zadd_within_limit("z", "c", 300, 0, 2, ttl).await.unwrap());

        // Window moves past "a"
        assert!(store.zadd_within_limit("z", "c", 300, 150, 2, ttl).await.unwrap());
        assert_eq!(store.zcard("z").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_zrem_and_range_removal() {
        let (_clock, store) = store();
        store.zadd("z", "a", 1).await.unwrap();
        store.zadd("z", "b", 5).await.unwrap();
        store.zadd("z", "c", 9).await.unwrap();

        assert_eq!(store.zremrangebyscore("z", 0, 5).await.unwrap(), 2);
        assert!(store.zrem("z", "c").await.unwrap());
        assert!(!store.zrem("z", "c").await.unwrap());
        assert_eq!(store.zcard("z").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_lpush_trim_keeps_most_recent_first() {
        let (_clock, store) = store();
        for i in 0..5 {
            store.lpush_trim("l", &i.to_string(), 3).await.unwrap();
        }
        assert_eq!(store.lrange("l", 0, -1).await.unwrap(), vec!["4", "3", "2"]);
        assert_eq!(store.lrange("l", 0, 0).await.unwrap(), vec!["4"]);
    }

    #[tokio::test]
    async fn test_keys_and_delete() {
        let (_clock, store) = store();
        let ttl = Duration::from_secs(60);
        store.set_ex("cache:a:1", "x", ttl).await.unwrap();
        store.set_ex("cache:b:1", "x", ttl).await.unwrap();
        store.set_ex("cache:a:2", "x", ttl).await.unwrap();

        let keys = store.keys("cache:*:1").await.unwrap();
        assert_eq!(keys, vec!["cache:a:1", "cache:b:1"]);
        assert_eq!(store.delete(&keys).await.unwrap(), 2);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_wrong_type() {
        let (_clock, store) = store();
        store.lpush_trim("l", "x", 10).await.unwrap();
        assert!(matches!(
            store.get("l").await,
            Err(StoreError::WrongType { .. })
        ));
    }
}
