use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::debug;

/// Process-local cache with per-key expirations, mirroring the hash / list /
/// sorted-set / set-if-absent shapes the hot path needs. Expiry is checked
/// lazily on access and swept periodically by the gateway.
pub struct CacheStore {
    entries: DashMap<String, Entry>,
}

struct Entry {
    value: Value,
    expires_at: Instant,
}

enum Value {
    Str(String),
    Hash(HashMap<String, String>),
    /// Head-inserted list (newest first).
    List(VecDeque<String>),
    /// Member -> score.
    ZSet(HashMap<String, f64>),
}

impl Entry {
    fn expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

impl Default for CacheStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheStore {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    fn live_entry<'a>(
        &'a self,
        key: &str,
    ) -> Option<dashmap::mapref::one::RefMut<'a, String, Entry>> {
        let entry = self.entries.get_mut(key)?;
        if entry.expired() {
            drop(entry);
            self.entries.remove(key);
            return None;
        }
        Some(entry)
    }

    // ---- strings ----

    pub fn set_string(&self, key: &str, value: String, ttl: Duration) {
        self.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value),
                expires_at: Instant::now() + ttl,
            },
        );
    }

    pub fn get_string(&self, key: &str) -> Option<String> {
        let entry = self.live_entry(key)?;
        match &entry.value {
            Value::Str(s) => Some(s.clone()),
            _ => None,
        }
    }

    /// Set-if-absent with TTL; the session-lock primitive.
    pub fn set_nx(&self, key: &str, ttl: Duration) -> bool {
        if self.live_entry(key).is_some() {
            return false;
        }
        self.set_string(key, "1".to_string(), ttl);
        true
    }

    pub fn delete(&self, key: &str) {
        self.entries.remove(key);
    }

    pub fn exists(&self, key: &str) -> bool {
        self.live_entry(key).is_some()
    }

    pub fn expire(&self, key: &str, ttl: Duration) {
        if let Some(mut entry) = self.live_entry(key) {
            entry.expires_at = Instant::now() + ttl;
        }
    }

    // ---- hashes ----

    pub fn hset(&self, key: &str, fields: &[(&str, String)], ttl: Duration) {
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry {
                value: Value::Hash(HashMap::new()),
                expires_at: Instant::now() + ttl,
            });
        if entry.expired() {
            entry.value = Value::Hash(HashMap::new());
        }
        entry.expires_at = Instant::now() + ttl;
        if let Value::Hash(map) = &mut entry.value {
            for (field, value) in fields {
                map.insert(field.to_string(), value.clone());
            }
        } else {
            let mut map = HashMap::new();
            for (field, value) in fields {
                map.insert(field.to_string(), value.clone());
            }
            entry.value = Value::Hash(map);
        }
    }

    pub fn hgetall(&self, key: &str) -> Option<HashMap<String, String>> {
        let entry = self.live_entry(key)?;
        match &entry.value {
            Value::Hash(map) => Some(map.clone()),
            _ => None,
        }
    }

    // ---- lists (head-inserted) ----

    pub fn lpush(&self, key: &str, value: String, ttl: Duration) {
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry {
                value: Value::List(VecDeque::new()),
                expires_at: Instant::now() + ttl,
            });
        if entry.expired() {
            entry.value = Value::List(VecDeque::new());
        }
        entry.expires_at = Instant::now() + ttl;
        match &mut entry.value {
            Value::List(list) => list.push_front(value),
            other => {
                let mut list = VecDeque::new();
                list.push_front(value);
                *other = Value::List(list);
            }
        }
    }

    /// Drop the oldest element (list tail).
    pub fn rpop(&self, key: &str) -> Option<String> {
        let mut entry = self.live_entry(key)?;
        match &mut entry.value {
            Value::List(list) => list.pop_back(),
            _ => None,
        }
    }

    pub fn llen(&self, key: &str) -> usize {
        self.live_entry(key)
            .map(|entry| match &entry.value {
                Value::List(list) => list.len(),
                _ => 0,
            })
            .unwrap_or(0)
    }

    /// Full list, newest first (insertion order).
    pub fn lrange_all(&self, key: &str) -> Vec<String> {
        self.live_entry(key)
            .map(|entry| match &entry.value {
                Value::List(list) => list.iter().cloned().collect(),
                _ => Vec::new(),
            })
            .unwrap_or_default()
    }

    // ---- sorted sets ----

    pub fn zadd(&self, key: &str, member: &str, score: f64, ttl: Duration) {
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry {
                value: Value::ZSet(HashMap::new()),
                expires_at: Instant::now() + ttl,
            });
        if entry.expired() {
            entry.value = Value::ZSet(HashMap::new());
        }
        entry.expires_at = Instant::now() + ttl;
        match &mut entry.value {
            Value::ZSet(set) => {
                set.insert(member.to_string(), score);
            }
            other => {
                let mut set = HashMap::new();
                set.insert(member.to_string(), score);
                *other = Value::ZSet(set);
            }
        }
    }

    /// Members by descending score, up to `limit`.
    pub fn zrevrange(&self, key: &str, limit: usize) -> Vec<String> {
        let Some(entry) = self.live_entry(key) else {
            return Vec::new();
        };
        let Value::ZSet(set) = &entry.value else {
            return Vec::new();
        };
        let mut pairs: Vec<(&String, &f64)> = set.iter().collect();
        pairs.sort_by(|a, b| b.1.partial_cmp(a.1).unwrap_or(std::cmp::Ordering::Equal));
        pairs.into_iter().take(limit).map(|(m, _)| m.clone()).collect()
    }

    pub fn zrem(&self, key: &str, member: &str) {
        if let Some(mut entry) = self.live_entry(key) {
            if let Value::ZSet(set) = &mut entry.value {
                set.remove(member);
            }
        }
    }

    // ---- json blobs ----

    pub fn set_json(&self, key: &str, value: &serde_json::Value, ttl: Duration) {
        self.set_string(key, value.to_string(), ttl);
    }

    pub fn get_json(&self, key: &str) -> Option<serde_json::Value> {
        let raw = self.get_string(key)?;
        serde_json::from_str(&raw).ok()
    }

    /// Shallow-merge `updates` into an existing JSON object, keeping its
    /// remaining TTL untouched semantics simple: the TTL restarts.
    pub fn merge_json(&self, key: &str, updates: serde_json::Value, ttl: Duration) -> bool {
        let Some(mut current) = self.get_json(key) else {
            return false;
        };
        if let (Some(obj), Some(patch)) = (current.as_object_mut(), updates.as_object()) {
            for (k, v) in patch {
                obj.insert(k.clone(), v.clone());
            }
        }
        self.set_json(key, &current, ttl);
        true
    }

    /// Drop expired entries; called from a periodic task.
    pub fn sweep(&self) {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.expired());
        let removed = before - self.entries.len();
        if removed > 0 {
            debug!(removed, "swept expired cache entries");
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(60);

    #[test]
    fn set_nx_acts_as_a_lock() {
        let cache = CacheStore::new();
        assert!(cache.set_nx("lock", TTL));
        assert!(!cache.set_nx("lock", TTL));
        cache.delete("lock");
        assert!(cache.set_nx("lock", TTL));
    }

    #[test]
    fn expired_keys_vanish() {
        let cache = CacheStore::new();
        cache.set_string("k", "v".to_string(), Duration::from_millis(0));
        assert!(cache.get_string("k").is_none());
        assert!(!cache.exists("k"));
    }

    #[test]
    fn list_is_head_inserted_and_tail_popped() {
        let cache = CacheStore::new();
        cache.lpush("l", "first".to_string(), TTL);
        cache.lpush("l", "second".to_string(), TTL);
        assert_eq!(cache.lrange_all("l"), vec!["second", "first"]);
        assert_eq!(cache.rpop("l").as_deref(), Some("first"));
        assert_eq!(cache.llen("l"), 1);
    }

    #[test]
    fn zset_orders_by_score_descending() {
        let cache = CacheStore::new();
        cache.zadd("z", "old", 1.0, TTL);
        cache.zadd("z", "new", 9.0, TTL);
        cache.zadd("z", "mid", 5.0, TTL);
        assert_eq!(cache.zrevrange("z", 2), vec!["new", "mid"]);
        cache.zrem("z", "new");
        assert_eq!(cache.zrevrange("z", 10), vec!["mid", "old"]);
    }

    #[test]
    fn json_merge_patches_fields() {
        let cache = CacheStore::new();
        cache.set_json("t", &serde_json::json!({"status": "pending", "progress": 0}), TTL);
        assert!(cache.merge_json("t", serde_json::json!({"progress": 50}), TTL));
        let value = cache.get_json("t").unwrap();
        assert_eq!(value["status"], "pending");
        assert_eq!(value["progress"], 50);
        assert!(!cache.merge_json("missing", serde_json::json!({}), TTL));
    }

    #[test]
    fn sweep_removes_dead_entries() {
        let cache = CacheStore::new();
        cache.set_string("dead", "x".to_string(), Duration::from_millis(0));
        cache.set_string("alive", "y".to_string(), TTL);
        cache.sweep();
        assert_eq!(cache.len(), 1);
        assert!(cache.exists("alive"));
    }
}
