//! Adaptive variant of the hot-set cache used by property managers.
//!
//! Same contract as [`LruCache`](super::LruCache), with two differences:
//! expired entries are removed eagerly on read, and the effective capacity
//! doubles while more than half of the resident entries are hot (usage count
//! of three or more), reverting once the working set cools down.

use std::hash::Hash;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use verdant_core::now_millis;

use super::entry::CacheEntry;

/// Usage count at which an entry counts as hot.
const HOT_USAGE_THRESHOLD: u64 = 3;

/// Hot-set cache whose capacity adapts to the working set.
#[derive(Debug)]
pub struct AdaptiveCache<K: Eq + Hash, V> {
    entries: DashMap<K, CacheEntry<V>>,
    base_capacity: usize,
    expiration_ms: Option<i64>,
    housekeeping: Mutex<()>,
}

impl<K, V> AdaptiveCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Creates a cache with a base capacity of `capacity` entries.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "cache capacity must be positive");
        Self {
            entries: DashMap::new(),
            base_capacity: capacity,
            expiration_ms: None,
            housekeeping: Mutex::new(()),
        }
    }

    /// Adds a sliding expiration checked eagerly on every read.
    #[must_use]
    pub fn with_expiration(mut self, expiration: Duration) -> Self {
        self.expiration_ms = Some(i64::try_from(expiration.as_millis()).unwrap_or(i64::MAX));
        self
    }

    /// Looks up `key`; expired entries are removed on the spot.
    #[must_use]
    pub fn try_get(&self, key: &K) -> Option<V> {
        let now = now_millis();
        let expired = {
            let entry = self.entries.get(key)?;
            if entry.is_expired(self.expiration_ms, now) {
                true
            } else {
                entry.touch(now);
                return Some(entry.value.clone());
            }
        };
        if expired {
            self.entries.remove(key);
        }
        None
    }

    /// Inserts or replaces `key`, evicting down to the effective capacity.
    pub fn add_or_update(&self, key: K, value: V) {
        let now = now_millis();
        self.entries.insert(key, CacheEntry::new(value, now));
        if self.entries.len() > self.effective_capacity() {
            self.run_housekeeping();
        }
    }

    pub fn try_remove(&self, key: &K) -> Option<V> {
        self.entries.remove(key).map(|(_, entry)| entry.value)
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn base_capacity(&self) -> usize {
        self.base_capacity
    }

    /// Doubled while more than half of the resident entries are hot.
    #[must_use]
    pub fn effective_capacity(&self) -> usize {
        let hot = self
            .entries
            .iter()
            .filter(|entry| entry.value().usage() >= HOT_USAGE_THRESHOLD)
            .count();
        if hot * 2 > self.entries.len() {
            self.base_capacity * 2
        } else {
            self.base_capacity
        }
    }

    fn run_housekeeping(&self) {
        let Some(_gate) = self.housekeeping.try_lock() else {
            return;
        };
        let now = now_millis();

        let mut snapshot: Vec<(K, u64, i64)> = Vec::with_capacity(self.entries.len());
        let mut expired: Vec<K> = Vec::new();
        for entry in &self.entries {
            if entry.value().is_expired(self.expiration_ms, now) {
                expired.push(entry.key().clone());
            } else {
                snapshot.push((entry.key().clone(), entry.value().usage(), entry.value().last_access()));
            }
        }
        for key in expired {
            self.entries.remove(&key);
        }

        let bound = self.effective_capacity();
        if self.entries.len() <= bound {
            return;
        }

        snapshot.sort_by(|a, b| a.1.cmp(&b.1).then(a.2.cmp(&b.2)));
        for (key, _, _) in snapshot {
            if self.entries.len() <= bound {
                break;
            }
            self.entries.remove(&key);
        }
    }
}
