//! Bounded LRU/LFU hybrid cache with sliding expiration.
//!
//! Admission never fails: when an insert takes the cache over capacity, a
//! single housekeeping pass evicts victims (least usage count first, ties by
//! oldest access) until the bound holds again. The pass is guarded by a
//! non-blocking mutex, so concurrent admitters skip it rather than pile up.

use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use verdant_core::now_millis;

use super::entry::CacheEntry;

/// Bounded, time-aware hot-set cache.
#[derive(Debug)]
pub struct LruCache<K: Eq + Hash, V> {
    entries: DashMap<K, CacheEntry<V>>,
    capacity: usize,
    /// Sliding expiration in millis. `None` disables expiry.
    expiration_ms: Option<i64>,
    /// Non-blocking housekeeping gate: at most one pass runs at a time.
    housekeeping: Mutex<()>,
}

impl<K, V> LruCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Creates a cache bounded to `capacity` entries.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "cache capacity must be positive");
        Self {
            entries: DashMap::new(),
            capacity,
            expiration_ms: None,
            housekeeping: Mutex::new(()),
        }
    }

    /// Adds a sliding expiration: entries idle longer than `expiration` are
    /// eligible for removal even while the cache is under capacity.
    #[must_use]
    pub fn with_expiration(mut self, expiration: Duration) -> Self {
        self.expiration_ms = Some(i64::try_from(expiration.as_millis()).unwrap_or(i64::MAX));
        self
    }

    /// Looks up `key`, bumping its access statistics on a hit.
    ///
    /// Expired entries count as misses and are dropped on the spot.
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

    /// Inserts or replaces `key`, then runs housekeeping if the cache grew
    /// past capacity. Replacement resets the entry's access statistics.
    pub fn add_or_update(&self, key: K, value: V) {
        let now = now_millis();
        self.entries.insert(key, CacheEntry::new(value, now));
        if self.entries.len() > self.capacity {
            self.run_housekeeping();
        }
    }

    /// Removes `key`, returning its value if present.
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
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// One housekeeping pass: drop expired entries, then evict victims until
    /// the capacity bound holds. Contending callers skip the pass.
    pub fn run_housekeeping(&self) {
        let Some(_gate) = self.housekeeping.try_lock() else {
            return;
        };
        let now = now_millis();

        // Snapshot the statistics; eviction works off the snapshot so the
        // iteration never holds shard locks while removing.
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

        if self.entries.len() <= self.capacity {
            return;
        }

        // Least used first, ties broken by oldest access.
        snapshot.sort_by(|a, b| a.1.cmp(&b.1).then(a.2.cmp(&b.2)));
        for (key, _, _) in snapshot {
            if self.entries.len() <= self.capacity {
                break;
            }
            self.entries.remove(&key);
            tracing::trace!(evicted = true, "cache housekeeping evicted entry");
        }
    }

    /// Spawns a periodic housekeeping sweep, stopped by `token`.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    () = tokio::time::sleep(interval) => cache.run_housekeeping(),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[should_panic(expected = "capacity must be positive")]
    fn zero_capacity_is_rejected() {
        let _ = LruCache::<String, i32>::new(0);
    }

    #[test]
    fn get_miss_returns_none() {
        let cache: LruCache<String, i32> = LruCache::new(4);
        assert!(cache.try_get(&"absent".to_string()).is_none());
    }

    #[test]
    fn add_get_remove_round_trip() {
        let cache = LruCache::new(4);
        cache.add_or_update("k".to_string(), 7);
        assert_eq!(cache.try_get(&"k".to_string()), Some(7));
        assert_eq!(cache.try_remove(&"k".to_string()), Some(7));
        assert!(cache.try_get(&"k".to_string()).is_none());
    }

    #[test]
    fn eviction_prefers_least_used_then_oldest() {
        let cache = LruCache::new(2);
        cache.add_or_update("k1".to_string(), 1);
        cache.add_or_update("k2".to_string(), 2);

        // Two hits on k2 protect it; k1 and the fresh k3 tie on usage and
        // the tie breaks against the older k1.
        assert_eq!(cache.try_get(&"k2".to_string()), Some(2));
        assert_eq!(cache.try_get(&"k2".to_string()), Some(2));
        cache.add_or_update("k3".to_string(), 3);

        assert!(cache.len() <= 2);
        assert!(cache.try_get(&"k1".to_string()).is_none());
        assert_eq!(cache.try_get(&"k2".to_string()), Some(2));
        assert_eq!(cache.try_get(&"k3".to_string()), Some(3));
    }

    #[test]
    fn capacity_bound_holds_after_many_admissions() {
        let cache = LruCache::new(8);
        for i in 0..100 {
            cache.add_or_update(format!("k{i}"), i);
        }
        assert!(cache.len() <= 8);
    }

    #[tokio::test]
    async fn expired_entries_are_misses() {
        let cache = LruCache::new(4).with_expiration(Duration::from_millis(30));
        cache.add_or_update("k".to_string(), 1);
        assert_eq!(cache.try_get(&"k".to_string()), Some(1));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(cache.try_get(&"k".to_string()).is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn housekeeping_removes_expired_under_capacity() {
        let cache = LruCache::new(16).with_expiration(Duration::from_millis(30));
        cache.add_or_update("a".to_string(), 1);
        cache.add_or_update("b".to_string(), 2);

        tokio::time::sleep(Duration::from_millis(60)).await;
        cache.run_housekeeping();
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn sweeper_runs_until_cancelled() {
        let cache = Arc::new(LruCache::new(16).with_expiration(Duration::from_millis(20)));
        let token = CancellationToken::new();
        let handle = cache.spawn_sweeper(Duration::from_millis(10), token.clone());

        cache.add_or_update("a".to_string(), 1);
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(cache.is_empty());

        token.cancel();
        handle.await.unwrap();
    }

    #[test]
    fn clear_empties_cache() {
        let cache = LruCache::new(4);
        cache.add_or_update("a".to_string(), 1);
        cache.add_or_update("b".to_string(), 2);
        cache.clear();
        assert!(cache.is_empty());
    }
}
