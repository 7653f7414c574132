//! Shared cache entry bookkeeping.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// A cached value plus the access statistics eviction decisions are based on.
///
/// The statistics are atomics so a cache hit can bump them through a shared
/// map reference without taking a write lock.
#[derive(Debug)]
pub(crate) struct CacheEntry<V> {
    pub(crate) value: V,
    last_access: AtomicI64,
    usage: AtomicU64,
}

impl<V> CacheEntry<V> {
    pub(crate) fn new(value: V, now: i64) -> Self {
        Self {
            value,
            last_access: AtomicI64::new(now),
            usage: AtomicU64::new(0),
        }
    }

    /// Records a hit: refreshes the access time, increments the usage count.
    pub(crate) fn touch(&self, now: i64) {
        self.last_access.store(now, Ordering::Relaxed);
        self.usage.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn last_access(&self) -> i64 {
        self.last_access.load(Ordering::Relaxed)
    }

    pub(crate) fn usage(&self) -> u64 {
        self.usage.load(Ordering::Relaxed)
    }

    /// Whether the entry's sliding expiration has elapsed.
    pub(crate) fn is_expired(&self, expiration_ms: Option<i64>, now: i64) -> bool {
        expiration_ms.is_some_and(|ttl| now - self.last_access() > ttl)
    }
}
