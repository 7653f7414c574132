//! Bounded, time-aware hot-set caches.

mod entry;

pub mod adaptive;
pub mod lru;

pub use adaptive::AdaptiveCache;
pub use lru::LruCache;
