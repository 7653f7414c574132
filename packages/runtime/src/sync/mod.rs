//! Concurrency primitives used by components and property managers.

pub mod rwlock;

pub use rwlock::{ReadGuard, SharedLock, WriteGuard};
