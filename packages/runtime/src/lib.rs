//! Verdant Runtime -- components, event bus, persistence, and recovery for an
//! IoT-style control fabric.
//!
//! The runtime wires three tightly coupled pieces together:
//!
//! - **Components** ([`component`]): typed, concurrent, observable device
//!   state with a managed lifecycle and a registry
//! - **Event bus** ([`bus`]): filtered subscriptions, priority-banded
//!   dispatch, topology fan-out, timeouts, and dead-lettering
//! - **Persistence** ([`persist`]): a batching, transactional write-back
//!   cache between components and a pluggable device store
//!
//! Around them sit the ambient pieces: the async reader/writer lock
//! ([`sync`]), the hot-set caches ([`cache`]), error monitoring and recovery
//! ([`monitor`]), and runtime configuration ([`config`]).

pub mod bus;
pub mod cache;
pub mod component;
pub mod config;
pub mod monitor;
pub mod persist;
pub mod sync;

pub use bus::{
    ConditionEvaluator, Connection, EventBus, EventQueueProcessor, EventTransformer,
    FailedEventStore, IdentityTransformer, InMemoryFailedEventStore, PropertySource,
    PublishResult, Subscription, SubscriptionOptions, TopologyService,
};
pub use cache::{AdaptiveCache, LruCache};
pub use component::{ComponentCore, ComponentRegistry, Device, EventHandler};
pub use config::RuntimeConfig;
pub use monitor::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakers, CircuitState, ComponentError,
    ErrorMonitor, ErrorSource, RecoveryManager, RecoveryStatus, RecoveryStrategy, Severity,
};
pub use persist::{DeviceStore, JsonFileStore, MemoryStore, PersistenceService, StoreTransaction};
pub use sync::SharedLock;
