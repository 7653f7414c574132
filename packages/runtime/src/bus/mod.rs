//! Event bus: subscriptions, routing, priority dispatch, and topology.

pub mod condition;
pub mod dead_letter;
pub mod event_bus;
pub mod publish;
pub mod queue;
pub mod subscription;
pub mod topology;
pub mod transformer;

pub use condition::{ConditionEvaluator, PropertySource};
pub use dead_letter::{FailedEventStore, InMemoryFailedEventStore};
pub use event_bus::EventBus;
pub use publish::PublishResult;
pub use queue::{EventQueueProcessor, QueueItem};
pub use subscription::{Subscription, SubscriptionOptions};
pub use topology::{Connection, TopologyService};
pub use transformer::{EventTransformer, IdentityTransformer};
