//! Event model: identity, priority, routing data, and typed payloads.

pub mod base;
pub mod routing;

pub use base::{Event, EventPayload, EventType};
pub use routing::{Priority, RoutingData};
