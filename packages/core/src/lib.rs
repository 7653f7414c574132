//! Verdant Core -- property values, metadata, event model, and error taxonomy.
//!
//! This crate provides the foundation layer for the Verdant control fabric:
//!
//! - **Types** ([`types`]): `PropertyValue` tagged variant, `PropertyKind`,
//!   `ComponentState`, and the typed-getter trait `FromPropertyValue`
//! - **Metadata** ([`metadata`]): per-property `PropertyMetadata` records
//! - **Events** ([`events`]): `Event`, `EventPayload`, `EventType`,
//!   `Priority`, `RoutingData`
//! - **Errors** ([`error`]): the `FabricError` taxonomy
//! - **Time** ([`time`]): wall-clock millisecond helpers

pub mod error;
pub mod events;
pub mod metadata;
pub mod time;
pub mod types;

// Errors
pub use error::{FabricError, Result};

// Events
pub use events::{Event, EventPayload, EventType, Priority, RoutingData};

// Metadata
pub use metadata::PropertyMetadata;

// Time
pub use time::now_millis;

// Types
pub use types::{ComponentState, FromPropertyValue, PropertyKind, PropertyValue};
