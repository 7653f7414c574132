//! The immutable event record and its typed payloads.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::events::routing::RoutingData;
use crate::metadata::PropertyMetadata;
use crate::time::now_millis;
use crate::types::{ComponentState, PropertyKind, PropertyValue};

/// Category of an event, used by subscription filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventType {
    PropertyChanged,
    Command,
    Lifecycle,
    Error,
    Custom,
}

/// Type-dependent payload carried by an [`Event`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(tag = "kind", rename_all_fields = "camelCase")]
pub enum EventPayload {
    PropertyChanged {
        property_name: String,
        property_kind: PropertyKind,
        old_value: PropertyValue,
        new_value: PropertyValue,
        metadata: PropertyMetadata,
    },
    Command {
        command_name: String,
        #[serde(default)]
        parameters: BTreeMap<String, PropertyValue>,
    },
    Lifecycle {
        previous: ComponentState,
        next: ComponentState,
    },
    Error {
        error_code: String,
        message: String,
    },
    None,
}

/// An immutable message published by a component and routed by the bus.
///
/// Wire shape (JSON): `{eventId, deviceId, sourceId, eventType, timestamp,
/// routingData, payload}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Fresh identity of this event.
    pub event_id: Uuid,
    /// The component that published the event.
    pub source_id: Uuid,
    /// The device the event is about (usually equals `source_id`).
    pub device_id: Uuid,
    pub event_type: EventType,
    /// Wall-clock time of publication (millis since epoch).
    pub timestamp: i64,
    #[serde(rename = "routingData")]
    pub routing: RoutingData,
    pub payload: EventPayload,
}

impl Event {
    /// Creates an event with a fresh id and the current wall-clock timestamp.
    #[must_use]
    pub fn new(
        source_id: Uuid,
        device_id: Uuid,
        event_type: EventType,
        routing: RoutingData,
        payload: EventPayload,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            source_id,
            device_id,
            event_type,
            timestamp: now_millis(),
            routing,
            payload,
        }
    }

    /// Creates a property-changed event.
    #[must_use]
    pub fn property_changed(
        device_id: Uuid,
        property_name: impl Into<String>,
        old_value: PropertyValue,
        new_value: PropertyValue,
        metadata: PropertyMetadata,
        routing: RoutingData,
    ) -> Self {
        let payload = EventPayload::PropertyChanged {
            property_name: property_name.into(),
            property_kind: new_value.kind(),
            old_value,
            new_value,
            metadata,
        };
        Self::new(
            device_id,
            device_id,
            EventType::PropertyChanged,
            routing,
            payload,
        )
    }

    /// Creates a command event targeted at `device_id`.
    #[must_use]
    pub fn command(
        source_id: Uuid,
        device_id: Uuid,
        command_name: impl Into<String>,
        parameters: BTreeMap<String, PropertyValue>,
        routing: RoutingData,
    ) -> Self {
        let payload = EventPayload::Command {
            command_name: command_name.into(),
            parameters,
        };
        Self::new(source_id, device_id, EventType::Command, routing, payload)
    }

    /// Creates a lifecycle transition event.
    #[must_use]
    pub fn lifecycle(
        device_id: Uuid,
        previous: ComponentState,
        next: ComponentState,
        routing: RoutingData,
    ) -> Self {
        let payload = EventPayload::Lifecycle { previous, next };
        Self::new(device_id, device_id, EventType::Lifecycle, routing, payload)
    }

    /// Creates an error event.
    #[must_use]
    pub fn error(
        device_id: Uuid,
        error_code: impl Into<String>,
        message: impl Into<String>,
        routing: RoutingData,
    ) -> Self {
        let payload = EventPayload::Error {
            error_code: error_code.into(),
            message: message.into(),
        };
        Self::new(device_id, device_id, EventType::Error, routing, payload)
    }

    /// The property name for property-changed events, `None` otherwise.
    #[must_use]
    pub fn property_name(&self) -> Option<&str> {
        match &self.payload {
            EventPayload::PropertyChanged { property_name, .. } => Some(property_name),
            _ => None,
        }
    }

    /// The new value for property-changed events, `None` otherwise.
    #[must_use]
    pub fn new_value(&self) -> Option<&PropertyValue> {
        match &self.payload {
            EventPayload::PropertyChanged { new_value, .. } => Some(new_value),
            _ => None,
        }
    }
}
