//! Per-property metadata records.

use serde::{Deserialize, Serialize};

use crate::time::now_millis;

/// Metadata tracked for every property ever set on a component.
///
/// A metadata record exists for each property name in a component's property
/// set; [`crate::error::FabricError::Validation`] is returned when a public
/// write hits a property whose record is marked read-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertyMetadata {
    /// Whether the property may be edited through the public setter.
    pub is_editable: bool,
    /// Whether the property should be surfaced to operators/UIs.
    pub is_visible: bool,
    /// Optional human-facing name.
    pub display_name: Option<String>,
    /// Optional free-form description.
    pub description: Option<String>,
    /// Read-only properties reject public writes; internal state transitions
    /// may still write them.
    pub is_read_only: bool,
    /// Wall-clock time (millis since epoch) of the last write.
    pub last_modified: i64,
    /// Message of the last failed write against this property, if any.
    pub last_error: Option<String>,
}

impl Default for PropertyMetadata {
    fn default() -> Self {
        Self {
            is_editable: true,
            is_visible: true,
            display_name: None,
            description: None,
            is_read_only: false,
            last_modified: now_millis(),
            last_error: None,
        }
    }
}

impl PropertyMetadata {
    /// Creates metadata for an ordinary editable, visible property.
    #[must_use]
    pub fn editable(display_name: impl Into<String>) -> Self {
        Self {
            display_name: Some(display_name.into()),
            ..Self::default()
        }
    }

    /// Creates metadata for a read-only property (lifecycle/identity values).
    #[must_use]
    pub fn read_only(display_name: impl Into<String>) -> Self {
        Self {
            is_editable: false,
            is_read_only: true,
            display_name: Some(display_name.into()),
            ..Self::default()
        }
    }

    /// Attaches a description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Records a successful write: refreshes `last_modified`, clears the error.
    pub fn on_write(&mut self, now: i64) {
        self.last_modified = now;
        self.last_error = None;
    }

    /// Records a failed write against this property.
    pub fn on_error(&mut self, message: impl Into<String>) {
        self.last_error = Some(message.into());
    }
}
