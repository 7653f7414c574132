//! Error taxonomy for the control fabric.

use uuid::Uuid;

use crate::types::PropertyKind;

/// Errors surfaced by components, the event bus, and the persistence layer.
#[derive(Debug, thiserror::Error)]
pub enum FabricError {
    /// A property write was rejected by a validator or a read-only flag.
    #[error("validation failed for property `{property}`: {reason}")]
    Validation { property: String, reason: String },

    /// A typed read hit a value with a different runtime type.
    #[error("type mismatch for `{property}`: expected {expected}, found {actual}")]
    TypeMismatch {
        property: String,
        expected: PropertyKind,
        actual: PropertyKind,
    },

    /// The component was used after `dispose`.
    #[error("component {id} is disposed")]
    Disposed { id: Uuid },

    /// A property manager was used before its backing data was loaded.
    #[error("properties have not been loaded")]
    NotLoaded,

    /// The named property does not exist.
    #[error("property `{0}` not found")]
    NotFound(String),

    /// The backing store failed (I/O or serialization).
    #[error("store failure: {0}")]
    StoreIo(#[source] anyhow::Error),

    /// Concurrent flush contention on the store transaction.
    #[error("transaction conflict: {0}")]
    TransactionConflict(String),

    /// A subscribed handler returned an error.
    #[error("handler failure: {0}")]
    HandlerFailure(String),

    /// A publish exceeded its routing timeout.
    #[error("operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// A downstream service's circuit breaker is open.
    #[error("circuit breaker `{service}` is open")]
    CircuitBreakerOpen { service: String },

    /// Cooperative cancellation was observed.
    #[error("operation was cancelled")]
    Cancelled,
}

impl FabricError {
    /// Shorthand for a read-only property write rejection.
    #[must_use]
    pub fn read_only(property: impl Into<String>) -> Self {
        Self::Validation {
            property: property.into(),
            reason: "property is read-only".to_string(),
        }
    }
}

impl From<std::io::Error> for FabricError {
    fn from(err: std::io::Error) -> Self {
        Self::StoreIo(err.into())
    }
}

impl From<serde_json::Error> for FabricError {
    fn from(err: serde_json::Error) -> Self {
        Self::StoreIo(err.into())
    }
}

/// Convenience alias used throughout the fabric crates.
pub type Result<T> = std::result::Result<T, FabricError>;
