//! Event handler seam between components, the bus, and consumers.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use verdant_core::Event;

/// Receiver of fabric events.
///
/// The single abstraction over everything that consumes events: bus
/// subscribers, the persistence service, and device-to-device handlers.
/// Implementations branch on the event's payload tag for type-specific
/// handling.
///
/// Used as `Arc<dyn EventHandler>`; components hold `Weak` references so a
/// handler may outlive any component and vice versa.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handles one event. Errors are recorded by the publisher and never
    /// cancel sibling handlers.
    async fn handle_event(
        &self,
        sender_id: Uuid,
        event: &Event,
        token: &CancellationToken,
    ) -> anyhow::Result<()>;

    /// The component identity this handler acts for, if any.
    ///
    /// Routing treats `None` as the zero id when matching explicit targets.
    fn target_id(&self) -> Option<Uuid> {
        None
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    struct NullHandler;

    #[async_trait]
    impl EventHandler for NullHandler {
        async fn handle_event(
            &self,
            _sender_id: Uuid,
            _event: &Event,
            _token: &CancellationToken,
        ) -> anyhow::Result<()> {
            Ok(())
        }
    }

    /// Verifies `Arc<dyn EventHandler>` compiles (object safety).
    #[test]
    fn event_handler_is_object_safe() {
        fn _assert_object_safe(_: &Arc<dyn EventHandler>) {}
    }

    #[test]
    fn default_target_id_is_none() {
        assert!(NullHandler.target_id().is_none());
    }
}
