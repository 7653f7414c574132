//! Pre-dispatch event rewriting.

use verdant_core::Event;

/// Rewrites events before the bus dispatches them.
///
/// Useful for enrichment (stamping routing targets, rewriting priorities)
/// without touching publishers. The default is the identity.
pub trait EventTransformer: Send + Sync {
    fn transform(&self, event: Event) -> Event;
}

/// The default transformer: passes events through untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityTransformer;

impl EventTransformer for IdentityTransformer {
    fn transform(&self, event: Event) -> Event {
        event
    }
}
