//! Per-event routing hints.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Delivery priority band for an event.
///
/// Bands carry explicit numeric weights; the queue processor dedicates a
/// worker pool to each band so higher bands never wait behind lower ones.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl Priority {
    /// All bands, lowest first. Index order matches [`Self::index`].
    pub const ALL: [Self; 4] = [Self::Low, Self::Normal, Self::High, Self::Critical];

    /// Numeric weight of the band.
    #[must_use]
    pub fn weight(self) -> u8 {
        match self {
            Self::Low => 0,
            Self::Normal => 50,
            Self::High => 100,
            Self::Critical => 200,
        }
    }

    /// Dense index of the band, used to pick the queue processor lane.
    #[must_use]
    pub fn index(self) -> usize {
        match self {
            Self::Low => 0,
            Self::Normal => 1,
            Self::High => 2,
            Self::Critical => 3,
        }
    }
}

/// Routing hints attached to every event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingData {
    /// Explicit handler targets. Empty means "route by topology/filters".
    pub target_ids: Vec<Uuid>,
    /// Whether undeliverable events go to the failed-event store.
    pub persist: bool,
    /// Delivery priority band.
    pub priority: Priority,
    /// Whether the publisher expects handler acknowledgment.
    pub requires_acknowledgment: bool,
    /// Aggregate timeout for the asynchronous handlers of one publish.
    pub timeout_ms: Option<u64>,
}

impl RoutingData {
    #[must_use]
    pub fn with_targets(mut self, targets: impl IntoIterator<Item = Uuid>) -> Self {
        self.target_ids = targets.into_iter().collect();
        self
    }

    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    #[must_use]
    pub fn persisted(mut self) -> Self {
        self.persist = true;
        self
    }

    #[must_use]
    pub fn acknowledged(mut self) -> Self {
        self.requires_acknowledgment = true;
        self
    }

    /// The aggregate async-handler timeout as a [`Duration`], if set.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}
