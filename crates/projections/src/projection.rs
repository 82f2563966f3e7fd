//! Projection trait and position tracking.

use async_trait::async_trait;
use event_store::EventEnvelope;

use crate::Result;

/// How far into the global event log a projection has read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct ProjectionPosition {
    /// Count of events delivered, including ones the projection ignored.
    pub events_processed: u64,
}

impl ProjectionPosition {
    pub fn zero() -> Self {
        Self::default()
    }

    pub fn advance(&self) -> Self {
        Self {
            events_processed: self.events_processed + 1,
        }
    }

    /// True once the event at 1-based `index` in the log was delivered.
    pub fn has_seen(&self, index: u64) -> bool {
        self.events_processed >= index
    }
}

impl std::fmt::Display for ProjectionPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "position({})", self.events_processed)
    }
}

/// Folds stored events into a read model.
///
/// Every delivered event must advance the position, even when the
/// projection has no interest in it; catch-up relies on that to skip
/// what was already applied.
#[async_trait]
pub trait Projection: Send + Sync {
    fn name(&self) -> &'static str;

    async fn handle(&self, event: &EventEnvelope) -> Result<()>;

    async fn position(&self) -> ProjectionPosition;

    /// Drops all state so the projection can be replayed from the start.
    async fn reset(&self) -> Result<()>;
}
