//! Feeds stored events to registered projections.

use event_store::{EventEnvelope, EventStore};
use futures_util::StreamExt;

use crate::Result;
use crate::projection::Projection;

/// Delivers events from an event store to projections.
///
/// Reads are served from the projections, so callers run
/// [`catch_up`](Self::catch_up) before querying to observe every event
/// appended so far.
pub struct ProjectionProcessor<S: EventStore> {
    store: S,
    projections: Vec<Box<dyn Projection>>,
}

impl<S: EventStore> ProjectionProcessor<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            projections: Vec::new(),
        }
    }

    pub fn register(&mut self, projection: Box<dyn Projection>) {
        self.projections.push(projection);
    }

    pub fn projection_count(&self) -> usize {
        self.projections.len()
    }

    /// Streams the whole log and hands each projection the events it has
    /// not seen yet. Returns how many deliveries were made.
    #[tracing::instrument(skip(self))]
    pub async fn catch_up(&self) -> Result<u64> {
        let mut stream = self.store.stream_all_events().await?;
        let mut index: u64 = 0;
        let mut delivered: u64 = 0;

        while let Some(event) = stream.next().await {
            let event = event?;
            index += 1;

            for projection in &self.projections {
                if !projection.position().await.has_seen(index) {
                    projection.handle(&event).await?;
                    delivered += 1;
                    metrics::counter!("projections_events_processed", "projection" => projection.name())
                        .increment(1);
                }
            }
        }

        tracing::debug!(events = index, delivered, "catch-up complete");
        Ok(delivered)
    }

    /// Delivers one event to every projection.
    ///
    /// Only for events that are not in the store; stored events are picked
    /// up by [`catch_up`](Self::catch_up).
    #[tracing::instrument(skip(self, event), fields(event_type = %event.event_type))]
    pub async fn process_event(&self, event: &EventEnvelope) -> Result<()> {
        for projection in &self.projections {
            projection.handle(event).await?;
        }
        Ok(())
    }

    /// Resets every projection and replays the log.
    #[tracing::instrument(skip(self))]
    pub async fn rebuild_all(&self) -> Result<()> {
        for projection in &self.projections {
            tracing::info!(projection = projection.name(), "rebuilding");
            projection.reset().await?;
        }
        self.catch_up().await.map(|_| ())
    }
}
