//! Projection error types.

use common::AggregateId;
use thiserror::Error;

/// Errors raised while feeding events into a read model.
#[derive(Debug, Error)]
pub enum ProjectionError {
    #[error("Event store error: {0}")]
    EventStore(#[from] event_store::EventStoreError),

    #[error("Event deserialization error: {0}")]
    Deserialization(#[from] serde_json::Error),

    /// An order event arrived for an order the view never saw created.
    #[error("Order {0} has no OrderCreated event in this view")]
    UnknownOrder(AggregateId),
}

/// Result type for projection operations.
pub type Result<T> = std::result::Result<T, ProjectionError>;
