//! Append-only event log.
//!
//! Every durable fact in the fulfillment system lands here: order events,
//! the per-order saga step log and the per-order outbox. Streams are keyed by
//! [`AggregateId`] and protected by optimistic concurrency on their version.

pub mod error;
pub mod event;
pub mod memory;
pub mod store;

pub use common::AggregateId;
pub use error::{EventStoreError, Result};
pub use event::{EventEnvelope, EventEnvelopeBuilder, EventId, Version};
pub use memory::InMemoryEventStore;
pub use store::{AppendOptions, EventStore, EventStoreExt, EventStream};
