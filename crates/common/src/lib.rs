//! Shared identifiers used across the order fulfillment crates.

pub mod types;

pub use types::AggregateId;
