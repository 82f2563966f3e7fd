//! Query side of the order service.
//!
//! Order events in the store are fed through a [`ProjectionProcessor`] into
//! [`Projection`]s. [`UserOrdersView`] answers "which orders did this user
//! place", newest first.

pub mod error;
pub mod processor;
pub mod projection;
pub mod read_model;
pub mod views;

pub use error::{ProjectionError, Result};
pub use processor::ProjectionProcessor;
pub use projection::{Projection, ProjectionPosition};
pub use read_model::ReadModel;
pub use views::UserOrdersView;
