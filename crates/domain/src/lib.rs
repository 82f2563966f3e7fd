//! Domain layer for order fulfillment.
//!
//! This crate provides:
//! - Aggregate trait for event-sourced entities
//! - DomainEvent trait for domain events
//! - CommandHandler for loading aggregates and persisting their events
//! - The Order aggregate with its status state machine

pub mod aggregate;
pub mod command;
pub mod error;
pub mod order;

pub use aggregate::{Aggregate, DomainEvent};
pub use command::{Command, CommandHandler, CommandResult};
pub use error::DomainError;
pub use order::{
    CreateOrder, GoodId, LineItem, Money, Order, OrderError, OrderEvent, OrderLine,
    OrderService, OrderStatus, OrderTransition, PaymentMethod, UserId,
};
