//! Order aggregate and related types.

mod aggregate;
mod commands;
mod events;
mod service;
mod status;
mod value_objects;

pub use aggregate::Order;
pub use commands::{CreateOrder, OrderTransition};
pub use events::{
    DeliveryScheduledData, FailureData, OrderCompletedData, OrderCreatedData, OrderEvent,
    OrderPricedData, PaymentCompletedData, PricedGood, StockReservedData,
};
pub use service::OrderService;
pub use status::OrderStatus;
pub use value_objects::{GoodId, LineItem, Money, OrderLine, PaymentMethod, UserId};

use thiserror::Error;

/// Errors that can occur during order operations.
#[derive(Debug, Error)]
pub enum OrderError {
    /// Order has no items.
    #[error("Order has no items")]
    NoItems,

    /// Invalid quantity.
    #[error("Invalid quantity for {good_id}: {quantity}")]
    InvalidQuantity { good_id: GoodId, quantity: u32 },

    /// Address was given but blank.
    #[error("Delivery address must not be empty")]
    EmptyAddress,

    /// A line item has no captured price.
    #[error("No price captured for {good_id}")]
    MissingPrice { good_id: GoodId },

    /// Invalid price.
    #[error("Invalid price for {good_id}: {price} (must be greater than 0)")]
    InvalidPrice { good_id: GoodId, price: i64 },

    /// The requested move is not in the state machine.
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: OrderStatus, to: OrderStatus },

    /// Quantity times price does not fit in an amount.
    #[error("Order total overflows at {good_id}")]
    AmountOverflow { good_id: GoodId },

    /// The status can only be reached through the saga.
    #[error("Status {0} cannot be requested directly")]
    StatusNotRequestable(OrderStatus),

    /// Order is already created.
    #[error("Order already created")]
    AlreadyCreated,

    /// Order does not exist yet.
    #[error("Order not created")]
    NotCreated,
}

impl OrderError {
    /// Returns true if the error describes a malformed request.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            OrderError::NoItems
                | OrderError::InvalidQuantity { .. }
                | OrderError::EmptyAddress
                | OrderError::AmountOverflow { .. }
                | OrderError::StatusNotRequestable(_)
        )
    }
}
