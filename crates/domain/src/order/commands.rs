//! Order commands.

use std::collections::HashMap;

use common::AggregateId;

use crate::command::Command;

use super::{GoodId, LineItem, Money, Order, OrderError, OrderLine, OrderStatus, UserId};

/// Command to create a new order.
///
/// Construction validates the request shape, so a `CreateOrder` value is always
/// well formed: at least one line, positive quantities, and a non-blank address
/// when one is given. Repeated goods are merged into their first position.
#[derive(Debug, Clone)]
pub struct CreateOrder {
    order_id: AggregateId,
    user_id: UserId,
    items: Vec<LineItem>,
    address: Option<String>,
}

impl CreateOrder {
    /// Validates and builds a CreateOrder command.
    pub fn new(
        order_id: AggregateId,
        user_id: UserId,
        lines: Vec<OrderLine>,
        address: Option<String>,
    ) -> Result<Self, OrderError> {
        if lines.is_empty() {
            return Err(OrderError::NoItems);
        }

        let mut items: Vec<LineItem> = Vec::with_capacity(lines.len());
        for line in lines {
            if line.quantity == 0 {
                return Err(OrderError::InvalidQuantity {
                    good_id: line.good_id,
                    quantity: line.quantity,
                });
            }
            match items.iter_mut().find(|item| item.good_id == line.good_id) {
                Some(existing) => {
                    existing.quantity = existing.quantity.checked_add(line.quantity).ok_or(
                        OrderError::InvalidQuantity {
                            good_id: line.good_id,
                            quantity: u32::MAX,
                        },
                    )?;
                }
                None => items.push(line.into()),
            }
        }

        if address.as_deref().is_some_and(|a| a.trim().is_empty()) {
            return Err(OrderError::EmptyAddress);
        }

        Ok(Self {
            order_id,
            user_id,
            items,
            address,
        })
    }

    pub fn order_id(&self) -> AggregateId {
        self.order_id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    /// Merged line items, unpriced.
    pub fn items(&self) -> &[LineItem] {
        &self.items
    }

    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    pub(crate) fn into_parts(self) -> (AggregateId, UserId, Vec<LineItem>, Option<String>) {
        (self.order_id, self.user_id, self.items, self.address)
    }
}

impl Command for CreateOrder {
    type Aggregate = Order;

    fn aggregate_id(&self) -> AggregateId {
        self.order_id
    }
}

/// A requested move through the order state machine.
#[derive(Debug, Clone)]
pub enum OrderTransition {
    /// Capture authoritative unit prices for every line item.
    Price { unit_prices: HashMap<GoodId, Money> },
    ReserveStock,
    FailReservation { reason: String },
    Pay { payment_id: Option<String> },
    FailPayment { reason: String },
    StartCompensation { reason: String },
    ScheduleDelivery { delivery_id: Option<String> },
    Complete,
    Cancel { reason: String },
    Fail { reason: String },
}

impl OrderTransition {
    /// The status the order ends up in when the transition is applied.
    pub fn target(&self) -> OrderStatus {
        match self {
            OrderTransition::Price { .. } => OrderStatus::Priced,
            OrderTransition::ReserveStock => OrderStatus::Reserved,
            OrderTransition::FailReservation { .. } => OrderStatus::ReservationFailed,
            OrderTransition::Pay { .. } => OrderStatus::Paid,
            OrderTransition::FailPayment { .. } => OrderStatus::PaymentFailed,
            OrderTransition::StartCompensation { .. } => OrderStatus::Compensating,
            OrderTransition::ScheduleDelivery { .. } => OrderStatus::DeliveryScheduled,
            OrderTransition::Complete => OrderStatus::Completed,
            OrderTransition::Cancel { .. } => OrderStatus::Cancelled,
            OrderTransition::Fail { .. } => OrderStatus::Failed,
        }
    }

    /// Builds the transition an operator asks for by naming a target status.
    ///
    /// Only `completed`, `cancelled` and `failed` can be requested. Every
    /// other status records a fact (a reservation, a charge, a booking or a
    /// failed step) that only the fulfillment saga may establish.
    pub fn from_status(status: OrderStatus, reason: impl Into<String>) -> Result<Self, OrderError> {
        let reason = reason.into();
        Ok(match status {
            OrderStatus::Completed => OrderTransition::Complete,
            OrderStatus::Cancelled => OrderTransition::Cancel { reason },
            OrderStatus::Failed => OrderTransition::Fail { reason },
            OrderStatus::Pending
            | OrderStatus::Priced
            | OrderStatus::Reserved
            | OrderStatus::ReservationFailed
            | OrderStatus::Paid
            | OrderStatus::PaymentFailed
            | OrderStatus::Compensating
            | OrderStatus::DeliveryScheduled => {
                return Err(OrderError::StatusNotRequestable(status));
            }
        })
    }
}
