//! Order aggregate implementation.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use common::AggregateId;
use event_store::Version;
use serde::{Deserialize, Serialize};

use crate::aggregate::Aggregate;

use super::{
    CreateOrder, GoodId, LineItem, Money, OrderError, OrderEvent, OrderStatus, OrderTransition,
    UserId,
    events::{OrderCreatedData, OrderPricedData, PricedGood},
};

/// Order aggregate root.
///
/// Holds one order's line items, captured prices and status. State only
/// changes by applying events produced from legal transitions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Order {
    id: Option<AggregateId>,

    #[serde(default)]
    version: Version,

    user_id: Option<UserId>,

    /// Line items in request order.
    items: Vec<LineItem>,

    address: Option<String>,
    status: OrderStatus,

    /// Always the sum of `quantity * unit_price` over `items`.
    total_price: Money,

    payment_id: Option<String>,
    delivery_id: Option<String>,

    /// Why the order left the happy path, if it did.
    status_reason: Option<String>,

    created_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
}

impl Aggregate for Order {
    type Event = OrderEvent;
    type Error = OrderError;

    fn aggregate_type() -> &'static str {
        "Order"
    }

    fn id(&self) -> Option<AggregateId> {
        self.id
    }

    fn version(&self) -> Version {
        self.version
    }

    fn set_version(&mut self, version: Version) {
        self.version = version;
    }

    fn apply(&mut self, event: Self::Event) {
        self.updated_at = Some(event.occurred_at());
        match event {
            OrderEvent::OrderCreated(data) => self.apply_order_created(data),
            OrderEvent::OrderPriced(data) => self.apply_order_priced(data),
            OrderEvent::StockReserved(_) => self.status = OrderStatus::Reserved,
            OrderEvent::ReservationFailed(data) => {
                self.status = OrderStatus::ReservationFailed;
                self.status_reason = Some(data.reason);
            }
            OrderEvent::PaymentCompleted(data) => {
                self.status = OrderStatus::Paid;
                self.payment_id = data.payment_id;
            }
            OrderEvent::PaymentFailed(data) => {
                self.status = OrderStatus::PaymentFailed;
                self.status_reason = Some(data.reason);
            }
            OrderEvent::CompensationStarted(data) => {
                self.status = OrderStatus::Compensating;
                self.status_reason.get_or_insert(data.reason);
            }
            OrderEvent::DeliveryScheduled(data) => {
                self.status = OrderStatus::DeliveryScheduled;
                self.delivery_id = data.delivery_id;
            }
            OrderEvent::OrderCompleted(_) => self.status = OrderStatus::Completed,
            OrderEvent::OrderCancelled(data) => {
                self.status = OrderStatus::Cancelled;
                self.status_reason.get_or_insert(data.reason);
            }
            OrderEvent::OrderFailed(data) => {
                self.status = OrderStatus::Failed;
                self.status_reason = Some(data.reason);
            }
        }
    }
}

// Query methods
impl Order {
    pub fn user_id(&self) -> Option<UserId> {
        self.user_id
    }

    pub fn status(&self) -> OrderStatus {
        self.status
    }

    /// Returns the line items in request order.
    pub fn items(&self) -> &[LineItem] {
        &self.items
    }

    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    pub fn total_price(&self) -> Money {
        self.total_price
    }

    pub fn payment_id(&self) -> Option<&str> {
        self.payment_id.as_deref()
    }

    pub fn delivery_id(&self) -> Option<&str> {
        self.delivery_id.as_deref()
    }

    /// Returns the recorded reason for a failure or rollback.
    pub fn status_reason(&self) -> Option<&str> {
        self.status_reason.as_deref()
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

// Command methods (return events)
impl Order {
    /// Records a new order in `pending`.
    pub fn create(&self, cmd: CreateOrder) -> Result<Vec<OrderEvent>, OrderError> {
        if self.id.is_some() {
            return Err(OrderError::AlreadyCreated);
        }

        let (order_id, user_id, items, address) = cmd.into_parts();
        Ok(vec![OrderEvent::order_created(
            order_id, user_id, items, address,
        )])
    }

    /// Creates and prices an order in one step, so `pending` is never the
    /// only persisted state of an order that could not be priced.
    pub fn place(
        &self,
        cmd: CreateOrder,
        unit_prices: HashMap<GoodId, Money>,
    ) -> Result<Vec<OrderEvent>, OrderError> {
        let mut events = self.create(cmd)?;

        let mut draft = self.clone();
        draft.apply_events(events.iter().cloned());
        events.extend(draft.transition(OrderTransition::Price { unit_prices })?);

        Ok(events)
    }

    /// Applies one legal state machine transition.
    ///
    /// Any move not allowed from the current status fails with
    /// `InvalidStateTransition` and produces no events.
    pub fn transition(&self, transition: OrderTransition) -> Result<Vec<OrderEvent>, OrderError> {
        if self.id.is_none() {
            return Err(OrderError::NotCreated);
        }

        let target = transition.target();
        if !self.status.can_transition_to(target) {
            return Err(OrderError::InvalidStateTransition {
                from: self.status,
                to: target,
            });
        }

        let event = match transition {
            OrderTransition::Price { unit_prices } => self.price(&unit_prices)?,
            OrderTransition::ReserveStock => OrderEvent::stock_reserved(),
            OrderTransition::FailReservation { reason } => OrderEvent::reservation_failed(reason),
            OrderTransition::Pay { payment_id } => OrderEvent::payment_completed(payment_id),
            OrderTransition::FailPayment { reason } => OrderEvent::payment_failed(reason),
            OrderTransition::StartCompensation { reason } => {
                OrderEvent::compensation_started(reason)
            }
            OrderTransition::ScheduleDelivery { delivery_id } => {
                OrderEvent::delivery_scheduled(delivery_id)
            }
            OrderTransition::Complete => OrderEvent::order_completed(),
            OrderTransition::Cancel { reason } => OrderEvent::order_cancelled(reason),
            OrderTransition::Fail { reason } => OrderEvent::order_failed(reason),
        };

        Ok(vec![event])
    }

    fn price(&self, unit_prices: &HashMap<GoodId, Money>) -> Result<OrderEvent, OrderError> {
        let mut prices = Vec::with_capacity(self.items.len());
        let mut total = Money::zero();

        for item in &self.items {
            let unit_price =
                *unit_prices
                    .get(&item.good_id)
                    .ok_or_else(|| OrderError::MissingPrice {
                        good_id: item.good_id.clone(),
                    })?;
            if !unit_price.is_positive() {
                return Err(OrderError::InvalidPrice {
                    good_id: item.good_id.clone(),
                    price: unit_price.cents(),
                });
            }
            total = unit_price
                .checked_mul(item.quantity)
                .and_then(|line_total| total.checked_add(line_total))
                .ok_or_else(|| OrderError::AmountOverflow {
                    good_id: item.good_id.clone(),
                })?;
            prices.push(PricedGood {
                good_id: item.good_id.clone(),
                unit_price,
            });
        }

        Ok(OrderEvent::order_priced(prices, total))
    }
}

// Apply event helpers
impl Order {
    fn apply_order_created(&mut self, data: OrderCreatedData) {
        self.id = Some(data.order_id);
        self.user_id = Some(data.user_id);
        self.items = data.items;
        self.address = data.address;
        self.status = OrderStatus::Pending;
        self.created_at = Some(data.created_at);
    }

    fn apply_order_priced(&mut self, data: OrderPricedData) {
        for priced in data.prices {
            if let Some(item) = self.items.iter_mut().find(|i| i.good_id == priced.good_id) {
                item.unit_price = Some(priced.unit_price);
            }
        }
        self.total_price = data.total_price;
        self.status = OrderStatus::Priced;
    }
}
