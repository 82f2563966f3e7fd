//! Order domain events.

use chrono::{DateTime, Utc};
use common::AggregateId;
use serde::{Deserialize, Serialize};

use crate::aggregate::DomainEvent;

use super::{GoodId, LineItem, Money, UserId};

/// Events that can occur on an order aggregate.
///
/// Every event carries its own timestamp, which becomes the order's `updated_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum OrderEvent {
    /// Order was recorded in `pending`.
    OrderCreated(OrderCreatedData),

    /// Authoritative prices were captured.
    OrderPriced(OrderPricedData),

    /// Stock was reserved for every line item.
    StockReserved(StockReservedData),

    /// A reservation was refused.
    ReservationFailed(FailureData),

    /// Payment was captured.
    PaymentCompleted(PaymentCompletedData),

    /// Payment was declined or could not be reached.
    PaymentFailed(FailureData),

    /// Reservations are being released.
    CompensationStarted(FailureData),

    /// Delivery was booked.
    DeliveryScheduled(DeliveryScheduledData),

    /// Order was fulfilled.
    OrderCompleted(OrderCompletedData),

    /// Order was rolled back.
    OrderCancelled(FailureData),

    /// Order was abandoned after an unrecoverable failure.
    OrderFailed(FailureData),
}

impl DomainEvent for OrderEvent {
    fn event_type(&self) -> &'static str {
        match self {
            OrderEvent::OrderCreated(_) => "OrderCreated",
            OrderEvent::OrderPriced(_) => "OrderPriced",
            OrderEvent::StockReserved(_) => "StockReserved",
            OrderEvent::ReservationFailed(_) => "ReservationFailed",
            OrderEvent::PaymentCompleted(_) => "PaymentCompleted",
            OrderEvent::PaymentFailed(_) => "PaymentFailed",
            OrderEvent::CompensationStarted(_) => "CompensationStarted",
            OrderEvent::DeliveryScheduled(_) => "DeliveryScheduled",
            OrderEvent::OrderCompleted(_) => "OrderCompleted",
            OrderEvent::OrderCancelled(_) => "OrderCancelled",
            OrderEvent::OrderFailed(_) => "OrderFailed",
        }
    }
}

impl OrderEvent {
    /// Returns when the event happened.
    pub fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            OrderEvent::OrderCreated(d) => d.created_at,
            OrderEvent::OrderPriced(d) => d.priced_at,
            OrderEvent::StockReserved(d) => d.reserved_at,
            OrderEvent::PaymentCompleted(d) => d.paid_at,
            OrderEvent::DeliveryScheduled(d) => d.scheduled_at,
            OrderEvent::OrderCompleted(d) => d.completed_at,
            OrderEvent::ReservationFailed(d)
            | OrderEvent::PaymentFailed(d)
            | OrderEvent::CompensationStarted(d)
            | OrderEvent::OrderCancelled(d)
            | OrderEvent::OrderFailed(d) => d.occurred_at,
        }
    }
}

/// Data for OrderCreated event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderCreatedData {
    pub order_id: AggregateId,
    pub user_id: UserId,

    /// Line items in request order, unpriced.
    pub items: Vec<LineItem>,

    pub address: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Unit price captured for one good.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricedGood {
    pub good_id: GoodId,
    pub unit_price: Money,
}

/// Data for OrderPriced event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderPricedData {
    pub prices: Vec<PricedGood>,

    /// Sum of `quantity * unit_price` at pricing time.
    pub total_price: Money,

    pub priced_at: DateTime<Utc>,
}

/// Data for StockReserved event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StockReservedData {
    pub reserved_at: DateTime<Utc>,
}

/// Data for PaymentCompleted event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentCompletedData {
    /// Payment reference from the payment service.
    pub payment_id: Option<String>,
    pub paid_at: DateTime<Utc>,
}

/// Data for DeliveryScheduled event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryScheduledData {
    pub delivery_id: Option<String>,
    pub scheduled_at: DateTime<Utc>,
}

/// Data for OrderCompleted event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderCompletedData {
    pub completed_at: DateTime<Utc>,
}

/// Data shared by the failure and rollback events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureData {
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}

impl FailureData {
    fn now(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            occurred_at: Utc::now(),
        }
    }
}

// Convenience constructors for events
impl OrderEvent {
    /// Creates an OrderCreated event.
    pub fn order_created(
        order_id: AggregateId,
        user_id: UserId,
        items: Vec<LineItem>,
        address: Option<String>,
    ) -> Self {
        OrderEvent::OrderCreated(OrderCreatedData {
            order_id,
            user_id,
            items,
            address,
            created_at: Utc::now(),
        })
    }

    /// Creates an OrderPriced event.
    pub fn order_priced(prices: Vec<PricedGood>, total_price: Money) -> Self {
        OrderEvent::OrderPriced(OrderPricedData {
            prices,
            total_price,
            priced_at: Utc::now(),
        })
    }

    pub fn stock_reserved() -> Self {
        OrderEvent::StockReserved(StockReservedData {
            reserved_at: Utc::now(),
        })
    }

    pub fn reservation_failed(reason: impl Into<String>) -> Self {
        OrderEvent::ReservationFailed(FailureData::now(reason))
    }

    pub fn payment_completed(payment_id: Option<String>) -> Self {
        OrderEvent::PaymentCompleted(PaymentCompletedData {
            payment_id,
            paid_at: Utc::now(),
        })
    }

    pub fn payment_failed(reason: impl Into<String>) -> Self {
        OrderEvent::PaymentFailed(FailureData::now(reason))
    }

    pub fn compensation_started(reason: impl Into<String>) -> Self {
        OrderEvent::CompensationStarted(FailureData::now(reason))
    }

    pub fn delivery_scheduled(delivery_id: Option<String>) -> Self {
        OrderEvent::DeliveryScheduled(DeliveryScheduledData {
            delivery_id,
            scheduled_at: Utc::now(),
        })
    }

    pub fn order_completed() -> Self {
        OrderEvent::OrderCompleted(OrderCompletedData {
            completed_at: Utc::now(),
        })
    }

    pub fn order_cancelled(reason: impl Into<String>) -> Self {
        OrderEvent::OrderCancelled(FailureData::now(reason))
    }

    pub fn order_failed(reason: impl Into<String>) -> Self {
        OrderEvent::OrderFailed(FailureData::now(reason))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_names() {
        let created = OrderEvent::order_created(
            AggregateId::new(),
            UserId::new(),
            vec![],
            Some("1 Main St".to_string()),
        );
        assert_eq!(created.event_type(), "OrderCreated");
        assert_eq!(
            OrderEvent::order_priced(vec![], Money::zero()).event_type(),
            "OrderPriced"
        );
        assert_eq!(OrderEvent::stock_reserved().event_type(), "StockReserved");
        assert_eq!(
            OrderEvent::payment_failed("declined").event_type(),
            "PaymentFailed"
        );
        assert_eq!(
            OrderEvent::order_cancelled("payment_failed").event_type(),
            "OrderCancelled"
        );
        assert_eq!(OrderEvent::order_failed("boom").event_type(), "OrderFailed");
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let order_id = AggregateId::new();
        let user_id = UserId::new();
        let event = OrderEvent::order_created(
            order_id,
            user_id,
            vec![LineItem {
                good_id: GoodId::new("widget"),
                quantity: 2,
                unit_price: None,
            }],
            None,
        );

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "OrderCreated");

        let deserialized: OrderEvent = serde_json::from_value(json).unwrap();
        if let OrderEvent::OrderCreated(data) = deserialized {
            assert_eq!(data.order_id, order_id);
            assert_eq!(data.user_id, user_id);
            assert_eq!(data.items.len(), 1);
            assert_eq!(data.items[0].quantity, 2);
        } else {
            panic!("Expected OrderCreated event");
        }
    }

    #[test]
    fn test_failure_events_keep_reason() {
        let event = OrderEvent::order_cancelled("payment_failed");
        let json = serde_json::to_string(&event).unwrap();
        let deserialized: OrderEvent = serde_json::from_str(&json).unwrap();

        match deserialized {
            OrderEvent::OrderCancelled(data) => assert_eq!(data.reason, "payment_failed"),
            other => panic!("Expected OrderCancelled, got {other:?}"),
        }
    }
}
