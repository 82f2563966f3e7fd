//! Order lifecycle event publishing.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::AggregateId;
use domain::{Money, Order, OrderStatus, UserId};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, broadcast};

use super::Faults;
use crate::error::ServiceError;

const SERVICE: &str = "publisher";

/// Topic all order lifecycle events are published to.
pub const ORDER_EVENTS_TOPIC: &str = "order-events";

/// Lifecycle event kinds seen by downstream consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderEventType {
    #[serde(rename = "order.created")]
    Created,
    #[serde(rename = "order.completed")]
    Completed,
    #[serde(rename = "order.cancelled")]
    Cancelled,
    #[serde(rename = "order.payment_failed")]
    PaymentFailed,
}

impl OrderEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderEventType::Created => "order.created",
            OrderEventType::Completed => "order.completed",
            OrderEventType::Cancelled => "order.cancelled",
            OrderEventType::PaymentFailed => "order.payment_failed",
        }
    }

    /// Returns true for the event that closes an order's lifecycle.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, OrderEventType::Created)
    }
}

impl std::fmt::Display for OrderEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OrderEventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "order.created" => Ok(OrderEventType::Created),
            "order.completed" => Ok(OrderEventType::Completed),
            "order.cancelled" => Ok(OrderEventType::Cancelled),
            "order.payment_failed" => Ok(OrderEventType::PaymentFailed),
            other => Err(format!("unknown order event type: {other}")),
        }
    }
}

/// Payload published to [`ORDER_EVENTS_TOPIC`], keyed by order id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderMessage {
    pub order_id: AggregateId,
    pub user_id: UserId,
    pub event_type: OrderEventType,
    pub status: OrderStatus,
    pub total_price: Money,
}

impl OrderMessage {
    /// Snapshots an order for the given event.
    ///
    /// Returns None for an order that was never created.
    pub fn from_order(order: &Order, event_type: OrderEventType) -> Option<Self> {
        use domain::Aggregate;

        Some(Self {
            order_id: order.id()?,
            user_id: order.user_id()?,
            event_type,
            status: order.status(),
            total_price: order.total_price(),
        })
    }
}

/// Publishes order lifecycle events.
///
/// Delivery is at-least-once and ordered per order id, which is used as the
/// partitioning key. Consumers must tolerate duplicates.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, message: &OrderMessage) -> Result<(), ServiceError>;
}

/// A message as it was handed to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub topic: &'static str,
    pub key: String,
    pub message: OrderMessage,
}

#[derive(Debug, Default)]
struct InMemoryPublisherState {
    published: Vec<PublishedMessage>,
    faults: Faults,
}

/// In-memory broker that records messages and fans them out to subscribers.
#[derive(Debug, Clone)]
pub struct InMemoryEventPublisher {
    state: Arc<Mutex<InMemoryPublisherState>>,
    sender: broadcast::Sender<OrderMessage>,
}

impl InMemoryEventPublisher {
    /// Creates a publisher buffering up to 1024 undelivered messages per subscriber.
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self {
            state: Arc::default(),
            sender,
        }
    }

    /// Subscribes to messages published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<OrderMessage> {
        self.sender.subscribe()
    }

    /// Makes the next `calls` publishes fail transiently.
    pub async fn fail_next(&self, calls: u32) {
        self.state.lock().await.faults.fail_next(calls);
    }

    /// Makes every publish fail until cleared.
    pub async fn set_unavailable(&self, down: bool) {
        self.state.lock().await.faults.set_down(down);
    }

    /// Delays every publish by `latency`.
    pub async fn set_latency(&self, latency: Option<Duration>) {
        self.state.lock().await.faults.set_latency(latency);
    }

    /// Returns every message published so far, in publish order.
    pub async fn published(&self) -> Vec<PublishedMessage> {
        self.state.lock().await.published.clone()
    }

    /// Returns the event types published for one order, in publish order.
    pub async fn event_types_for(&self, order_id: AggregateId) -> Vec<OrderEventType> {
        self.state
            .lock()
            .await
            .published
            .iter()
            .filter(|p| p.message.order_id == order_id)
            .map(|p| p.message.event_type)
            .collect()
    }
}

impl Default for InMemoryEventPublisher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventPublisher for InMemoryEventPublisher {
    async fn publish(&self, message: &OrderMessage) -> Result<(), ServiceError> {
        let latency = self.state.lock().await.faults.latency();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state.lock().await;
        state.faults.check(SERVICE)?;

        state.published.push(PublishedMessage {
            topic: ORDER_EVENTS_TOPIC,
            key: message.order_id.to_string(),
            message: message.clone(),
        });
        // No subscribers is fine; the message is still recorded.
        let _ = self.sender.send(message.clone());

        tracing::debug!(
            topic = ORDER_EVENTS_TOPIC,
            order_id = %message.order_id,
            event_type = %message.event_type,
            "order event published"
        );
        Ok(())
    }
}
