//! Notification consumer for order lifecycle messages.

use std::collections::{HashSet, VecDeque};

use common::AggregateId;
use domain::UserId;
use tokio::sync::broadcast::{self, error::RecvError};

use crate::error::NotificationError;
use crate::services::{OrderEventType, OrderMessage};

/// A notification sent to a customer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub order_id: AggregateId,
    pub user_id: UserId,
    pub event_type: OrderEventType,
    pub subject: String,
}

/// Number of recent `(order_id, event_type)` keys remembered for deduplication.
pub const DEFAULT_DEDUPE_WINDOW: usize = 10_000;

type MessageKey = (AggregateId, OrderEventType);

/// Turns lifecycle messages into customer notifications.
///
/// Delivery upstream is at-least-once, so messages are deduplicated on
/// `(order_id, event_type)`: a redelivered message is acknowledged without
/// notifying twice. Only the most recent keys are kept; a redelivery older
/// than the window is treated as new.
#[derive(Debug)]
pub struct NotificationConsumer {
    seen: HashSet<MessageKey>,
    arrival: VecDeque<MessageKey>,
    window: usize,
    sent: u64,
}

impl Default for NotificationConsumer {
    fn default() -> Self {
        Self::with_window(DEFAULT_DEDUPE_WINDOW)
    }
}

impl NotificationConsumer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a consumer remembering at most `window` keys.
    pub fn with_window(window: usize) -> Self {
        let window = window.max(1);
        Self {
            seen: HashSet::with_capacity(window),
            arrival: VecDeque::with_capacity(window),
            window,
            sent: 0,
        }
    }

    /// Handles a raw payload as read from the topic.
    ///
    /// Returns `Ok(None)` for a duplicate.
    pub fn handle_payload(
        &mut self,
        payload: &serde_json::Value,
    ) -> Result<Option<Notification>, NotificationError> {
        let event_type = payload
            .get("event_type")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| NotificationError::Malformed("missing event_type".to_string()))?;
        event_type
            .parse::<OrderEventType>()
            .map_err(|_| NotificationError::UnknownEventType(event_type.to_string()))?;

        let message: OrderMessage = serde_json::from_value(payload.clone())
            .map_err(|e| NotificationError::Malformed(e.to_string()))?;
        Ok(self.handle(&message))
    }

    /// Handles a decoded message. Returns `None` for a duplicate.
    pub fn handle(&mut self, message: &OrderMessage) -> Option<Notification> {
        let key = (message.order_id, message.event_type);
        if !self.remember(key) {
            tracing::debug!(
                order_id = %message.order_id,
                event_type = %message.event_type,
                "duplicate message acknowledged"
            );
            return None;
        }

        let order_id = message.order_id;
        let subject = match message.event_type {
            OrderEventType::Created => format!("We received your order {order_id}"),
            OrderEventType::Completed => {
                format!("Order {order_id} confirmed, total {}", message.total_price)
            }
            OrderEventType::Cancelled => format!("Order {order_id} was cancelled"),
            OrderEventType::PaymentFailed => format!("Payment for order {order_id} failed"),
        };

        let notification = Notification {
            order_id,
            user_id: message.user_id,
            event_type: message.event_type,
            subject,
        };
        tracing::info!(
            %order_id,
            user_id = %notification.user_id,
            event_type = %notification.event_type,
            "notification sent"
        );
        self.sent += 1;
        Some(notification)
    }

    /// Number of notifications sent so far.
    pub fn sent_count(&self) -> u64 {
        self.sent
    }

    /// Number of keys currently remembered.
    pub fn remembered(&self) -> usize {
        self.seen.len()
    }

    /// Records a key, evicting the oldest past the window. Returns false if
    /// the key was already remembered.
    fn remember(&mut self, key: MessageKey) -> bool {
        if !self.seen.insert(key) {
            return false;
        }
        self.arrival.push_back(key);
        while self.arrival.len() > self.window {
            if let Some(oldest) = self.arrival.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }

    /// Consumes messages until the channel closes, then returns the consumer.
    pub async fn run(mut self, mut receiver: broadcast::Receiver<OrderMessage>) -> Self {
        loop {
            match receiver.recv().await {
                Ok(message) => {
                    self.handle(&message);
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "notification consumer lagged behind");
                }
                Err(RecvError::Closed) => break,
            }
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::{Money, OrderStatus};

    fn message(event_type: OrderEventType) -> OrderMessage {
        OrderMessage {
            order_id: AggregateId::new(),
            user_id: UserId::new(),
            event_type,
            status: OrderStatus::Completed,
            total_price: Money::from_cents(1250),
        }
    }

    #[test]
    fn test_duplicates_are_acknowledged_once() {
        let mut consumer = NotificationConsumer::new();
        let completed = message(OrderEventType::Completed);

        let first = consumer.handle(&completed).unwrap();
        assert!(first.subject.contains("$12.50"));
        assert!(consumer.handle(&completed).is_none());

        let mut created = completed.clone();
        created.event_type = OrderEventType::Created;
        assert!(consumer.handle(&created).is_some());
        assert_eq!(consumer.sent_count(), 2);
    }

    #[test]
    fn test_unknown_event_type_is_rejected() {
        let mut consumer = NotificationConsumer::new();
        let mut payload = serde_json::to_value(message(OrderEventType::Created)).unwrap();
        payload["event_type"] = serde_json::json!("order.refunded");

        assert_eq!(
            consumer.handle_payload(&payload),
            Err(NotificationError::UnknownEventType(
                "order.refunded".to_string()
            ))
        );
        assert!(consumer.sent_count() == 0);
    }

    #[test]
    fn test_payload_round_trip() {
        let mut consumer = NotificationConsumer::new();
        let payload = serde_json::to_value(message(OrderEventType::PaymentFailed)).unwrap();
        assert_eq!(payload["event_type"], "order.payment_failed");

        let notification = consumer.handle_payload(&payload).unwrap().unwrap();
        assert_eq!(notification.event_type, OrderEventType::PaymentFailed);
        assert_eq!(consumer.handle_payload(&payload), Ok(None));
    }

    #[test]
    fn test_dedupe_window_is_bounded() {
        let mut consumer = NotificationConsumer::with_window(2);
        let first = message(OrderEventType::Created);
        let second = message(OrderEventType::Created);
        let third = message(OrderEventType::Created);

        assert!(consumer.handle(&first).is_some());
        assert!(consumer.handle(&second).is_some());
        assert!(consumer.handle(&second).is_none());
        assert!(consumer.handle(&third).is_some());
        assert_eq!(consumer.remembered(), 2);

        // Evicted from the window, so it counts as new again.
        assert!(consumer.handle(&first).is_some());
        assert!(consumer.handle(&third).is_none());
        assert_eq!(consumer.sent_count(), 4);
        assert_eq!(consumer.remembered(), 2);
    }

    #[tokio::test]
    async fn test_run_consumes_until_closed() {
        let (tx, rx) = broadcast::channel(8);
        let cancelled = message(OrderEventType::Cancelled);
        tx.send(cancelled.clone()).unwrap();
        tx.send(cancelled).unwrap();
        drop(tx);

        let consumer = NotificationConsumer::new().run(rx).await;
        assert_eq!(consumer.sent_count(), 1);
    }
}
