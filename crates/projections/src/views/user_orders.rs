//! User orders read model: every order a user placed, newest first.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use common::AggregateId;
use domain::{Aggregate, Order, OrderEvent, UserId};
use event_store::EventEnvelope;
use tokio::sync::RwLock;

use crate::projection::{Projection, ProjectionPosition};
use crate::read_model::ReadModel;
use crate::{ProjectionError, Result};

#[derive(Default)]
struct UserOrdersState {
    /// Orders folded from their events, keyed by order id.
    orders: HashMap<AggregateId, Order>,
    /// Order ids per user, in the order their creation was observed.
    by_user: HashMap<UserId, Vec<AggregateId>>,
    position: ProjectionPosition,
}

/// Read model backing the "list a user's orders" query.
///
/// Cheap to clone; clones share the same state, so one clone can be
/// registered with a processor while another serves queries.
#[derive(Clone, Default)]
pub struct UserOrdersView {
    state: Arc<RwLock<UserOrdersState>>,
}

impl UserOrdersView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the user's orders sorted by creation time, newest first.
    pub async fn list_user_orders(&self, user_id: UserId) -> Vec<Order> {
        let state = self.state.read().await;
        let Some(ids) = state.by_user.get(&user_id) else {
            return Vec::new();
        };

        let mut orders: Vec<Order> = ids
            .iter()
            .rev()
            .filter_map(|id| state.orders.get(id).cloned())
            .collect();
        orders.sort_by(|a, b| b.created_at().cmp(&a.created_at()));
        orders
    }

    pub async fn get_order(&self, order_id: AggregateId) -> Option<Order> {
        self.state.read().await.orders.get(&order_id).cloned()
    }
}

#[async_trait]
impl Projection for UserOrdersView {
    fn name(&self) -> &'static str {
        "UserOrdersView"
    }

    async fn handle(&self, event: &EventEnvelope) -> Result<()> {
        let mut state = self.state.write().await;
        state.position = state.position.advance();

        // Saga logs and outboxes share the store.
        if event.aggregate_type != Order::aggregate_type() {
            return Ok(());
        }

        let order_event: OrderEvent = serde_json::from_value(event.payload.clone())?;
        let order_id = event.aggregate_id;

        if let OrderEvent::OrderCreated(data) = &order_event {
            let user_id = data.user_id;
            let ids = state.by_user.entry(user_id).or_default();
            if !ids.contains(&order_id) {
                ids.push(order_id);
            }
            state.orders.entry(order_id).or_default();
        }

        let order = state
            .orders
            .get_mut(&order_id)
            .ok_or(ProjectionError::UnknownOrder(order_id))?;
        order.apply(order_event);
        order.set_version(event.version);

        Ok(())
    }

    async fn position(&self) -> ProjectionPosition {
        self.state.read().await.position
    }

    async fn reset(&self) -> Result<()> {
        *self.state.write().await = UserOrdersState::default();
        Ok(())
    }
}

impl ReadModel for UserOrdersView {
    fn name(&self) -> &'static str {
        "UserOrdersView"
    }

    fn count(&self) -> usize {
        // Reports zero while a writer holds the lock.
        self.state.try_read().map(|s| s.orders.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::order::PricedGood;
    use domain::{DomainEvent, GoodId, LineItem, Money, OrderStatus};
    use event_store::Version;

    fn envelope(order_id: AggregateId, version: i64, event: &OrderEvent) -> EventEnvelope {
        EventEnvelope::builder()
            .aggregate_id(order_id)
            .aggregate_type("Order")
            .event_type(event.event_type())
            .version(Version::new(version))
            .payload(event)
            .unwrap()
            .build()
            .unwrap()
    }

    fn created(order_id: AggregateId, user_id: UserId) -> OrderEvent {
        OrderEvent::order_created(
            order_id,
            user_id,
            vec![LineItem {
                good_id: GoodId::new("widget"),
                quantity: 2,
                unit_price: None,
            }],
            Some("1 Main St".to_string()),
        )
    }

    #[tokio::test]
    async fn test_created_order_is_listed_for_its_user() {
        let view = UserOrdersView::new();
        let user = UserId::new();
        let order_id = AggregateId::new();

        view.handle(&envelope(order_id, 1, &created(order_id, user)))
            .await
            .unwrap();

        let orders = view.list_user_orders(user).await;
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].id(), Some(order_id));
        assert_eq!(orders[0].status(), OrderStatus::Pending);
        assert!(view.list_user_orders(UserId::new()).await.is_empty());
    }

    #[tokio::test]
    async fn test_follows_status_changes() {
        let view = UserOrdersView::new();
        let user = UserId::new();
        let order_id = AggregateId::new();

        let priced = OrderEvent::order_priced(
            vec![PricedGood {
                good_id: GoodId::new("widget"),
                unit_price: Money::from_cents(1000),
            }],
            Money::from_cents(2000),
        );
        view.handle(&envelope(order_id, 1, &created(order_id, user)))
            .await
            .unwrap();
        view.handle(&envelope(order_id, 2, &priced)).await.unwrap();
        view.handle(&envelope(order_id, 3, &OrderEvent::order_cancelled("out of stock")))
            .await
            .unwrap();

        let order = view.get_order(order_id).await.unwrap();
        assert_eq!(order.status(), OrderStatus::Cancelled);
        assert_eq!(order.total_price(), Money::from_cents(2000));
        assert_eq!(order.version(), Version::new(3));
    }

    #[tokio::test]
    async fn test_newest_first() {
        let view = UserOrdersView::new();
        let user = UserId::new();
        let first = AggregateId::new();
        let second = AggregateId::new();

        view.handle(&envelope(first, 1, &created(first, user)))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        view.handle(&envelope(second, 1, &created(second, user)))
            .await
            .unwrap();

        let ids: Vec<_> = view
            .list_user_orders(user)
            .await
            .iter()
            .filter_map(|o| o.id())
            .collect();
        assert_eq!(ids, vec![second, first]);
    }

    #[tokio::test]
    async fn test_ignores_other_streams() {
        let view = UserOrdersView::new();
        let envelope = EventEnvelope::builder()
            .aggregate_id(AggregateId::new())
            .aggregate_type("OrderOutbox")
            .event_type("MessageEnqueued")
            .version(Version::new(1))
            .payload_raw(serde_json::json!({"seq": 1}))
            .build()
            .unwrap();

        view.handle(&envelope).await.unwrap();

        assert_eq!(ReadModel::count(&view), 0);
        assert_eq!(view.position().await.events_processed, 1);
    }

    #[tokio::test]
    async fn test_event_for_unknown_order_is_rejected() {
        let view = UserOrdersView::new();
        let order_id = AggregateId::new();

        let result = view
            .handle(&envelope(order_id, 2, &OrderEvent::stock_reserved()))
            .await;

        assert!(matches!(result, Err(ProjectionError::UnknownOrder(id)) if id == order_id));
    }

    #[tokio::test]
    async fn test_reset_clears_state() {
        let view = UserOrdersView::new();
        let user = UserId::new();
        let order_id = AggregateId::new();
        view.handle(&envelope(order_id, 1, &created(order_id, user)))
            .await
            .unwrap();

        view.reset().await.unwrap();

        assert!(view.list_user_orders(user).await.is_empty());
        assert_eq!(view.position().await, ProjectionPosition::zero());
    }
}
