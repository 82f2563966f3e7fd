//! Integration tests for the Order aggregate.
//!
//! These tests verify the order lifecycle including event persistence,
//! aggregate reconstruction, and concurrency handling.

use std::collections::HashMap;

use common::AggregateId;
use domain::{
    Aggregate, CreateOrder, DomainError, DomainEvent, GoodId, Money, Order, OrderError,
    OrderEvent, OrderLine, OrderService, OrderStatus, OrderTransition, UserId,
};
use event_store::{EventStore, EventStoreError, InMemoryEventStore, Version};

fn create_service() -> OrderService<InMemoryEventStore> {
    OrderService::new(InMemoryEventStore::new())
}

fn create_cmd(order_id: AggregateId, lines: Vec<OrderLine>) -> CreateOrder {
    CreateOrder::new(
        order_id,
        UserId::new(),
        lines,
        Some("42 Harbour Road".to_string()),
    )
    .unwrap()
}

fn catalog() -> HashMap<GoodId, Money> {
    HashMap::from([
        (GoodId::new("widget"), Money::from_cents(1000)),
        (GoodId::new("gadget"), Money::from_cents(500)),
        (GoodId::new("gizmo"), Money::from_cents(333)),
    ])
}

async fn placed(service: &OrderService<InMemoryEventStore>) -> AggregateId {
    let order_id = AggregateId::new();
    service
        .place_order(
            create_cmd(order_id, vec![OrderLine::new("widget", 2)]),
            catalog(),
        )
        .await
        .unwrap();
    order_id
}

mod order_lifecycle {
    use super::*;

    #[tokio::test]
    async fn complete_order_lifecycle() {
        let service = create_service();
        let order_id = AggregateId::new();

        let result = service
            .place_order(
                create_cmd(
                    order_id,
                    vec![OrderLine::new("widget", 2), OrderLine::new("gadget", 1)],
                ),
                catalog(),
            )
            .await
            .unwrap();
        assert_eq!(result.aggregate.status(), OrderStatus::Priced);
        assert_eq!(result.aggregate.total_price().cents(), 2500);

        for transition in [
            OrderTransition::ReserveStock,
            OrderTransition::Pay {
                payment_id: Some("pay-7".to_string()),
            },
            OrderTransition::ScheduleDelivery {
                delivery_id: Some("del-7".to_string()),
            },
            OrderTransition::Complete,
        ] {
            service.transition(order_id, transition).await.unwrap();
        }

        let order = service.get_order(order_id).await.unwrap().unwrap();
        assert_eq!(order.status(), OrderStatus::Completed);
        assert_eq!(order.version(), Version::new(6));
        assert_eq!(order.payment_id(), Some("pay-7"));
        assert_eq!(order.delivery_id(), Some("del-7"));
        assert_eq!(order.total_price().cents(), 2500);
    }

    #[tokio::test]
    async fn reservation_failure_ends_cancelled() {
        let service = create_service();
        let order_id = placed(&service).await;

        service
            .transition(
                order_id,
                OrderTransition::FailReservation {
                    reason: "insufficient stock for widget".to_string(),
                },
            )
            .await
            .unwrap();
        let result = service
            .transition(
                order_id,
                OrderTransition::Cancel {
                    reason: "released".to_string(),
                },
            )
            .await
            .unwrap();

        assert_eq!(result.aggregate.status(), OrderStatus::Cancelled);
        assert_eq!(
            result.aggregate.status_reason(),
            Some("insufficient stock for widget")
        );
    }

    #[tokio::test]
    async fn aggregate_reconstruction_from_events() {
        let service = create_service();
        let order_id = placed(&service).await;
        service
            .transition(order_id, OrderTransition::ReserveStock)
            .await
            .unwrap();

        let events = service
            .handler()
            .store()
            .get_events_for_aggregate(order_id)
            .await
            .unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].event_type, "OrderCreated");
        assert_eq!(events[1].event_type, "OrderPriced");
        assert_eq!(events[2].event_type, "StockReserved");

        let mut order = Order::default();
        for envelope in &events {
            let event: OrderEvent = envelope.decode().unwrap();
            order.apply(event);
            order.set_version(envelope.version);
        }

        assert_eq!(order.id(), Some(order_id));
        assert_eq!(order.status(), OrderStatus::Reserved);
        assert_eq!(order.items()[0].unit_price, Some(Money::from_cents(1000)));
        assert_eq!(order.version(), Version::new(3));
    }
}

mod concurrency {
    use super::*;
    use event_store::{AppendOptions, EventEnvelope};

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

    #[tokio::test]
    async fn concurrent_modifications_detected() {
        let store = InMemoryEventStore::new();
        let service = OrderService::new(store.clone());
        let order_id = placed(&service).await;

        let first = envelope(order_id, 3, &OrderEvent::stock_reserved());
        store
            .append(vec![first], AppendOptions::expect_version(Version::new(2)))
            .await
            .unwrap();

        let second = envelope(order_id, 3, &OrderEvent::order_cancelled("stale writer"));
        let result = store
            .append(vec![second], AppendOptions::expect_version(Version::new(2)))
            .await;

        assert!(matches!(
            result,
            Err(EventStoreError::ConcurrencyConflict { .. })
        ));
    }

    #[tokio::test]
    async fn sequential_commands_reload_latest_state() {
        let service = create_service();
        let order_id = placed(&service).await;

        service
            .transition(order_id, OrderTransition::ReserveStock)
            .await
            .unwrap();
        let result = service
            .transition(
                order_id,
                OrderTransition::StartCompensation {
                    reason: "operator cancel".to_string(),
                },
            )
            .await
            .unwrap();

        assert_eq!(result.new_version, Version::new(4));
        assert_eq!(result.aggregate.status(), OrderStatus::Compensating);
    }
}

mod error_handling {
    use super::*;

    #[tokio::test]
    async fn completed_order_cannot_move_back() {
        let service = create_service();
        let order_id = placed(&service).await;
        for transition in [
            OrderTransition::ReserveStock,
            OrderTransition::Pay { payment_id: None },
            OrderTransition::Complete,
        ] {
            service.transition(order_id, transition).await.unwrap();
        }

        for status in [OrderStatus::Cancelled, OrderStatus::Failed] {
            let result = service
                .update_status(order_id, status, "operator".to_string())
                .await;
            assert!(
                matches!(
                    result,
                    Err(DomainError::Order(OrderError::InvalidStateTransition {
                        from: OrderStatus::Completed,
                        ..
                    }))
                ),
                "completed -> {status} must be rejected"
            );
        }

        let order = service.get_order(order_id).await.unwrap().unwrap();
        assert_eq!(order.status(), OrderStatus::Completed);
        assert_eq!(order.version(), Version::new(5));
    }

    #[tokio::test]
    async fn paid_order_cannot_be_cancelled_directly() {
        let service = create_service();
        let order_id = placed(&service).await;
        service
            .transition(order_id, OrderTransition::ReserveStock)
            .await
            .unwrap();
        service
            .transition(order_id, OrderTransition::Pay { payment_id: None })
            .await
            .unwrap();

        let result = service
            .transition(
                order_id,
                OrderTransition::Cancel {
                    reason: "changed mind".to_string(),
                },
            )
            .await;

        assert!(matches!(
            result,
            Err(DomainError::Order(OrderError::InvalidStateTransition { .. }))
        ));
    }

    #[tokio::test]
    async fn unknown_good_prevents_order_creation() {
        let store = InMemoryEventStore::new();
        let service = OrderService::new(store.clone());

        let result = service
            .place_order(
                create_cmd(AggregateId::new(), vec![OrderLine::new("unobtainium", 1)]),
                catalog(),
            )
            .await;

        assert!(matches!(
            result,
            Err(DomainError::Order(OrderError::MissingPrice { .. }))
        ));
        assert_eq!(store.event_count().await, 0);
    }

    #[tokio::test]
    async fn placing_same_order_twice_is_rejected() {
        let service = create_service();
        let order_id = placed(&service).await;

        let result = service
            .place_order(
                create_cmd(order_id, vec![OrderLine::new("gadget", 1)]),
                catalog(),
            )
            .await;

        assert!(matches!(
            result,
            Err(DomainError::Order(OrderError::AlreadyCreated))
        ));
    }
}

mod pricing {
    use super::*;

    #[tokio::test]
    async fn total_is_sum_of_quantity_times_captured_price() {
        let service = create_service();
        let order_id = AggregateId::new();

        let result = service
            .place_order(
                create_cmd(
                    order_id,
                    vec![
                        OrderLine::new("gizmo", 3),
                        OrderLine::new("widget", 1),
                        OrderLine::new("gizmo", 2),
                    ],
                ),
                catalog(),
            )
            .await
            .unwrap();

        let order = result.aggregate;
        let expected: i64 = order
            .items()
            .iter()
            .map(|item| i64::from(item.quantity) * item.unit_price.unwrap().cents())
            .sum();
        assert_eq!(order.items().len(), 2);
        assert_eq!(order.items()[0].quantity, 5);
        assert_eq!(order.total_price().cents(), expected);
        assert_eq!(expected, 5 * 333 + 1000);
    }
}
