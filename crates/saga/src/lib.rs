//! Order fulfillment saga.
//!
//! The coordinator drives an order through these steps:
//! 1. Price every item from the inventory service
//! 2. Check availability, then reserve stock item by item
//! 3. Charge payment
//! 4. Schedule delivery (non-fatal; retried through the outbox)
//!
//! Reservations are released when a later step fails. Every step is logged
//! on the order's saga stream, and lifecycle messages leave through a
//! per-order outbox, so a crashed run can be resumed with
//! [`SagaCoordinator::recover`].

pub mod aggregate;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod notifications;
pub mod order_fulfillment;
pub mod outbox;
pub mod relay;
pub mod retry;
pub mod services;
pub mod state;

pub use aggregate::SagaInstance;
pub use config::SagaConfig;
pub use coordinator::{CreateOrderRequest, RecoveryReport, SagaCoordinator, saga_id};
pub use error::{NotificationError, SagaError, ServiceError};
pub use events::{SagaEvent, SagaFailure};
pub use notifications::{Notification, NotificationConsumer};
pub use outbox::{OrderOutbox, Outbox, OutboxEntry, OutboxTask};
pub use relay::run_outbox_relay;
pub use retry::{RetryPolicy, StepOutcome};
pub use services::{
    ChargeOutcome, ChargeRecord, DeliveryService, EventPublisher, Good, InMemoryDeliveryService,
    InMemoryEventPublisher, InMemoryInventoryService, InMemoryPaymentService, InventoryOp,
    InventoryService, ORDER_EVENTS_TOPIC, OrderEventType, OrderMessage, PaymentService,
    PublishedMessage,
};
pub use state::SagaState;
