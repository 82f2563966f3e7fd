//! Order service providing a simplified API for order operations.

use std::collections::HashMap;

use common::AggregateId;
use event_store::EventStore;

use crate::command::{CommandHandler, CommandResult};
use crate::error::DomainError;

use super::{CreateOrder, GoodId, Money, Order, OrderError, OrderStatus, OrderTransition};

/// Service for managing orders.
///
/// Wraps the command handler so callers work in terms of orders and
/// transitions instead of raw events.
pub struct OrderService<S: EventStore> {
    handler: CommandHandler<S, Order>,
}

impl<S: EventStore> OrderService<S> {
    /// Creates a new order service with the given event store.
    pub fn new(store: S) -> Self {
        Self {
            handler: CommandHandler::new(store),
        }
    }

    /// Returns a reference to the underlying command handler.
    pub fn handler(&self) -> &CommandHandler<S, Order> {
        &self.handler
    }

    /// Creates an order and captures its authoritative prices atomically.
    #[tracing::instrument(skip(self, cmd), fields(order_id = %cmd.order_id()))]
    pub async fn place_order(
        &self,
        cmd: CreateOrder,
        unit_prices: HashMap<GoodId, Money>,
    ) -> Result<CommandResult<Order>, DomainError> {
        let order_id = cmd.order_id();
        let result = self
            .handler
            .execute(order_id, |order| order.place(cmd, unit_prices))
            .await?;
        record_transition(OrderStatus::Priced);
        Ok(result)
    }

    /// Applies one state machine transition to an existing order.
    #[tracing::instrument(skip(self))]
    pub async fn transition(
        &self,
        order_id: AggregateId,
        transition: OrderTransition,
    ) -> Result<CommandResult<Order>, DomainError> {
        let target = transition.target();
        let result = self
            .handler
            .execute(order_id, |order| order.transition(transition))
            .await
            .map_err(|e| match e {
                DomainError::Order(OrderError::NotCreated) => DomainError::OrderNotFound(order_id),
                other => other,
            })?;
        record_transition(target);
        tracing::debug!(%order_id, status = %target, "Order transitioned");
        Ok(result)
    }

    /// Moves an order to an operator-requested status.
    #[tracing::instrument(skip(self))]
    pub async fn update_status(
        &self,
        order_id: AggregateId,
        status: OrderStatus,
        reason: String,
    ) -> Result<CommandResult<Order>, DomainError> {
        let transition = OrderTransition::from_status(status, reason)?;
        self.transition(order_id, transition).await
    }

    /// Gets an order by ID.
    pub async fn get_order(&self, order_id: AggregateId) -> Result<Option<Order>, DomainError> {
        self.handler.load_existing(order_id).await
    }
}

fn record_transition(status: OrderStatus) {
    metrics::counter!("order_transitions_total", "to" => status.as_str()).increment(1);
}
