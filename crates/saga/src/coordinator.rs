//! Saga coordinator for the order fulfillment flow.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use common::AggregateId;
use domain::{
    Aggregate, CommandHandler, CreateOrder, DomainError, GoodId, LineItem, Money, Order,
    OrderLine, OrderService, OrderStatus, OrderTransition, PaymentMethod, UserId,
};
use event_store::{EventStore, EventStoreExt};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::aggregate::SagaInstance;
use crate::config::SagaConfig;
use crate::error::{Result, SagaError, ServiceError};
use crate::events::{SagaEvent, SagaFailure};
use crate::order_fulfillment::{
    SAGA_STREAM, SAGA_TYPE, STEP_CANCEL_ORDER, STEP_CHARGE_PAYMENT, STEP_CHECK_AVAILABILITY,
    STEP_PRICE_ORDER, STEP_RELEASE_STOCK, STEP_RESERVE_STOCK, STEP_SCHEDULE_DELIVERY,
};
use crate::outbox::{Outbox, OutboxTask};
use crate::retry::{RetryPolicy, StepOutcome};
use crate::services::{
    ChargeOutcome, DeliveryService, EventPublisher, InventoryService, OrderEventType,
    OrderMessage, PaymentService,
};
use crate::state::SagaState;

/// Input of [`SagaCoordinator::create_order`].
#[derive(Debug, Clone)]
pub struct CreateOrderRequest {
    pub user_id: UserId,
    pub lines: Vec<OrderLine>,
    pub address: Option<String>,
    /// Retries carrying the same key resolve to the same order.
    pub idempotency_key: Option<String>,
}

/// Summary of one recovery pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Sagas driven to a resting state.
    pub resumed: usize,
    /// Sagas that could not be resumed; the next pass picks them up again.
    pub failed: usize,
    /// Outbox entries dispatched.
    pub dispatched: usize,
}

/// Returns the saga log id of an order.
pub fn saga_id(order_id: AggregateId) -> AggregateId {
    order_id.derive(SAGA_STREAM)
}

/// Orchestrates order fulfillment across inventory, payment and delivery.
///
/// The order status is the saga's position: every step reads it, performs
/// its external calls under the retry policy and moves the order forward or
/// onto a failure branch. The per-order step log records what was attempted
/// so a crashed run can be resumed and compensated. One order is driven by
/// at most one task at a time; distinct orders never wait on each other.
pub struct SagaCoordinator<S, I, P, D, E>
where
    S: EventStore,
    I: InventoryService,
    P: PaymentService,
    D: DeliveryService,
    E: EventPublisher,
{
    store: S,
    orders: OrderService<S>,
    sagas: CommandHandler<S, SagaInstance>,
    outbox: Outbox<S>,
    inventory: I,
    payment: P,
    delivery: D,
    publisher: E,
    retry: RetryPolicy,
    payment_method: PaymentMethod,
    locks: Mutex<HashMap<AggregateId, Arc<Mutex<()>>>>,
    /// Orders whose saga is being driven or was abandoned before it rested.
    in_flight: Mutex<HashSet<AggregateId>>,
}

impl<S, I, P, D, E> SagaCoordinator<S, I, P, D, E>
where
    S: EventStore + Clone,
    I: InventoryService,
    P: PaymentService,
    D: DeliveryService,
    E: EventPublisher,
{
    /// Creates a coordinator with the default configuration.
    pub fn new(store: S, inventory: I, payment: P, delivery: D, publisher: E) -> Self {
        Self {
            orders: OrderService::new(store.clone()),
            sagas: CommandHandler::new(store.clone()),
            outbox: Outbox::new(store.clone()),
            store,
            inventory,
            payment,
            delivery,
            publisher,
            retry: RetryPolicy::default(),
            payment_method: PaymentMethod::default(),
            locks: Mutex::default(),
            in_flight: Mutex::default(),
        }
    }

    /// Applies retry, deadline and payment settings.
    pub fn with_config(mut self, config: &SagaConfig) -> Self {
        self.retry = RetryPolicy::from_config(config);
        self.payment_method = config.payment_method;
        self
    }

    /// Overrides the retry policy.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Creates an order and runs its fulfillment saga to a resting state.
    ///
    /// Prices come from the inventory service, never from the caller. A
    /// request carrying an idempotency key that was already seen resumes the
    /// existing order instead of creating a second one.
    ///
    /// Orders that end cancelled or failed are persisted and reported through
    /// the matching [`SagaError`] variant, which carries the order id.
    #[tracing::instrument(skip(self, request), fields(user_id = %request.user_id))]
    pub async fn create_order(&self, request: CreateOrderRequest) -> Result<Order> {
        let order_id = request
            .idempotency_key
            .as_deref()
            .map_or_else(AggregateId::new, AggregateId::from_idempotency_key);
        let cmd = CreateOrder::new(order_id, request.user_id, request.lines, request.address)
            .map_err(|e| SagaError::Validation(e.to_string()))?;

        let _guard = self.lock_order(order_id).await;
        if self.orders.get_order(order_id).await?.is_some() {
            tracing::info!(%order_id, "order already exists, resuming its saga");
            return self.drive(order_id).await;
        }

        metrics::counter!("saga_executions_total").increment(1);
        let started = Instant::now();

        let unit_prices = self.price_items(cmd.items()).await?;
        self.in_flight.lock().await.insert(order_id);
        if let Err(e) = self.orders.place_order(cmd, unit_prices).await {
            self.in_flight.lock().await.remove(&order_id);
            return Err(e.into());
        }
        self.record(
            order_id,
            vec![
                SagaEvent::saga_started(saga_id(order_id), order_id, SAGA_TYPE),
                SagaEvent::step_started(STEP_PRICE_ORDER),
                SagaEvent::step_completed(STEP_PRICE_ORDER),
            ],
        )
        .await?;
        tracing::info!(%order_id, "saga started");

        let result = self.drive(order_id).await;
        metrics::histogram!("saga_duration_seconds").record(started.elapsed().as_secs_f64());
        result
    }

    /// Loads an order.
    pub async fn get_order(&self, order_id: AggregateId) -> Result<Order> {
        self.load_order(order_id).await
    }

    /// Loads the saga step log of an order.
    pub async fn get_saga(&self, order_id: AggregateId) -> Result<Option<SagaInstance>> {
        Ok(self.sagas.load_existing(saga_id(order_id)).await?)
    }

    /// Moves an order to an operator-requested status.
    ///
    /// Only `completed`, `cancelled` and `failed` can be requested; the other
    /// statuses are reached through saga steps alone. Cancelling or failing an
    /// order that may hold reservations releases them first, so the order
    /// passes through compensation and ends cancelled (or failed if a release
    /// fails).
    #[tracing::instrument(skip(self, reason))]
    pub async fn update_order_status(
        &self,
        order_id: AggregateId,
        status: OrderStatus,
        reason: Option<String>,
    ) -> Result<Order> {
        let reason = reason.unwrap_or_else(|| "requested by operator".to_string());
        OrderTransition::from_status(status, reason.clone())?;
        let _guard = self.lock_order(order_id).await;
        let order = self.load_order(order_id).await?;
        let saga = self.load_saga(order_id).await?;

        let ending = matches!(status, OrderStatus::Cancelled | OrderStatus::Failed);
        let holds_stock = match order.status() {
            OrderStatus::Reserved
            | OrderStatus::ReservationFailed
            | OrderStatus::PaymentFailed
            | OrderStatus::Compensating => true,
            OrderStatus::Priced => !saga.held_goods().is_empty(),
            _ => false,
        };

        if !(ending && holds_stock) {
            let updated = self
                .orders
                .update_status(order_id, status, reason.clone())
                .await?
                .aggregate;
            if updated.is_terminal() {
                if updated.status() != OrderStatus::Completed && saga.failure().is_none() {
                    self.record_cancellation(order_id, reason).await?;
                }
                let saga = self.load_saga(order_id).await?;
                self.finish(&updated, &saga).await?;
            }
            return Ok(updated);
        }

        if saga.failure().is_none() {
            self.record_cancellation(order_id, reason.clone()).await?;
        }
        match order.status() {
            OrderStatus::Reserved => {
                self.transition(order_id, OrderTransition::StartCompensation { reason })
                    .await?;
            }
            OrderStatus::Priced => {
                self.transition(order_id, OrderTransition::FailReservation { reason })
                    .await?;
            }
            _ => {}
        }
        tracing::info!(%order_id, "operator cancellation, releasing reservations");

        match self.drive(order_id).await {
            Err(e @ SagaError::CompensationFailed { .. }) => Err(e),
            Err(e) if e.is_order_outcome() => self.load_order(order_id).await,
            other => other,
        }
    }

    /// Resumes every saga that has not reached a terminal state, then drains
    /// the outbox. Safe to run repeatedly and concurrently with new orders.
    #[tracing::instrument(skip(self))]
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();

        for order_id in self.store.aggregates_with_event("OrderCreated").await? {
            let _guard = self.lock_order(order_id).await;
            let saga = self.load_saga(order_id).await?;
            if saga.state().is_terminal() {
                continue;
            }

            tracing::info!(%order_id, state = %saga.state(), "resuming saga");
            match self.drive(order_id).await {
                Ok(_) => report.resumed += 1,
                Err(e) if e.is_order_outcome() => report.resumed += 1,
                Err(e) => {
                    tracing::warn!(%order_id, error = %e, "saga could not be resumed");
                    report.failed += 1;
                }
            }
        }

        report.dispatched = self.drain_outbox().await?;
        tracing::info!(
            resumed = report.resumed,
            failed = report.failed,
            dispatched = report.dispatched,
            "recovery pass finished"
        );
        Ok(report)
    }

    /// Dispatches pending outbox entries of every order.
    ///
    /// Returns the number of entries dispatched. Orders whose head entry
    /// fails keep the rest of their entries queued.
    pub async fn drain_outbox(&self) -> Result<usize> {
        let mut dispatched = 0;
        for order_id in self.outbox.orders_with_pending().await? {
            let _guard = self.lock_order(order_id).await;
            match self.dispatch_pending(order_id).await {
                Ok(count) => dispatched += count,
                Err(e) => tracing::warn!(%order_id, error = %e, "outbox dispatch failed"),
            }
        }
        Ok(dispatched)
    }

    /// Resumes sagas whose driving task was dropped before the saga rested,
    /// such as a create-order request abandoned by its client.
    ///
    /// Orders currently locked by a live task are skipped. Returns the number
    /// of sagas driven to a resting state.
    pub async fn resume_stranded(&self) -> usize {
        let candidates: Vec<_> = self.in_flight.lock().await.iter().copied().collect();
        let mut resumed = 0;

        for order_id in candidates {
            let Ok(_guard) = self.order_lock(order_id).await.try_lock_owned() else {
                continue;
            };
            if !self.in_flight.lock().await.contains(&order_id) {
                continue;
            }
            match self.orders.get_order(order_id).await {
                Ok(Some(_)) => {}
                Ok(None) => {
                    // Dropped before the order was stored.
                    self.in_flight.lock().await.remove(&order_id);
                    continue;
                }
                Err(e) => {
                    tracing::warn!(%order_id, error = %e, "stranded order could not be loaded");
                    continue;
                }
            }

            tracing::info!(%order_id, "resuming stranded saga");
            match self.drive(order_id).await {
                Ok(_) => resumed += 1,
                Err(e) if e.is_order_outcome() => resumed += 1,
                Err(e) => tracing::warn!(%order_id, error = %e, "stranded saga could not be resumed"),
            }
        }
        resumed
    }

    async fn lock_order(&self, order_id: AggregateId) -> OwnedMutexGuard<()> {
        self.order_lock(order_id).await.lock_owned().await
    }

    async fn order_lock(&self, order_id: AggregateId) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        // An entry only the map references has neither a holder nor a waiter.
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks.entry(order_id).or_default().clone()
    }

    /// Runs the saga until it rests, tracking it as in flight meanwhile.
    ///
    /// The caller must hold the order lock. A saga that stops on an
    /// infrastructure error stays tracked so [`Self::resume_stranded`] retries it.
    async fn drive(&self, order_id: AggregateId) -> Result<Order> {
        self.in_flight.lock().await.insert(order_id);
        let result = self.run_steps(order_id).await;
        if result.as_ref().is_ok() || result.as_ref().is_err_and(|e| e.is_order_outcome()) {
            self.in_flight.lock().await.remove(&order_id);
        }
        result
    }

    /// Runs the saga from the order's persisted status until it rests.
    async fn run_steps(&self, order_id: AggregateId) -> Result<Order> {
        if self.load_saga(order_id).await?.id().is_none() {
            self.record(
                order_id,
                vec![SagaEvent::saga_started(saga_id(order_id), order_id, SAGA_TYPE)],
            )
            .await?;
        }

        loop {
            let order = self.load_order(order_id).await?;
            let saga = self.load_saga(order_id).await?;

            match order.status() {
                OrderStatus::Pending => self.price_pending(&order).await?,
                OrderStatus::Priced => self.reserve_stock(&order, &saga).await?,
                OrderStatus::Reserved => self.charge_payment(&order).await?,
                OrderStatus::ReservationFailed
                | OrderStatus::PaymentFailed
                | OrderStatus::Compensating => self.compensate(&order, &saga).await?,
                // Delivery was handed to the outbox; the order stays paid.
                OrderStatus::Paid if saga.state().is_terminal() => return Ok(order),
                OrderStatus::Paid => self.schedule_delivery(&order).await?,
                OrderStatus::DeliveryScheduled => {
                    self.transition(order_id, OrderTransition::Complete).await?;
                }
                OrderStatus::Completed | OrderStatus::Cancelled | OrderStatus::Failed => {
                    let saga = self.finish(&order, &saga).await?;
                    return self.outcome(order, &saga);
                }
            }
        }
    }

    async fn price_items(&self, items: &[LineItem]) -> Result<HashMap<GoodId, Money>> {
        let inventory = &self.inventory;
        let mut unit_prices = HashMap::with_capacity(items.len());

        for item in items {
            let good_id = &item.good_id;
            let good = self
                .retry
                .run(STEP_PRICE_ORDER, "inventory", move || {
                    inventory.get_good(good_id)
                })
                .await
                .map_err(|e| match e {
                    ServiceError::GoodNotFound(id) => SagaError::GoodNotFound(id),
                    other => SagaError::Dependency {
                        order_id: None,
                        step: STEP_PRICE_ORDER.to_string(),
                        reason: other.to_string(),
                    },
                })?;
            unit_prices.insert(good_id.clone(), good.price);
        }

        Ok(unit_prices)
    }

    /// Prices an order that was recorded without prices.
    async fn price_pending(&self, order: &Order) -> Result<()> {
        let order_id = order_key(order)?;
        match self.price_items(order.items()).await {
            Ok(unit_prices) => {
                self.transition(order_id, OrderTransition::Price { unit_prices })
                    .await?;
                self.record(
                    order_id,
                    vec![
                        SagaEvent::step_started(STEP_PRICE_ORDER),
                        SagaEvent::step_completed(STEP_PRICE_ORDER),
                    ],
                )
                .await?;
            }
            Err(e @ (SagaError::GoodNotFound(_) | SagaError::Dependency { .. })) => {
                let failure = SagaFailure::DependencyExhausted {
                    step: STEP_PRICE_ORDER.to_string(),
                    error: e.to_string(),
                };
                self.record(
                    order_id,
                    vec![SagaEvent::step_failed(STEP_PRICE_ORDER, e.to_string(), failure)],
                )
                .await?;
                self.transition(
                    order_id,
                    OrderTransition::Fail {
                        reason: e.to_string(),
                    },
                )
                .await?;
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    /// Checks availability of every item, then reserves them one by one.
    ///
    /// Each reservation intent is logged before the call so compensation can
    /// find it after a crash. Nothing is reserved unless every item was
    /// available when checked.
    async fn reserve_stock(&self, order: &Order, saga: &SagaInstance) -> Result<()> {
        let order_id = order_key(order)?;

        let reservation_started =
            saga.has_completed(STEP_CHECK_AVAILABILITY) || !saga.held_goods().is_empty();
        if !reservation_started {
            tracing::info!(%order_id, step = STEP_CHECK_AVAILABILITY, "saga step started");
            self.record(order_id, vec![SagaEvent::step_started(STEP_CHECK_AVAILABILITY)])
                .await?;

            if let Some(failure) = self.check_availability(order).await? {
                let reason = failure.order_reason();
                tracing::warn!(%order_id, %reason, "order rejected before reservation");
                let transition = match failure {
                    SagaFailure::DependencyExhausted { .. } => OrderTransition::Fail {
                        reason: reason.clone(),
                    },
                    _ => OrderTransition::Cancel {
                        reason: reason.clone(),
                    },
                };
                self.record(
                    order_id,
                    vec![SagaEvent::step_failed(STEP_CHECK_AVAILABILITY, reason, failure)],
                )
                .await?;
                self.transition(order_id, transition).await?;
                return Ok(());
            }

            self.record(
                order_id,
                vec![
                    SagaEvent::step_completed(STEP_CHECK_AVAILABILITY),
                    SagaEvent::step_started(STEP_RESERVE_STOCK),
                ],
            )
            .await?;
        }

        tracing::info!(%order_id, step = STEP_RESERVE_STOCK, "saga step started");
        let inventory = &self.inventory;
        for item in order.items() {
            if saga.is_reserved(&item.good_id) {
                continue;
            }
            let good_id = &item.good_id;
            let quantity = item.quantity;

            self.record(
                order_id,
                vec![SagaEvent::reservation_requested(good_id.clone(), quantity)],
            )
            .await?;

            let reserved = self
                .retry
                .run(STEP_RESERVE_STOCK, "inventory", move || {
                    inventory.reserve(good_id, quantity, order_id)
                })
                .await;

            if let Err(e) = reserved {
                let failure = failure_from(STEP_RESERVE_STOCK, e);
                let reason = failure.order_reason();
                tracing::warn!(%order_id, %good_id, %reason, "reservation failed");
                self.record(
                    order_id,
                    vec![SagaEvent::step_failed(STEP_RESERVE_STOCK, reason.clone(), failure)],
                )
                .await?;
                self.transition(order_id, OrderTransition::FailReservation { reason })
                    .await?;
                return Ok(());
            }

            self.record(
                order_id,
                vec![SagaEvent::item_reserved(good_id.clone(), quantity)],
            )
            .await?;
        }

        self.record(order_id, vec![SagaEvent::step_completed(STEP_RESERVE_STOCK)])
            .await?;
        let order = self
            .transition(order_id, OrderTransition::ReserveStock)
            .await?;
        self.announce(&order, OrderEventType::Created).await?;
        self.flush_outbox(order_id).await;
        tracing::info!(%order_id, "stock reserved");
        Ok(())
    }

    /// Returns the reason the order cannot be reserved, if any.
    async fn check_availability(&self, order: &Order) -> Result<Option<SagaFailure>> {
        let inventory = &self.inventory;
        for item in order.items() {
            let good_id = &item.good_id;
            let quantity = item.quantity;
            let available = self
                .retry
                .run(STEP_CHECK_AVAILABILITY, "inventory", move || {
                    inventory.check_availability(good_id, quantity)
                })
                .await;

            match available {
                Ok(true) => {}
                Ok(false) => {
                    return Ok(Some(SagaFailure::InsufficientStock {
                        good_id: good_id.clone(),
                        detail: format!("insufficient stock for {good_id}: requested {quantity}"),
                    }));
                }
                Err(e) => return Ok(Some(failure_from(STEP_CHECK_AVAILABILITY, e))),
            }
        }
        Ok(None)
    }

    async fn charge_payment(&self, order: &Order) -> Result<()> {
        let order_id = order_key(order)?;
        let amount = order.total_price();
        let method = self.payment_method;

        tracing::info!(%order_id, step = STEP_CHARGE_PAYMENT, "saga step started");
        self.record(order_id, vec![SagaEvent::step_started(STEP_CHARGE_PAYMENT)])
            .await?;

        let payment = &self.payment;
        let charged = self
            .retry
            .run(STEP_CHARGE_PAYMENT, "payment", move || {
                payment.charge(order_id, amount, method)
            })
            .await;

        let failure = match charged {
            Ok(ChargeOutcome::Completed { payment_id }) => {
                self.record(order_id, vec![SagaEvent::step_completed(STEP_CHARGE_PAYMENT)])
                    .await?;
                self.transition(
                    order_id,
                    OrderTransition::Pay {
                        payment_id: Some(payment_id),
                    },
                )
                .await?;
                tracing::info!(%order_id, %amount, "payment completed");
                return Ok(());
            }
            Ok(ChargeOutcome::Declined { reason }) => SagaFailure::PaymentDeclined { reason },
            Err(e) => SagaFailure::DependencyExhausted {
                step: STEP_CHARGE_PAYMENT.to_string(),
                error: e.to_string(),
            },
        };

        tracing::warn!(%order_id, detail = failure.detail(), "payment failed");
        let detail = failure.detail().to_string();
        let reason = failure.order_reason();
        self.record(
            order_id,
            vec![SagaEvent::step_failed(STEP_CHARGE_PAYMENT, detail, failure)],
        )
        .await?;
        self.transition(order_id, OrderTransition::FailPayment { reason })
            .await?;
        Ok(())
    }

    /// Releases every reservation the order may hold, then cancels it.
    ///
    /// A release that still fails after retries leaves the order failed and
    /// the goods recorded as unreleased on the saga log.
    async fn compensate(&self, order: &Order, saga: &SagaInstance) -> Result<()> {
        let order_id = order_key(order)?;
        let reason = saga
            .failure()
            .map(SagaFailure::order_reason)
            .or_else(|| order.status_reason().map(str::to_string))
            .unwrap_or_else(|| order.status().to_string());

        if saga.state() != SagaState::Compensating {
            tracing::info!(%order_id, %reason, "compensation started");
            self.record(
                order_id,
                vec![
                    SagaEvent::compensation_started(reason.clone()),
                    SagaEvent::step_started(STEP_RELEASE_STOCK),
                ],
            )
            .await?;
        }
        if order.status() == OrderStatus::PaymentFailed {
            self.transition(
                order_id,
                OrderTransition::StartCompensation {
                    reason: reason.clone(),
                },
            )
            .await?;
        }

        let inventory = &self.inventory;
        let mut unreleased = Vec::new();
        for good_id in saga.held_goods() {
            let good = &good_id;
            let released = self
                .retry
                .run(STEP_RELEASE_STOCK, "inventory", move || {
                    inventory.release(good, order_id)
                })
                .await;

            match released {
                Ok(()) => {
                    self.record(
                        order_id,
                        vec![SagaEvent::compensation_step_completed(good_id.clone())],
                    )
                    .await?;
                }
                Err(e) => {
                    tracing::error!(%order_id, %good_id, error = %e, "failed to release reservation");
                    self.record(
                        order_id,
                        vec![SagaEvent::compensation_step_failed(good_id.clone(), e.to_string())],
                    )
                    .await?;
                    unreleased.push(good_id);
                }
            }
        }

        if unreleased.is_empty() {
            self.record(order_id, vec![SagaEvent::step_completed(STEP_RELEASE_STOCK)])
                .await?;
            self.transition(order_id, OrderTransition::Cancel { reason })
                .await?;
            tracing::info!(%order_id, "reservations released, order cancelled");
        } else {
            metrics::counter!("saga_compensation_failures_total").increment(1);
            let goods = unreleased
                .iter()
                .map(GoodId::as_str)
                .collect::<Vec<_>>()
                .join(", ");
            tracing::error!(
                %order_id,
                unreleased = %goods,
                "compensation failed, stock needs manual reconciliation"
            );
            self.transition(
                order_id,
                OrderTransition::Fail {
                    reason: format!("compensation failed, unreleased goods: {goods}"),
                },
            )
            .await?;
        }
        Ok(())
    }

    /// Books delivery for a paid order.
    ///
    /// Failure never rolls back payment: a retry is queued in the outbox and
    /// the saga rests with the order paid.
    async fn schedule_delivery(&self, order: &Order) -> Result<()> {
        let order_id = order_key(order)?;
        let Some(address) = order.address() else {
            self.transition(order_id, OrderTransition::Complete).await?;
            return Ok(());
        };

        tracing::info!(%order_id, step = STEP_SCHEDULE_DELIVERY, "saga step started");
        self.record(order_id, vec![SagaEvent::step_started(STEP_SCHEDULE_DELIVERY)])
            .await?;

        let delivery = &self.delivery;
        let scheduled = self
            .retry
            .run(STEP_SCHEDULE_DELIVERY, "delivery", move || {
                delivery.schedule(order_id, address)
            })
            .await;

        match scheduled {
            Ok(delivery_id) => {
                self.record(
                    order_id,
                    vec![SagaEvent::step_completed(STEP_SCHEDULE_DELIVERY)],
                )
                .await?;
                self.transition(
                    order_id,
                    OrderTransition::ScheduleDelivery {
                        delivery_id: Some(delivery_id),
                    },
                )
                .await?;
            }
            Err(e) => {
                tracing::warn!(%order_id, error = %e, "delivery scheduling failed, retry queued");
                let seq = self
                    .outbox
                    .enqueue(
                        order_id,
                        OutboxTask::ScheduleDelivery {
                            address: address.to_string(),
                        },
                    )
                    .await?;
                self.record(
                    order_id,
                    vec![
                        SagaEvent::delivery_deferred(e.to_string(), seq),
                        SagaEvent::saga_completed(OrderStatus::Paid),
                    ],
                )
                .await?;
                metrics::counter!("saga_completed").increment(1);
            }
        }
        Ok(())
    }

    /// Closes the saga of an order that reached a terminal status.
    ///
    /// Lifecycle messages are enqueued once; the saga terminal event is
    /// recorded unless already present.
    async fn finish(&self, order: &Order, saga: &SagaInstance) -> Result<SagaInstance> {
        let order_id = order_key(order)?;

        self.announce(order, OrderEventType::Created).await?;
        let terminal = match order.status() {
            OrderStatus::Completed => OrderEventType::Completed,
            OrderStatus::Cancelled => saga
                .failure()
                .map_or(OrderEventType::Cancelled, SagaFailure::terminal_event),
            _ => OrderEventType::Cancelled,
        };
        self.announce(order, terminal).await?;

        let saga = if saga.state().is_terminal() {
            saga.clone()
        } else {
            let event = match order.status() {
                OrderStatus::Completed => {
                    metrics::counter!("saga_completed").increment(1);
                    SagaEvent::saga_completed(OrderStatus::Completed)
                }
                status => {
                    if status == OrderStatus::Cancelled {
                        metrics::counter!("saga_cancelled").increment(1);
                    } else {
                        metrics::counter!("saga_failed").increment(1);
                    }
                    SagaEvent::saga_failed(order.status_reason().unwrap_or(status.as_str()))
                }
            };
            let saga = self.record(order_id, vec![event]).await?;
            tracing::info!(%order_id, status = %order.status(), "saga finished");
            saga
        };

        self.flush_outbox(order_id).await;
        Ok(saga)
    }

    /// Maps a rested order to the caller-facing result.
    fn outcome(&self, order: Order, saga: &SagaInstance) -> Result<Order> {
        let order_id = order_key(&order)?;
        match order.status() {
            OrderStatus::Failed if !saga.held_goods().is_empty() => {
                Err(SagaError::CompensationFailed {
                    order_id,
                    unreleased: saga.held_goods(),
                })
            }
            OrderStatus::Cancelled | OrderStatus::Failed => match saga.failure() {
                Some(SagaFailure::InsufficientStock { detail, .. }) => {
                    Err(SagaError::InsufficientStock {
                        order_id,
                        reason: detail.clone(),
                    })
                }
                Some(SagaFailure::PaymentDeclined { reason }) => Err(SagaError::PaymentDeclined {
                    order_id,
                    reason: reason.clone(),
                }),
                Some(SagaFailure::DependencyExhausted { step, error }) => {
                    Err(SagaError::Dependency {
                        order_id: Some(order_id),
                        step: step.clone(),
                        reason: error.clone(),
                    })
                }
                Some(SagaFailure::CancelledByRequest { .. }) | None => Ok(order),
            },
            _ => Ok(order),
        }
    }

    async fn record_cancellation(&self, order_id: AggregateId, reason: String) -> Result<()> {
        self.record(
            order_id,
            vec![SagaEvent::step_failed(
                STEP_CANCEL_ORDER,
                reason.clone(),
                SagaFailure::CancelledByRequest { reason },
            )],
        )
        .await?;
        Ok(())
    }

    /// Enqueues a lifecycle message unless one of that type already exists.
    async fn announce(&self, order: &Order, event_type: OrderEventType) -> Result<()> {
        if let Some(message) = OrderMessage::from_order(order, event_type) {
            self.outbox.enqueue_message_once(message).await?;
        }
        Ok(())
    }

    /// Dispatches what can be dispatched now; the relay retries the rest.
    async fn flush_outbox(&self, order_id: AggregateId) {
        if let Err(e) = self.dispatch_pending(order_id).await {
            tracing::warn!(%order_id, error = %e, "outbox dispatch deferred to relay");
        }
    }

    /// Dispatches one order's pending entries in sequence, stopping at the
    /// first failure. The caller must hold the order lock.
    async fn dispatch_pending(&self, order_id: AggregateId) -> Result<usize> {
        let mut dispatched = 0;

        loop {
            let outbox = self.outbox.load(order_id).await?;
            let Some(entry) = outbox.next_pending().cloned() else {
                break;
            };

            let outcome = match &entry.task {
                OutboxTask::Publish { message } => {
                    let outcome = self
                        .retry
                        .attempt("publisher", self.publisher.publish(message))
                        .await;
                    if matches!(outcome, StepOutcome::Success(())) {
                        metrics::counter!("outbox_published_total").increment(1);
                        tracing::debug!(%order_id, event_type = %message.event_type, "message published");
                    } else {
                        metrics::counter!("outbox_publish_failures_total").increment(1);
                    }
                    outcome
                }
                OutboxTask::ScheduleDelivery { address } => {
                    self.retry_delivery(order_id, address).await?
                }
            };

            match outcome {
                StepOutcome::Success(()) => {
                    self.outbox.mark_dispatched(order_id, entry.seq).await?;
                    dispatched += 1;
                }
                StepOutcome::RetryableFailure(e) | StepOutcome::TerminalFailure(e) => {
                    tracing::warn!(%order_id, seq = entry.seq, error = %e, "outbox entry not dispatched");
                    self.outbox
                        .record_failure(order_id, entry.seq, e.to_string())
                        .await?;
                    break;
                }
            }
        }

        Ok(dispatched)
    }

    /// Retries a deferred delivery booking and completes the order on success.
    async fn retry_delivery(&self, order_id: AggregateId, address: &str) -> Result<StepOutcome<()>> {
        let order = self.load_order(order_id).await?;
        match order.status() {
            OrderStatus::Paid => {
                metrics::counter!("delivery_retries_total").increment(1);
                let delivery_id = match self
                    .retry
                    .attempt("delivery", self.delivery.schedule(order_id, address))
                    .await
                {
                    StepOutcome::Success(id) => id,
                    StepOutcome::RetryableFailure(e) => return Ok(StepOutcome::RetryableFailure(e)),
                    StepOutcome::TerminalFailure(e) => return Ok(StepOutcome::TerminalFailure(e)),
                };
                self.record(
                    order_id,
                    vec![SagaEvent::step_completed(STEP_SCHEDULE_DELIVERY)],
                )
                .await?;
                self.transition(
                    order_id,
                    OrderTransition::ScheduleDelivery {
                        delivery_id: Some(delivery_id),
                    },
                )
                .await?;
                self.complete_after_delivery(order_id).await?;
                tracing::info!(%order_id, "deferred delivery scheduled");
            }
            OrderStatus::DeliveryScheduled => self.complete_after_delivery(order_id).await?,
            // Settled some other way in the meantime.
            _ => {}
        }
        Ok(StepOutcome::Success(()))
    }

    async fn complete_after_delivery(&self, order_id: AggregateId) -> Result<()> {
        let order = self
            .transition(order_id, OrderTransition::Complete)
            .await?;
        self.announce(&order, OrderEventType::Completed).await
    }

    /// Appends events to the order's saga log and returns the updated log.
    async fn record(&self, order_id: AggregateId, events: Vec<SagaEvent>) -> Result<SagaInstance> {
        let result = self
            .sagas
            .execute(saga_id(order_id), |_| Ok::<_, DomainError>(events))
            .await?;
        Ok(result.aggregate)
    }

    async fn transition(&self, order_id: AggregateId, transition: OrderTransition) -> Result<Order> {
        Ok(self.orders.transition(order_id, transition).await?.aggregate)
    }

    async fn load_order(&self, order_id: AggregateId) -> Result<Order> {
        self.orders
            .get_order(order_id)
            .await?
            .ok_or(SagaError::OrderNotFound(order_id))
    }

    async fn load_saga(&self, order_id: AggregateId) -> Result<SagaInstance> {
        Ok(self.sagas.load(saga_id(order_id)).await?)
    }
}

fn order_key(order: &Order) -> Result<AggregateId> {
    order
        .id()
        .ok_or_else(|| SagaError::Validation("order has no id".to_string()))
}

/// Classifies a failed inventory call of the reservation phase.
fn failure_from(step: &str, error: ServiceError) -> SagaFailure {
    match error {
        ServiceError::InsufficientStock { ref good_id, .. }
        | ServiceError::GoodNotFound(ref good_id) => SagaFailure::InsufficientStock {
            good_id: good_id.clone(),
            detail: error.to_string(),
        },
        other => SagaFailure::DependencyExhausted {
            step: step.to_string(),
            error: other.to_string(),
        },
    }
}
