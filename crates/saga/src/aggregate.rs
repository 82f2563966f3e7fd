//! Saga instance aggregate.

use common::AggregateId;
use domain::{Aggregate, DomainError, GoodId, OrderStatus};
use event_store::Version;
use serde::{Deserialize, Serialize};

use crate::events::{SagaEvent, SagaFailure};
use crate::state::SagaState;

/// An event-sourced saga instance: the durable step log of one order.
///
/// Reservation intents are recorded before the inventory call is made, so
/// after a crash every good that may be held is known and can be released.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SagaInstance {
    id: Option<AggregateId>,
    version: Version,
    saga_type: String,
    order_id: Option<AggregateId>,
    state: SagaState,
    current_step: Option<String>,
    completed_steps: Vec<String>,
    /// Goods with a logged reservation intent, in request order.
    requested: Vec<(GoodId, u32)>,
    /// Goods the inventory service confirmed.
    reserved: Vec<GoodId>,
    /// Goods released during compensation.
    released: Vec<GoodId>,
    /// Goods whose release failed most recently.
    release_failures: Vec<GoodId>,
    failure: Option<SagaFailure>,
    failure_reason: Option<String>,
    /// Outbox sequence of a queued delivery retry.
    deferred_delivery: Option<u64>,
    final_status: Option<OrderStatus>,
}

impl Aggregate for SagaInstance {
    type Event = SagaEvent;
    type Error = DomainError;

    fn aggregate_type() -> &'static str {
        "OrderFulfillmentSaga"
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
        match event {
            SagaEvent::SagaStarted(data) => {
                self.id = Some(data.saga_id);
                self.order_id = Some(data.order_id);
                self.saga_type = data.saga_type;
                self.state = SagaState::Running;
            }
            SagaEvent::StepStarted(data) => {
                self.current_step = Some(data.step_name);
            }
            SagaEvent::StepCompleted(data) => {
                self.current_step = None;
                self.completed_steps.push(data.step_name);
            }
            SagaEvent::StepFailed(data) => {
                self.current_step = None;
                self.failure_reason = Some(data.error);
                self.failure = Some(data.failure);
            }
            SagaEvent::ReservationRequested(data) => {
                if !self.requested.iter().any(|(g, _)| *g == data.good_id) {
                    self.requested.push((data.good_id, data.quantity));
                }
            }
            SagaEvent::ItemReserved(data) => {
                if !self.reserved.contains(&data.good_id) {
                    self.reserved.push(data.good_id);
                }
            }
            SagaEvent::DeliveryDeferred(data) => {
                self.deferred_delivery = Some(data.outbox_seq);
            }
            SagaEvent::CompensationStarted(_) => {
                self.state = SagaState::Compensating;
                self.release_failures.clear();
            }
            SagaEvent::CompensationStepCompleted(data) => {
                self.release_failures.retain(|g| *g != data.good_id);
                if !self.released.contains(&data.good_id) {
                    self.released.push(data.good_id);
                }
            }
            SagaEvent::CompensationStepFailed(data) => {
                if !self.release_failures.contains(&data.good_id) {
                    self.release_failures.push(data.good_id);
                }
            }
            SagaEvent::SagaCompleted(data) => {
                self.state = SagaState::Completed;
                self.final_status = Some(data.order_status);
            }
            SagaEvent::SagaFailed(data) => {
                self.state = SagaState::Failed;
                self.failure_reason = Some(data.reason);
            }
        }
    }
}

// Query methods
impl SagaInstance {
    pub fn state(&self) -> SagaState {
        self.state
    }

    /// Returns the order ID this saga is fulfilling.
    pub fn order_id(&self) -> Option<AggregateId> {
        self.order_id
    }

    pub fn saga_type(&self) -> &str {
        &self.saga_type
    }

    /// Returns the step that started but has not finished, if any.
    pub fn current_step(&self) -> Option<&str> {
        self.current_step.as_deref()
    }

    pub fn completed_steps(&self) -> &[String] {
        &self.completed_steps
    }

    /// Returns true if the step finished successfully at some point.
    pub fn has_completed(&self, step: &str) -> bool {
        self.completed_steps.iter().any(|s| s == step)
    }

    /// Returns the goods confirmed by the inventory service.
    pub fn reserved_goods(&self) -> &[GoodId] {
        &self.reserved
    }

    /// Returns true if the inventory service confirmed the good.
    pub fn is_reserved(&self, good_id: &GoodId) -> bool {
        self.reserved.contains(good_id)
    }

    /// Goods that may still be held: requested and not yet released.
    pub fn held_goods(&self) -> Vec<GoodId> {
        self.requested
            .iter()
            .map(|(g, _)| g)
            .filter(|g| !self.released.contains(g))
            .cloned()
            .collect()
    }

    pub fn released_goods(&self) -> &[GoodId] {
        &self.released
    }

    /// Goods whose last release attempt failed.
    pub fn release_failures(&self) -> &[GoodId] {
        &self.release_failures
    }

    pub fn failure(&self) -> Option<&SagaFailure> {
        self.failure.as_ref()
    }

    pub fn failure_reason(&self) -> Option<&str> {
        self.failure_reason.as_deref()
    }

    /// Returns the outbox sequence of a queued delivery retry.
    pub fn deferred_delivery(&self) -> Option<u64> {
        self.deferred_delivery
    }

    /// Order status recorded when the forward flow finished.
    pub fn final_status(&self) -> Option<OrderStatus> {
        self.final_status
    }
}
