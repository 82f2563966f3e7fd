//! Saga step log events.

use chrono::{DateTime, Utc};
use common::AggregateId;
use domain::{DomainEvent, GoodId, OrderStatus};
use serde::{Deserialize, Serialize};

use crate::order_fulfillment::{REASON_PAYMENT_FAILED, STEP_CHARGE_PAYMENT};
use crate::services::OrderEventType;

/// Why a saga left its forward path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SagaFailure {
    /// A good could not be reserved in full.
    InsufficientStock { good_id: GoodId, detail: String },

    /// The payment service refused the charge.
    PaymentDeclined { reason: String },

    /// A dependency stayed unavailable through every retry.
    DependencyExhausted { step: String, error: String },

    /// An operator cancelled the order.
    CancelledByRequest { reason: String },
}

impl SagaFailure {
    /// Status reason recorded on the order.
    pub fn order_reason(&self) -> String {
        match self {
            SagaFailure::InsufficientStock { detail, .. } => detail.clone(),
            SagaFailure::PaymentDeclined { .. } => REASON_PAYMENT_FAILED.to_string(),
            SagaFailure::DependencyExhausted { step, .. } if step == STEP_CHARGE_PAYMENT => {
                REASON_PAYMENT_FAILED.to_string()
            }
            SagaFailure::DependencyExhausted { step, error } => {
                format!("{step} unavailable: {error}")
            }
            SagaFailure::CancelledByRequest { reason } => reason.clone(),
        }
    }

    /// The underlying cause as reported by the failing party.
    pub fn detail(&self) -> &str {
        match self {
            SagaFailure::InsufficientStock { detail, .. } => detail,
            SagaFailure::PaymentDeclined { reason } => reason,
            SagaFailure::DependencyExhausted { error, .. } => error,
            SagaFailure::CancelledByRequest { reason } => reason,
        }
    }

    /// Terminal lifecycle event announced when the order is rolled back.
    pub fn terminal_event(&self) -> OrderEventType {
        match self {
            SagaFailure::PaymentDeclined { .. } => OrderEventType::PaymentFailed,
            SagaFailure::DependencyExhausted { step, .. } if step == STEP_CHARGE_PAYMENT => {
                OrderEventType::PaymentFailed
            }
            _ => OrderEventType::Cancelled,
        }
    }
}

/// Events recorded in a saga's durable step log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum SagaEvent {
    /// Saga execution started.
    SagaStarted(SagaStartedData),

    /// A saga step started execution.
    StepStarted(StepData),

    /// A saga step completed successfully.
    StepCompleted(StepData),

    /// A saga step failed and the saga will roll back.
    StepFailed(StepFailedData),

    /// Intent to reserve a good, written before the reserve call is made.
    ReservationRequested(ReservationData),

    /// The inventory service confirmed a reservation.
    ItemReserved(ReservationData),

    /// Delivery could not be booked; a retry was queued in the outbox.
    DeliveryDeferred(DeliveryDeferredData),

    /// Compensation started after a step failure.
    CompensationStarted(CompensationData),

    /// A reservation was released.
    CompensationStepCompleted(ReleaseData),

    /// Releasing a reservation failed after retries.
    CompensationStepFailed(ReleaseFailedData),

    /// The forward flow finished.
    SagaCompleted(SagaCompletedData),

    /// The order was rolled back or abandoned.
    SagaFailed(SagaFailedData),
}

impl DomainEvent for SagaEvent {
    fn event_type(&self) -> &'static str {
        match self {
            SagaEvent::SagaStarted(_) => "SagaStarted",
            SagaEvent::StepStarted(_) => "StepStarted",
            SagaEvent::StepCompleted(_) => "StepCompleted",
            SagaEvent::StepFailed(_) => "StepFailed",
            SagaEvent::ReservationRequested(_) => "ReservationRequested",
            SagaEvent::ItemReserved(_) => "ItemReserved",
            SagaEvent::DeliveryDeferred(_) => "DeliveryDeferred",
            SagaEvent::CompensationStarted(_) => "CompensationStarted",
            SagaEvent::CompensationStepCompleted(_) => "CompensationStepCompleted",
            SagaEvent::CompensationStepFailed(_) => "CompensationStepFailed",
            SagaEvent::SagaCompleted(_) => "SagaCompleted",
            SagaEvent::SagaFailed(_) => "SagaFailed",
        }
    }
}

/// Data for SagaStarted event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaStartedData {
    pub saga_id: AggregateId,
    /// The order being fulfilled.
    pub order_id: AggregateId,
    pub saga_type: String,
    pub started_at: DateTime<Utc>,
}

/// Data for step started/completed events (just the step name).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepData {
    pub step_name: String,
}

/// Data for StepFailed event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepFailedData {
    pub step_name: String,
    pub error: String,
    pub failure: SagaFailure,
}

/// Data for reservation intent and confirmation events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReservationData {
    pub good_id: GoodId,
    pub quantity: u32,
}

/// Data for DeliveryDeferred event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryDeferredData {
    pub error: String,
    /// Outbox sequence number of the queued retry.
    pub outbox_seq: u64,
}

/// Data for CompensationStarted event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompensationData {
    pub reason: String,
}

/// Data for CompensationStepCompleted event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseData {
    pub good_id: GoodId,
}

/// Data for CompensationStepFailed event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseFailedData {
    pub good_id: GoodId,
    pub error: String,
}

/// Data for SagaCompleted event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaCompletedData {
    /// Order status when the forward flow ended.
    pub order_status: OrderStatus,
    pub completed_at: DateTime<Utc>,
}

/// Data for SagaFailed event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaFailedData {
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

// Convenience constructors for events
impl SagaEvent {
    pub fn saga_started(saga_id: AggregateId, order_id: AggregateId, saga_type: &str) -> Self {
        SagaEvent::SagaStarted(SagaStartedData {
            saga_id,
            order_id,
            saga_type: saga_type.to_string(),
            started_at: Utc::now(),
        })
    }

    pub fn step_started(step_name: &str) -> Self {
        SagaEvent::StepStarted(StepData {
            step_name: step_name.to_string(),
        })
    }

    pub fn step_completed(step_name: &str) -> Self {
        SagaEvent::StepCompleted(StepData {
            step_name: step_name.to_string(),
        })
    }

    pub fn step_failed(step_name: &str, error: impl Into<String>, failure: SagaFailure) -> Self {
        SagaEvent::StepFailed(StepFailedData {
            step_name: step_name.to_string(),
            error: error.into(),
            failure,
        })
    }

    pub fn reservation_requested(good_id: GoodId, quantity: u32) -> Self {
        SagaEvent::ReservationRequested(ReservationData { good_id, quantity })
    }

    pub fn item_reserved(good_id: GoodId, quantity: u32) -> Self {
        SagaEvent::ItemReserved(ReservationData { good_id, quantity })
    }

    pub fn delivery_deferred(error: impl Into<String>, outbox_seq: u64) -> Self {
        SagaEvent::DeliveryDeferred(DeliveryDeferredData {
            error: error.into(),
            outbox_seq,
        })
    }

    pub fn compensation_started(reason: impl Into<String>) -> Self {
        SagaEvent::CompensationStarted(CompensationData {
            reason: reason.into(),
        })
    }

    pub fn compensation_step_completed(good_id: GoodId) -> Self {
        SagaEvent::CompensationStepCompleted(ReleaseData { good_id })
    }

    pub fn compensation_step_failed(good_id: GoodId, error: impl Into<String>) -> Self {
        SagaEvent::CompensationStepFailed(ReleaseFailedData {
            good_id,
            error: error.into(),
        })
    }

    pub fn saga_completed(order_status: OrderStatus) -> Self {
        SagaEvent::SagaCompleted(SagaCompletedData {
            order_status,
            completed_at: Utc::now(),
        })
    }

    pub fn saga_failed(reason: impl Into<String>) -> Self {
        SagaEvent::SagaFailed(SagaFailedData {
            reason: reason.into(),
            failed_at: Utc::now(),
        })
    }
}
