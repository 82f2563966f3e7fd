//! Saga error types.

use common::AggregateId;
use domain::{DomainError, GoodId, OrderError};
use event_store::EventStoreError;
use thiserror::Error;

/// Failure reported by an external service client.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    /// The service could not be reached or answered with a transient error.
    #[error("{service} unavailable: {reason}")]
    Unavailable {
        service: &'static str,
        reason: String,
    },

    /// The call did not finish before its deadline.
    #[error("{service} call timed out")]
    Timeout { service: &'static str },

    /// Not enough stock to reserve.
    #[error("Insufficient stock for {good_id}: requested {requested}, available {available}")]
    InsufficientStock {
        good_id: GoodId,
        requested: u32,
        available: u32,
    },

    /// The good does not exist in the catalog.
    #[error("Good not found: {0}")]
    GoodNotFound(GoodId),
}

impl ServiceError {
    /// Builds an `Unavailable` error.
    pub fn unavailable(service: &'static str, reason: impl Into<String>) -> Self {
        ServiceError::Unavailable {
            service,
            reason: reason.into(),
        }
    }

    /// Returns true if the call may succeed when repeated.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ServiceError::Unavailable { .. } | ServiceError::Timeout { .. }
        )
    }
}

/// Errors that can occur during saga operations.
#[derive(Debug, Error)]
pub enum SagaError {
    /// The request was malformed. Nothing was recorded.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A requested good does not exist. Nothing was recorded.
    #[error("Good not found: {0}")]
    GoodNotFound(GoodId),

    /// Order not found.
    #[error("Order not found: {0}")]
    OrderNotFound(AggregateId),

    /// Stock ran out; the order was cancelled without holding any reservation.
    #[error("Insufficient stock for order {order_id}: {reason}")]
    InsufficientStock { order_id: AggregateId, reason: String },

    /// Payment was declined; reservations were released and the order cancelled.
    #[error("Payment declined for order {order_id}: {reason}")]
    PaymentDeclined { order_id: AggregateId, reason: String },

    /// A dependency stayed unavailable after all retries.
    #[error("Dependency failure in step '{step}': {reason}")]
    Dependency {
        order_id: Option<AggregateId>,
        step: String,
        reason: String,
    },

    /// Releasing reservations failed. Stock is held for a dead order and
    /// needs manual reconciliation.
    #[error("Compensation failed for order {order_id}; unreleased goods: {unreleased:?}")]
    CompensationFailed {
        order_id: AggregateId,
        unreleased: Vec<GoodId>,
    },

    /// The order rejected the requested transition.
    #[error("Order error: {0}")]
    Order(#[from] OrderError),

    /// Domain error.
    #[error("Domain error: {0}")]
    Domain(DomainError),

    /// Event store error.
    #[error("Event store error: {0}")]
    EventStore(#[from] EventStoreError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<DomainError> for SagaError {
    fn from(e: DomainError) -> Self {
        match e {
            DomainError::Order(e) => SagaError::Order(e),
            DomainError::OrderNotFound(id) => SagaError::OrderNotFound(id),
            DomainError::EventStore(e) => SagaError::EventStore(e),
            other => SagaError::Domain(other),
        }
    }
}

impl SagaError {
    /// Returns true if the error reports how a persisted order ended rather
    /// than a failure to process it.
    pub fn is_order_outcome(&self) -> bool {
        matches!(
            self,
            SagaError::InsufficientStock { .. }
                | SagaError::PaymentDeclined { .. }
                | SagaError::CompensationFailed { .. }
                | SagaError::Dependency {
                    order_id: Some(_),
                    ..
                }
        )
    }
}

/// Errors raised while consuming order lifecycle messages.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NotificationError {
    #[error("Unknown event type: {0}")]
    UnknownEventType(String),

    #[error("Malformed message: {0}")]
    Malformed(String),
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;
