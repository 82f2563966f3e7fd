//! API error types with HTTP response mapping.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use common::AggregateId;
use domain::OrderError;
use event_store::EventStoreError;
use projections::ProjectionError;
use saga::SagaError;
use thiserror::Error;

/// API-level error type that maps to HTTP responses.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Saga(#[from] SagaError),

    #[error(transparent)]
    Projection(#[from] ProjectionError),

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl ApiError {
    /// HTTP status the error is reported with.
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Saga(err) => saga_status(err),
            ApiError::Projection(_) | ApiError::Task(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Order the failure is about, when the order was persisted.
    fn order_id(&self) -> Option<AggregateId> {
        match self {
            ApiError::Saga(
                SagaError::InsufficientStock { order_id, .. }
                | SagaError::PaymentDeclined { order_id, .. }
                | SagaError::CompensationFailed { order_id, .. },
            ) => Some(*order_id),
            ApiError::Saga(SagaError::Dependency { order_id, .. }) => *order_id,
            _ => None,
        }
    }
}

fn saga_status(err: &SagaError) -> StatusCode {
    match err {
        SagaError::Validation(_) => StatusCode::BAD_REQUEST,
        SagaError::GoodNotFound(_) | SagaError::OrderNotFound(_) => StatusCode::NOT_FOUND,
        SagaError::InsufficientStock { .. } => StatusCode::CONFLICT,
        SagaError::PaymentDeclined { .. } => StatusCode::PAYMENT_REQUIRED,
        SagaError::Dependency { .. } => StatusCode::SERVICE_UNAVAILABLE,
        SagaError::CompensationFailed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        SagaError::Order(e) if e.is_validation() => StatusCode::BAD_REQUEST,
        SagaError::Order(OrderError::InvalidStateTransition { .. }) => StatusCode::CONFLICT,
        SagaError::Order(OrderError::NotCreated) => StatusCode::NOT_FOUND,
        SagaError::EventStore(EventStoreError::ConcurrencyConflict { .. }) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, %status, "request failed");
        }

        let mut body = serde_json::json!({ "error": self.to_string() });
        if let Some(order_id) = self.order_id() {
            body["order_id"] = serde_json::json!(order_id);
        }
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::{GoodId, OrderStatus};

    #[test]
    fn test_saga_errors_map_to_statuses() {
        let order_id = AggregateId::new();
        let cases = [
            (SagaError::Validation("no items".into()), StatusCode::BAD_REQUEST),
            (SagaError::GoodNotFound(GoodId::new("nope")), StatusCode::NOT_FOUND),
            (SagaError::OrderNotFound(order_id), StatusCode::NOT_FOUND),
            (
                SagaError::InsufficientStock {
                    order_id,
                    reason: "out".into(),
                },
                StatusCode::CONFLICT,
            ),
            (
                SagaError::PaymentDeclined {
                    order_id,
                    reason: "declined".into(),
                },
                StatusCode::PAYMENT_REQUIRED,
            ),
            (
                SagaError::Dependency {
                    order_id: None,
                    step: "price_items".into(),
                    reason: "down".into(),
                },
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                SagaError::CompensationFailed {
                    order_id,
                    unreleased: vec![GoodId::new("widget")],
                },
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                SagaError::Order(OrderError::InvalidStateTransition {
                    from: OrderStatus::Completed,
                    to: OrderStatus::Cancelled,
                }),
                StatusCode::CONFLICT,
            ),
            (
                SagaError::Order(OrderError::StatusNotRequestable(OrderStatus::Priced)),
                StatusCode::BAD_REQUEST,
            ),
        ];

        for (err, expected) in cases {
            assert_eq!(ApiError::from(err).status(), expected);
        }
    }

    #[test]
    fn test_outcome_errors_carry_order_id() {
        let order_id = AggregateId::new();
        let err = ApiError::from(SagaError::PaymentDeclined {
            order_id,
            reason: "declined".into(),
        });
        assert_eq!(err.order_id(), Some(order_id));
        assert_eq!(ApiError::BadRequest("x".into()).order_id(), None);
    }
}
