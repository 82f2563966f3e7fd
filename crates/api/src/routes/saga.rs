//! Saga inspection endpoint.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use domain::OrderStatus;
use event_store::EventStore;
use saga::{SagaState, saga_id};
use serde::Serialize;

use crate::error::ApiError;
use crate::parse_id;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct SagaStatusResponse {
    pub saga_id: String,
    pub order_id: String,
    pub saga_type: String,
    pub state: SagaState,
    pub current_step: Option<String>,
    pub completed_steps: Vec<String>,
    pub reserved_goods: Vec<String>,
    pub released_goods: Vec<String>,
    /// Goods whose release failed and need manual reconciliation.
    pub release_failures: Vec<String>,
    pub failure_reason: Option<String>,
    pub final_status: Option<OrderStatus>,
    /// Outbox sequence of a queued delivery retry.
    pub deferred_delivery: Option<u64>,
}

fn names<T: ToString>(items: &[T]) -> Vec<String> {
    items.iter().map(ToString::to_string).collect()
}

/// GET /orders/{id}/saga — step log of the order's fulfillment saga.
#[tracing::instrument(skip(state))]
pub async fn status<S: EventStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
) -> Result<Json<SagaStatusResponse>, ApiError> {
    let order_id = parse_id(&id)?;
    let saga = state
        .coordinator
        .get_saga(order_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("No saga for order {id}")))?;

    Ok(Json(SagaStatusResponse {
        saga_id: saga_id(order_id).to_string(),
        order_id: order_id.to_string(),
        saga_type: saga.saga_type().to_string(),
        state: saga.state(),
        current_step: saga.current_step().map(String::from),
        completed_steps: saga.completed_steps().to_vec(),
        reserved_goods: names(saga.reserved_goods()),
        released_goods: names(saga.released_goods()),
        release_failures: names(saga.release_failures()),
        failure_reason: saga.failure_reason().map(String::from),
        final_status: saga.final_status(),
        deferred_delivery: saga.deferred_delivery(),
    }))
}
