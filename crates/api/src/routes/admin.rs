//! Operator endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use event_store::EventStore;
use serde::Serialize;

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct RecoveryResponse {
    pub resumed: usize,
    pub failed: usize,
    pub dispatched: usize,
}

#[derive(Debug, Serialize)]
pub struct DrainResponse {
    pub dispatched: usize,
}

/// POST /admin/recover — resume interrupted sagas and flush the outbox.
#[tracing::instrument(skip(state))]
pub async fn recover<S: EventStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
) -> Result<Json<RecoveryResponse>, ApiError> {
    let report = state.coordinator.recover().await?;
    Ok(Json(RecoveryResponse {
        resumed: report.resumed,
        failed: report.failed,
        dispatched: report.dispatched,
    }))
}

/// POST /admin/outbox/drain — dispatch pending outbox entries now.
#[tracing::instrument(skip(state))]
pub async fn drain_outbox<S: EventStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
) -> Result<Json<DrainResponse>, ApiError> {
    let dispatched = state.coordinator.drain_outbox().await?;
    Ok(Json(DrainResponse { dispatched }))
}
