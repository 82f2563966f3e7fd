//! Per-user order listing served from the read model.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use event_store::EventStore;

use crate::error::ApiError;
use crate::routes::orders::{OrderResponse, parse_user_id};
use crate::state::AppState;

/// GET /users/{id}/orders — the user's orders, newest first.
#[tracing::instrument(skip(state))]
pub async fn list_orders<S: EventStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<OrderResponse>>, ApiError> {
    let user_id = parse_user_id(&id)?;
    state.catch_up().await?;

    let orders = state.user_orders.list_user_orders(user_id).await;
    Ok(Json(orders.iter().map(OrderResponse::from).collect()))
}
