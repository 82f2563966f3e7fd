//! Order endpoints: create (runs the saga), get, operator status update.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use chrono::{DateTime, Utc};
use domain::{Aggregate, Order, OrderLine, OrderStatus, UserId};
use event_store::EventStore;
use saga::CreateOrderRequest;
use serde::{Deserialize, Serialize};
use tracing::Instrument;

use crate::error::ApiError;
use crate::parse_id;
use crate::state::AppState;

/// Header carrying a client-chosen idempotency key.
pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

// -- Request types --

#[derive(Deserialize)]
pub struct CreateOrderBody {
    pub user_id: String,
    pub items: Vec<OrderItemBody>,
    pub address: Option<String>,
    /// Takes precedence over the `Idempotency-Key` header.
    pub idempotency_key: Option<String>,
}

#[derive(Deserialize)]
pub struct OrderItemBody {
    pub good_id: String,
    pub quantity: i64,
}

#[derive(Deserialize)]
pub struct UpdateStatusBody {
    pub status: String,
    pub reason: Option<String>,
}

// -- Response types --

#[derive(Debug, Serialize)]
pub struct OrderResponse {
    pub id: String,
    pub user_id: String,
    pub items: Vec<OrderItemResponse>,
    pub status: OrderStatus,
    pub status_reason: Option<String>,
    pub total_cents: i64,
    /// Total formatted as dollars, e.g. `"$12.50"`.
    pub total_price: String,
    pub address: Option<String>,
    pub payment_id: Option<String>,
    pub delivery_id: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct OrderItemResponse {
    pub good_id: String,
    pub quantity: u32,
    pub unit_price_cents: Option<i64>,
}

impl From<&Order> for OrderResponse {
    fn from(order: &Order) -> Self {
        Self {
            id: order.id().map(|id| id.to_string()).unwrap_or_default(),
            user_id: order.user_id().map(|u| u.to_string()).unwrap_or_default(),
            items: order
                .items()
                .iter()
                .map(|item| OrderItemResponse {
                    good_id: item.good_id.to_string(),
                    quantity: item.quantity,
                    unit_price_cents: item.unit_price.map(|p| p.cents()),
                })
                .collect(),
            status: order.status(),
            status_reason: order.status_reason().map(String::from),
            total_cents: order.total_price().cents(),
            total_price: order.total_price().to_string(),
            address: order.address().map(String::from),
            payment_id: order.payment_id().map(String::from),
            delivery_id: order.delivery_id().map(String::from),
            created_at: order.created_at(),
            updated_at: order.updated_at(),
        }
    }
}

// -- Handlers --

/// POST /orders — create an order and run its fulfillment saga.
///
/// Orders that end cancelled are still persisted; the error body carries
/// their `order_id`.
#[tracing::instrument(skip(state, headers, body))]
pub async fn create<S: EventStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    headers: HeaderMap,
    Json(body): Json<CreateOrderBody>,
) -> Result<(StatusCode, Json<OrderResponse>), ApiError> {
    let user_id = parse_user_id(&body.user_id)?;

    let lines = body
        .items
        .into_iter()
        .map(|item| {
            let quantity = u32::try_from(item.quantity).map_err(|_| {
                ApiError::BadRequest(format!(
                    "Invalid quantity for {}: {}",
                    item.good_id, item.quantity
                ))
            })?;
            Ok(OrderLine::new(item.good_id, quantity))
        })
        .collect::<Result<Vec<_>, ApiError>>()?;

    let idempotency_key = body.idempotency_key.or_else(|| {
        headers
            .get(IDEMPOTENCY_KEY_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
    });

    let request = CreateOrderRequest {
        user_id,
        lines,
        address: body.address,
        idempotency_key,
    };
    // Detached so a client disconnect cannot stop the saga halfway.
    let coordinator = state.coordinator.clone();
    let saga = async move { coordinator.create_order(request).await };
    let order = tokio::spawn(saga.instrument(tracing::Span::current())).await??;

    Ok((StatusCode::CREATED, Json(OrderResponse::from(&order))))
}

/// GET /orders/{id}
#[tracing::instrument(skip(state))]
pub async fn get<S: EventStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
) -> Result<Json<OrderResponse>, ApiError> {
    let order_id = parse_id(&id)?;
    let order = state.coordinator.get_order(order_id).await?;
    Ok(Json(OrderResponse::from(&order)))
}

/// PATCH /orders/{id}/status — operator-requested transition.
#[tracing::instrument(skip(state, body))]
pub async fn update_status<S: EventStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
    Json(body): Json<UpdateStatusBody>,
) -> Result<Json<OrderResponse>, ApiError> {
    let order_id = parse_id(&id)?;
    let status: OrderStatus = body.status.parse().map_err(ApiError::BadRequest)?;

    let order = state
        .coordinator
        .update_order_status(order_id, status, body.reason)
        .await?;
    Ok(Json(OrderResponse::from(&order)))
}

pub(crate) fn parse_user_id(id: &str) -> Result<UserId, ApiError> {
    uuid::Uuid::parse_str(id)
        .map(UserId::from_uuid)
        .map_err(|e| ApiError::BadRequest(format!("Invalid user_id: {e}")))
}
