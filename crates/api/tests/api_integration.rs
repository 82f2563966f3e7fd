//! Integration tests for the HTTP surface.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use domain::{GoodId, Money, PaymentMethod};
use event_store::InMemoryEventStore;
use metrics_exporter_prometheus::PrometheusHandle;
use saga::{InventoryOp, SagaConfig};
use serde_json::{Value, json};
use tower::ServiceExt;

use api::AppState;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

fn get_metrics_handle() -> PrometheusHandle {
    METRICS_HANDLE
        .get_or_init(|| {
            metrics_exporter_prometheus::PrometheusBuilder::new()
                .install_recorder()
                .expect("failed to install Prometheus recorder")
        })
        .clone()
}

fn fast_config() -> SagaConfig {
    SagaConfig {
        max_attempts: 2,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        call_deadline: Duration::from_millis(500),
        relay_interval: Duration::from_millis(50),
        payment_method: PaymentMethod::Card,
    }
}

async fn setup() -> (Router, Arc<AppState<InMemoryEventStore>>) {
    let state = Arc::new(AppState::new(InMemoryEventStore::new(), &fast_config()));
    state
        .inventory
        .add_good("widget", Money::from_cents(1000), 10)
        .await;
    state
        .inventory
        .add_good("gadget", Money::from_cents(2500), 5)
        .await;
    let app = api::create_app(Arc::clone(&state), get_metrics_handle());
    (app, state)
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = serde_json::from_slice(&body).unwrap_or(Value::Null);
    (status, json)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn with_json(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn order_body(user_id: &str, items: Value) -> Value {
    json!({
        "user_id": user_id,
        "items": items,
        "address": "42 Harbour Road"
    })
}

fn new_user() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[tokio::test]
async fn test_health_check() {
    let (app, _) = setup().await;

    let (status, json) = send(&app, get("/health")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
}

#[tokio::test]
async fn test_create_order_runs_saga_to_completion() {
    let (app, state) = setup().await;

    let (status, json) = send(
        &app,
        with_json(
            "POST",
            "/orders",
            order_body(
                &new_user(),
                json!([
                    {"good_id": "widget", "quantity": 2},
                    {"good_id": "gadget", "quantity": 1}
                ]),
            ),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(json["status"], "completed");
    assert_eq!(json["total_cents"], 4500);
    assert_eq!(json["total_price"], "$45.00");
    assert_eq!(json["items"][0]["good_id"], "widget");
    assert_eq!(json["items"][0]["unit_price_cents"], 1000);
    assert!(json["delivery_id"].as_str().is_some());

    assert_eq!(state.inventory.stock(&GoodId::new("widget")).await, Some(8));
    assert_eq!(state.payment.charge_count().await, 1);
}

#[tokio::test]
async fn test_get_order() {
    let (app, _) = setup().await;
    let (_, created) = send(
        &app,
        with_json(
            "POST",
            "/orders",
            order_body(&new_user(), json!([{"good_id": "widget", "quantity": 1}])),
        ),
    )
    .await;
    let id = created["id"].as_str().unwrap();

    let (status, json) = send(&app, get(&format!("/orders/{id}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["id"], id);
    assert_eq!(json["status"], "completed");

    let missing = uuid::Uuid::new_v4();
    let (status, _) = send(&app, get(&format!("/orders/{missing}"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(&app, get("/orders/not-a-uuid")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_insufficient_stock_returns_conflict_with_order_id() {
    let (app, state) = setup().await;

    let (status, json) = send(
        &app,
        with_json(
            "POST",
            "/orders",
            order_body(
                &new_user(),
                json!([
                    {"good_id": "widget", "quantity": 1},
                    {"good_id": "gadget", "quantity": 50}
                ]),
            ),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::CONFLICT);
    let id = json["order_id"].as_str().unwrap();

    let (_, order) = send(&app, get(&format!("/orders/{id}"))).await;
    assert_eq!(order["status"], "cancelled");
    assert_eq!(state.inventory.stock(&GoodId::new("widget")).await, Some(10));
    assert_eq!(state.payment.charge_count().await, 0);
}

#[tokio::test]
async fn test_payment_declined_returns_payment_required() {
    let (app, state) = setup().await;
    state.payment.set_decline_all(true).await;

    let (status, json) = send(
        &app,
        with_json(
            "POST",
            "/orders",
            order_body(&new_user(), json!([{"good_id": "widget", "quantity": 3}])),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    let id = json["order_id"].as_str().unwrap();

    let (_, order) = send(&app, get(&format!("/orders/{id}"))).await;
    assert_eq!(order["status"], "cancelled");
    assert_eq!(order["status_reason"], "payment_failed");
    assert_eq!(state.inventory.stock(&GoodId::new("widget")).await, Some(10));
}

#[tokio::test]
async fn test_dependency_outage_returns_service_unavailable() {
    let (app, state) = setup().await;
    state.inventory.set_unavailable(InventoryOp::GetGood, true).await;

    let (status, json) = send(
        &app,
        with_json(
            "POST",
            "/orders",
            order_body(&new_user(), json!([{"good_id": "widget", "quantity": 1}])),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(json.get("order_id").is_none());
}

#[tokio::test]
async fn test_invalid_requests_are_rejected() {
    let (app, _) = setup().await;
    let user = new_user();

    let cases = [
        (order_body(&user, json!([])), StatusCode::BAD_REQUEST),
        (
            order_body(&user, json!([{"good_id": "widget", "quantity": 0}])),
            StatusCode::BAD_REQUEST,
        ),
        (
            order_body(&user, json!([{"good_id": "widget", "quantity": -2}])),
            StatusCode::BAD_REQUEST,
        ),
        (
            order_body("bob", json!([{"good_id": "widget", "quantity": 1}])),
            StatusCode::BAD_REQUEST,
        ),
        (
            order_body(&user, json!([{"good_id": "sprocket", "quantity": 1}])),
            StatusCode::NOT_FOUND,
        ),
    ];

    for (body, expected) in cases {
        let (status, json) = send(&app, with_json("POST", "/orders", body)).await;
        assert_eq!(status, expected, "body: {json}");
        assert!(json["error"].as_str().is_some());
    }
}

#[tokio::test]
async fn test_idempotency_key_header_reuses_order() {
    let (app, state) = setup().await;
    let body = order_body(&new_user(), json!([{"good_id": "widget", "quantity": 1}]));

    let request = || {
        Request::builder()
            .method("POST")
            .uri("/orders")
            .header("content-type", "application/json")
            .header("idempotency-key", "checkout-7")
            .body(Body::from(body.to_string()))
            .unwrap()
    };

    let (first_status, first) = send(&app, request()).await;
    let (second_status, second) = send(&app, request()).await;

    assert_eq!(first_status, StatusCode::CREATED);
    assert_eq!(second_status, StatusCode::CREATED);
    assert_eq!(first["id"], second["id"]);
    assert_eq!(state.payment.charge_count().await, 1);
    assert_eq!(state.inventory.stock(&GoodId::new("widget")).await, Some(9));
}

#[tokio::test]
async fn test_update_status() {
    let (app, state) = setup().await;
    state.delivery.set_unavailable(true).await;

    let (_, created) = send(
        &app,
        with_json(
            "POST",
            "/orders",
            order_body(&new_user(), json!([{"good_id": "widget", "quantity": 1}])),
        ),
    )
    .await;
    assert_eq!(created["status"], "paid");
    let id = created["id"].as_str().unwrap();
    let uri = format!("/orders/{id}/status");

    let (status, _) = send(&app, with_json("PATCH", &uri, json!({"status": "shipped"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    for saga_owned in ["priced", "reserved", "paid", "payment_failed", "delivery_scheduled"] {
        let (status, json) =
            send(&app, with_json("PATCH", &uri, json!({"status": saga_owned}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{saga_owned}: {json}");
    }

    let (status, _) = send(&app, with_json("PATCH", &uri, json!({"status": "cancelled"}))).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, json) =
        send(&app, with_json("PATCH", &uri, json!({"status": "completed"}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "completed");
}

#[tokio::test]
async fn test_list_user_orders_newest_first() {
    let (app, _) = setup().await;
    let user = new_user();

    let mut ids = Vec::new();
    for good in ["widget", "gadget"] {
        let (_, created) = send(
            &app,
            with_json(
                "POST",
                "/orders",
                order_body(&user, json!([{"good_id": good, "quantity": 1}])),
            ),
        )
        .await;
        ids.push(created["id"].as_str().unwrap().to_string());
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    send(
        &app,
        with_json(
            "POST",
            "/orders",
            order_body(&new_user(), json!([{"good_id": "widget", "quantity": 1}])),
        ),
    )
    .await;

    let (status, json) = send(&app, get(&format!("/users/{user}/orders"))).await;

    assert_eq!(status, StatusCode::OK);
    let listed: Vec<&str> = json
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|o| o["id"].as_str())
        .collect();
    assert_eq!(listed, vec![ids[1].as_str(), ids[0].as_str()]);

    let (status, json) = send(&app, get(&format!("/users/{}/orders", new_user()))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json, json!([]));
}

#[tokio::test]
async fn test_saga_status() {
    let (app, _) = setup().await;
    let (_, created) = send(
        &app,
        with_json(
            "POST",
            "/orders",
            order_body(&new_user(), json!([{"good_id": "widget", "quantity": 1}])),
        ),
    )
    .await;
    let id = created["id"].as_str().unwrap();

    let (status, json) = send(&app, get(&format!("/orders/{id}/saga"))).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["order_id"], id);
    assert_eq!(json["state"], "completed");
    assert_eq!(json["final_status"], "completed");
    assert_eq!(json["reserved_goods"], json!(["widget"]));
    let steps: Vec<&str> = json["completed_steps"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(Value::as_str)
        .collect();
    assert!(steps.contains(&"charge_payment"));

    let missing = uuid::Uuid::new_v4();
    let (status, _) = send(&app, get(&format!("/orders/{missing}/saga"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_admin_recover_and_drain() {
    let (app, state) = setup().await;
    state.publisher.set_unavailable(true).await;

    send(
        &app,
        with_json(
            "POST",
            "/orders",
            order_body(&new_user(), json!([{"good_id": "widget", "quantity": 1}])),
        ),
    )
    .await;
    assert!(state.publisher.published().await.is_empty());

    state.publisher.set_unavailable(false).await;
    let (status, json) = send(
        &app,
        Request::builder()
            .method("POST")
            .uri("/admin/recover")
            .body(Body::empty())
            .unwrap(),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["resumed"], 0);
    assert_eq!(json["dispatched"], 2);
    assert_eq!(state.publisher.published().await.len(), 2);

    let (status, json) = send(
        &app,
        Request::builder()
            .method("POST")
            .uri("/admin/outbox/drain")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["dispatched"], 0);
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let (app, _) = setup().await;
    send(
        &app,
        with_json(
            "POST",
            "/orders",
            order_body(&new_user(), json!([{"good_id": "widget", "quantity": 1}])),
        ),
    )
    .await;

    let response = app.oneshot(get("/metrics")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("saga_executions_total"));
}
