//! API server entry point.

use std::sync::Arc;

use api::{AppState, Config, LogFormat};
use domain::Money;
use event_store::InMemoryEventStore;
use saga::{InMemoryInventoryService, NotificationConsumer, run_outbox_relay};
use tokio::signal;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match config.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

/// Demo catalog for local runs.
async fn seed_catalog(inventory: &InMemoryInventoryService) {
    inventory
        .add_good("widget", Money::from_cents(1000), 100)
        .await;
    inventory
        .add_good("gadget", Money::from_cents(2500), 50)
        .await;
    inventory
        .add_good("gizmo", Money::from_cents(499), 10)
        .await;
}

#[tokio::main]
async fn main() {
    let config = Config::from_env();
    init_tracing(&config);

    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder");

    let state = Arc::new(AppState::new(InMemoryEventStore::new(), &config.saga));
    seed_catalog(&state.inventory).await;

    // Resume anything a previous run left mid-flight.
    let report = state.coordinator.recover().await.expect("recovery failed");
    tracing::info!(resumed = report.resumed, failed = report.failed, "startup recovery done");
    state.catch_up().await.expect("projection catch-up failed");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let relay = tokio::spawn(run_outbox_relay(
        Arc::clone(&state.coordinator),
        config.saga.relay_interval,
        shutdown_rx,
    ));
    let notifications = tokio::spawn(NotificationConsumer::new().run(state.publisher.subscribe()));

    let app = api::create_app(Arc::clone(&state), metrics_handle);

    let addr = config.addr();
    tracing::info!(%addr, "starting order service");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind address");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    let _ = shutdown_tx.send(true);
    if let Err(e) = relay.await {
        tracing::warn!(error = %e, "outbox relay task ended abnormally");
    }
    notifications.abort();

    tracing::info!("server shut down gracefully");
}
