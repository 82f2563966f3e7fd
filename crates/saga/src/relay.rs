//! Background outbox relay.

use std::sync::Arc;
use std::time::Duration;

use event_store::EventStore;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::coordinator::SagaCoordinator;
use crate::services::{DeliveryService, EventPublisher, InventoryService, PaymentService};

/// Every `interval`, resumes stranded sagas and drains the outbox, until
/// `shutdown` flips to true or its sender is dropped.
pub async fn run_outbox_relay<S, I, P, D, E>(
    coordinator: Arc<SagaCoordinator<S, I, P, D, E>>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) where
    S: EventStore + Clone,
    I: InventoryService,
    P: PaymentService,
    D: DeliveryService,
    E: EventPublisher,
{
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tracing::info!(?interval, "outbox relay started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let resumed = coordinator.resume_stranded().await;
                if resumed > 0 {
                    tracing::info!(resumed, "stranded sagas resumed");
                }
                match coordinator.drain_outbox().await {
                    Ok(0) => {}
                    Ok(dispatched) => tracing::debug!(dispatched, "outbox relay pass"),
                    Err(e) => tracing::warn!(error = %e, "outbox relay pass failed"),
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    tracing::info!("outbox relay stopped");
}
