//! Shared application state.

use std::sync::Arc;

use event_store::EventStore;
use projections::{ProjectionProcessor, UserOrdersView};
use saga::{
    InMemoryDeliveryService, InMemoryEventPublisher, InMemoryInventoryService,
    InMemoryPaymentService, SagaConfig, SagaCoordinator,
};
use tokio::sync::Mutex;

use crate::error::ApiError;

/// Coordinator wired to the in-process service doubles.
pub type Coordinator<S> = SagaCoordinator<
    S,
    InMemoryInventoryService,
    InMemoryPaymentService,
    InMemoryDeliveryService,
    InMemoryEventPublisher,
>;

/// State shared by every handler.
///
/// The service handles are clones of the ones owned by the coordinator, so
/// the binary can seed the catalog and tests can inject faults.
pub struct AppState<S: EventStore + Clone> {
    pub coordinator: Arc<Coordinator<S>>,
    pub user_orders: UserOrdersView,
    /// Serialized so two requests never deliver the same event twice.
    pub projection_processor: Mutex<ProjectionProcessor<S>>,
    pub inventory: InMemoryInventoryService,
    pub payment: InMemoryPaymentService,
    pub delivery: InMemoryDeliveryService,
    pub publisher: InMemoryEventPublisher,
}

impl<S: EventStore + Clone + 'static> AppState<S> {
    pub fn new(store: S, config: &SagaConfig) -> Self {
        let inventory = InMemoryInventoryService::new();
        let payment = InMemoryPaymentService::new();
        let delivery = InMemoryDeliveryService::new();
        let publisher = InMemoryEventPublisher::new();

        let coordinator = SagaCoordinator::new(
            store.clone(),
            inventory.clone(),
            payment.clone(),
            delivery.clone(),
            publisher.clone(),
        )
        .with_config(config);

        let user_orders = UserOrdersView::new();
        let mut processor = ProjectionProcessor::new(store);
        processor.register(Box::new(user_orders.clone()));

        Self {
            coordinator: Arc::new(coordinator),
            user_orders,
            projection_processor: Mutex::new(processor),
            inventory,
            payment,
            delivery,
            publisher,
        }
    }

    /// Brings the read models up to date with the event store.
    pub async fn catch_up(&self) -> Result<u64, ApiError> {
        Ok(self.projection_processor.lock().await.catch_up().await?)
    }
}
