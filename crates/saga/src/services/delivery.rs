//! Delivery service trait and in-memory implementation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::AggregateId;
use tokio::sync::Mutex;

use super::Faults;
use crate::error::ServiceError;

const SERVICE: &str = "delivery";

/// Client for the delivery service.
///
/// Scheduling is idempotent on the order id and returns the delivery id.
#[async_trait]
pub trait DeliveryService: Send + Sync {
    async fn schedule(&self, order_id: AggregateId, address: &str)
    -> Result<String, ServiceError>;
}

#[derive(Debug, Default)]
struct InMemoryDeliveryState {
    deliveries: HashMap<AggregateId, (String, String)>,
    next_id: u32,
    faults: Faults,
    attempts: usize,
}

/// In-memory delivery service for testing and local runs.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDeliveryService {
    state: Arc<Mutex<InMemoryDeliveryState>>,
}

impl InMemoryDeliveryService {
    /// Creates a new in-memory delivery service.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `calls` requests fail transiently.
    pub async fn fail_next(&self, calls: u32) {
        self.state.lock().await.faults.fail_next(calls);
    }

    /// Makes every request fail until cleared.
    pub async fn set_unavailable(&self, down: bool) {
        self.state.lock().await.faults.set_down(down);
    }

    /// Delays every request by `latency`.
    pub async fn set_latency(&self, latency: Option<Duration>) {
        self.state.lock().await.faults.set_latency(latency);
    }

    /// Returns the number of scheduled deliveries.
    pub async fn delivery_count(&self) -> usize {
        self.state.lock().await.deliveries.len()
    }

    /// Returns the number of schedule calls received, including failed ones.
    pub async fn attempts(&self) -> usize {
        self.state.lock().await.attempts
    }

    /// Returns the delivery id and address booked for an order.
    pub async fn delivery_for(&self, order_id: AggregateId) -> Option<(String, String)> {
        self.state.lock().await.deliveries.get(&order_id).cloned()
    }
}

#[async_trait]
impl DeliveryService for InMemoryDeliveryService {
    async fn schedule(
        &self,
        order_id: AggregateId,
        address: &str,
    ) -> Result<String, ServiceError> {
        let latency = self.state.lock().await.faults.latency();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state.lock().await;
        state.attempts += 1;
        state.faults.check(SERVICE)?;

        if let Some((delivery_id, _)) = state.deliveries.get(&order_id) {
            return Ok(delivery_id.clone());
        }

        state.next_id += 1;
        let delivery_id = format!("DEL-{:04}", state.next_id);
        state
            .deliveries
            .insert(order_id, (delivery_id.clone(), address.to_string()));

        tracing::debug!(%order_id, %delivery_id, "delivery scheduled");
        Ok(delivery_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_schedule_is_idempotent() {
        let service = InMemoryDeliveryService::new();
        let order_id = AggregateId::new();

        let first = service.schedule(order_id, "1 Main St").await.unwrap();
        let second = service.schedule(order_id, "1 Main St").await.unwrap();

        assert_eq!(first, "DEL-0001");
        assert_eq!(first, second);
        assert_eq!(service.delivery_count().await, 1);
    }

    #[tokio::test]
    async fn test_transient_failure_then_success() {
        let service = InMemoryDeliveryService::new();
        service.fail_next(1).await;
        let order_id = AggregateId::new();

        assert!(service.schedule(order_id, "addr").await.is_err());
        assert!(service.schedule(order_id, "addr").await.is_ok());
        assert_eq!(service.attempts().await, 2);
        assert_eq!(
            service.delivery_for(order_id).await,
            Some(("DEL-0001".to_string(), "addr".to_string()))
        );
    }
}
