//! Inventory service trait and in-memory implementation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::AggregateId;
use domain::{GoodId, Money};
use tokio::sync::Mutex;

use super::Faults;
use crate::error::ServiceError;

const SERVICE: &str = "inventory";

/// A catalog entry as reported by the inventory service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Good {
    pub id: GoodId,

    /// Authoritative unit price.
    pub price: Money,

    /// Units not held by any reservation.
    pub stock: u32,
}

/// Client for the inventory service.
///
/// Reservations are keyed by `(good, order)`: reserving twice for the same
/// pair succeeds without taking stock twice, and releasing a reservation that
/// does not exist is a no-op.
#[async_trait]
pub trait InventoryService: Send + Sync {
    /// Fetches a good with its current price and stock.
    async fn get_good(&self, good_id: &GoodId) -> Result<Good, ServiceError>;

    /// Returns true if `quantity` units are currently available. Read-only.
    async fn check_availability(&self, good_id: &GoodId, quantity: u32)
    -> Result<bool, ServiceError>;

    /// Takes `quantity` units of stock for the order.
    async fn reserve(
        &self,
        good_id: &GoodId,
        quantity: u32,
        order_id: AggregateId,
    ) -> Result<(), ServiceError>;

    /// Returns the order's reserved units of the good to stock.
    async fn release(&self, good_id: &GoodId, order_id: AggregateId) -> Result<(), ServiceError>;
}

/// Inventory operations that can be scripted to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InventoryOp {
    GetGood,
    CheckAvailability,
    Reserve,
    Release,
}

#[derive(Debug)]
struct StockRecord {
    price: Money,
    stock: u32,
}

#[derive(Debug, Default)]
struct InMemoryInventoryState {
    goods: HashMap<GoodId, StockRecord>,
    reservations: HashMap<(GoodId, AggregateId), u32>,
    faults: HashMap<InventoryOp, Faults>,
    calls: HashMap<InventoryOp, usize>,
}

impl InMemoryInventoryState {
    fn begin(&mut self, op: InventoryOp) -> Result<(), ServiceError> {
        *self.calls.entry(op).or_default() += 1;
        self.faults.entry(op).or_default().check(SERVICE)
    }
}

/// In-memory inventory service for testing and local runs.
///
/// A single lock guards all stock, so concurrent reservations are admitted
/// strictly in arrival order and stock can never go negative.
#[derive(Debug, Clone, Default)]
pub struct InMemoryInventoryService {
    state: Arc<Mutex<InMemoryInventoryState>>,
}

impl InMemoryInventoryService {
    /// Creates a new in-memory inventory service.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a good to the catalog, replacing any previous entry.
    pub async fn add_good(&self, good_id: impl Into<GoodId>, price: Money, stock: u32) {
        self.state
            .lock()
            .await
            .goods
            .insert(good_id.into(), StockRecord { price, stock });
    }

    /// Makes the next `calls` invocations of `op` fail transiently.
    pub async fn fail_next(&self, op: InventoryOp, calls: u32) {
        self.state
            .lock()
            .await
            .faults
            .entry(op)
            .or_default()
            .fail_next(calls);
    }

    /// Makes every invocation of `op` fail until cleared.
    pub async fn set_unavailable(&self, op: InventoryOp, down: bool) {
        self.state
            .lock()
            .await
            .faults
            .entry(op)
            .or_default()
            .set_down(down);
    }

    /// Delays every invocation of `op` by `latency`.
    pub async fn set_latency(&self, op: InventoryOp, latency: Option<Duration>) {
        self.state
            .lock()
            .await
            .faults
            .entry(op)
            .or_default()
            .set_latency(latency);
    }

    /// Returns the unreserved stock of a good.
    pub async fn stock(&self, good_id: &GoodId) -> Option<u32> {
        self.state.lock().await.goods.get(good_id).map(|g| g.stock)
    }

    /// Returns the quantity held for an order, if any.
    pub async fn reservation(&self, good_id: &GoodId, order_id: AggregateId) -> Option<u32> {
        self.state
            .lock()
            .await
            .reservations
            .get(&(good_id.clone(), order_id))
            .copied()
    }

    /// Returns the number of active reservations.
    pub async fn reservation_count(&self) -> usize {
        self.state.lock().await.reservations.len()
    }

    /// Returns how many times `op` was invoked, including failed calls.
    pub async fn calls(&self, op: InventoryOp) -> usize {
        self.state
            .lock()
            .await
            .calls
            .get(&op)
            .copied()
            .unwrap_or_default()
    }

    async fn simulate_latency(&self, op: InventoryOp) {
        let latency = self
            .state
            .lock()
            .await
            .faults
            .get(&op)
            .and_then(Faults::latency);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl InventoryService for InMemoryInventoryService {
    async fn get_good(&self, good_id: &GoodId) -> Result<Good, ServiceError> {
        self.simulate_latency(InventoryOp::GetGood).await;
        let mut state = self.state.lock().await;
        state.begin(InventoryOp::GetGood)?;

        state
            .goods
            .get(good_id)
            .map(|record| Good {
                id: good_id.clone(),
                price: record.price,
                stock: record.stock,
            })
            .ok_or_else(|| ServiceError::GoodNotFound(good_id.clone()))
    }

    async fn check_availability(
        &self,
        good_id: &GoodId,
        quantity: u32,
    ) -> Result<bool, ServiceError> {
        self.simulate_latency(InventoryOp::CheckAvailability).await;
        let mut state = self.state.lock().await;
        state.begin(InventoryOp::CheckAvailability)?;

        let record = state
            .goods
            .get(good_id)
            .ok_or_else(|| ServiceError::GoodNotFound(good_id.clone()))?;
        Ok(record.stock >= quantity)
    }

    async fn reserve(
        &self,
        good_id: &GoodId,
        quantity: u32,
        order_id: AggregateId,
    ) -> Result<(), ServiceError> {
        self.simulate_latency(InventoryOp::Reserve).await;
        let mut state = self.state.lock().await;
        state.begin(InventoryOp::Reserve)?;

        let key = (good_id.clone(), order_id);
        if state.reservations.contains_key(&key) {
            return Ok(());
        }

        let record = state
            .goods
            .get_mut(good_id)
            .ok_or_else(|| ServiceError::GoodNotFound(good_id.clone()))?;
        if record.stock < quantity {
            return Err(ServiceError::InsufficientStock {
                good_id: good_id.clone(),
                requested: quantity,
                available: record.stock,
            });
        }
        record.stock -= quantity;
        state.reservations.insert(key, quantity);

        tracing::debug!(%good_id, quantity, %order_id, "stock reserved");
        Ok(())
    }

    async fn release(&self, good_id: &GoodId, order_id: AggregateId) -> Result<(), ServiceError> {
        self.simulate_latency(InventoryOp::Release).await;
        let mut state = self.state.lock().await;
        state.begin(InventoryOp::Release)?;

        let Some(quantity) = state.reservations.remove(&(good_id.clone(), order_id)) else {
            return Ok(());
        };
        if let Some(record) = state.goods.get_mut(good_id) {
            record.stock += quantity;
        }

        tracing::debug!(%good_id, quantity, %order_id, "stock released");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn service_with_widget(stock: u32) -> (InMemoryInventoryService, GoodId) {
        let service = InMemoryInventoryService::new();
        service
            .add_good("widget", Money::from_cents(1000), stock)
            .await;
        (service, GoodId::new("widget"))
    }

    #[tokio::test]
    async fn test_reserve_and_release() {
        let (service, widget) = service_with_widget(10).await;
        let order_id = AggregateId::new();

        service.reserve(&widget, 3, order_id).await.unwrap();
        assert_eq!(service.stock(&widget).await, Some(7));
        assert_eq!(service.reservation(&widget, order_id).await, Some(3));

        service.release(&widget, order_id).await.unwrap();
        assert_eq!(service.stock(&widget).await, Some(10));
        assert_eq!(service.reservation_count().await, 0);
    }

    #[tokio::test]
    async fn test_reserve_is_idempotent_per_order() {
        let (service, widget) = service_with_widget(10).await;
        let order_id = AggregateId::new();

        service.reserve(&widget, 4, order_id).await.unwrap();
        service.reserve(&widget, 4, order_id).await.unwrap();

        assert_eq!(service.stock(&widget).await, Some(6));
        assert_eq!(service.reservation_count().await, 1);
    }

    #[tokio::test]
    async fn test_release_without_reservation_is_noop() {
        let (service, widget) = service_with_widget(2).await;

        service.release(&widget, AggregateId::new()).await.unwrap();
        service
            .release(&GoodId::new("unknown"), AggregateId::new())
            .await
            .unwrap();

        assert_eq!(service.stock(&widget).await, Some(2));
    }

    #[tokio::test]
    async fn test_insufficient_stock() {
        let (service, widget) = service_with_widget(1).await;

        assert!(!service.check_availability(&widget, 5).await.unwrap());
        let result = service.reserve(&widget, 5, AggregateId::new()).await;

        assert_eq!(
            result,
            Err(ServiceError::InsufficientStock {
                good_id: widget.clone(),
                requested: 5,
                available: 1,
            })
        );
        assert_eq!(service.stock(&widget).await, Some(1));
    }

    #[tokio::test]
    async fn test_get_good_unknown() {
        let service = InMemoryInventoryService::new();
        let result = service.get_good(&GoodId::new("ghost")).await;
        assert!(matches!(result, Err(ServiceError::GoodNotFound(_))));
    }

    #[tokio::test]
    async fn test_scripted_failures() {
        let (service, widget) = service_with_widget(5).await;
        service.fail_next(InventoryOp::Reserve, 1).await;

        let order_id = AggregateId::new();
        assert!(service.reserve(&widget, 1, order_id).await.is_err());
        assert!(service.reserve(&widget, 1, order_id).await.is_ok());
        assert_eq!(service.calls(InventoryOp::Reserve).await, 2);

        service.set_unavailable(InventoryOp::Release, true).await;
        let result = service.release(&widget, order_id).await;
        assert!(matches!(result, Err(ServiceError::Unavailable { .. })));
        assert_eq!(service.reservation(&widget, order_id).await, Some(1));
    }

    #[tokio::test]
    async fn test_concurrent_reservations_never_oversell() {
        let (service, widget) = service_with_widget(5).await;

        let mut handles = Vec::new();
        for _ in 0..10 {
            let service = service.clone();
            let widget = widget.clone();
            handles.push(tokio::spawn(async move {
                service.reserve(&widget, 1, AggregateId::new()).await
            }));
        }

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                admitted += 1;
            }
        }

        assert_eq!(admitted, 5);
        assert_eq!(service.stock(&widget).await, Some(0));
    }
}
