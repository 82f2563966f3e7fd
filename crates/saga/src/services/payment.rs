//! Payment service trait and in-memory implementation.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::AggregateId;
use domain::{Money, PaymentMethod};
use tokio::sync::Mutex;

use super::Faults;
use crate::error::ServiceError;

const SERVICE: &str = "payment";

/// Final answer of the payment service for an order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChargeOutcome {
    Completed { payment_id: String },
    Declined { reason: String },
}

/// Client for the payment service.
///
/// Charging is idempotent on the order id: a repeated call for an order that
/// already has an outcome returns that outcome and never charges again.
#[async_trait]
pub trait PaymentService: Send + Sync {
    async fn charge(
        &self,
        order_id: AggregateId,
        amount: Money,
        method: PaymentMethod,
    ) -> Result<ChargeOutcome, ServiceError>;
}

/// What the in-memory gateway remembers about an order's charge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChargeRecord {
    pub amount: Money,
    pub method: PaymentMethod,
    pub outcome: ChargeOutcome,
}

#[derive(Debug, Default)]
struct InMemoryPaymentState {
    charges: HashMap<AggregateId, ChargeRecord>,
    next_id: u32,
    decline_all: bool,
    declined_orders: HashSet<AggregateId>,
    faults: Faults,
    attempts: usize,
}

/// In-memory payment gateway with deterministic outcomes.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPaymentService {
    state: Arc<Mutex<InMemoryPaymentState>>,
}

impl InMemoryPaymentService {
    /// Creates a new in-memory payment service that approves every charge.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declines every new charge while set.
    pub async fn set_decline_all(&self, decline: bool) {
        self.state.lock().await.decline_all = decline;
    }

    /// Declines the next charge for a specific order.
    pub async fn decline_order(&self, order_id: AggregateId) {
        self.state.lock().await.declined_orders.insert(order_id);
    }

    /// Makes the next `calls` charges fail transiently.
    pub async fn fail_next(&self, calls: u32) {
        self.state.lock().await.faults.fail_next(calls);
    }

    /// Makes every charge fail until cleared.
    pub async fn set_unavailable(&self, down: bool) {
        self.state.lock().await.faults.set_down(down);
    }

    /// Delays every charge by `latency`.
    pub async fn set_latency(&self, latency: Option<Duration>) {
        self.state.lock().await.faults.set_latency(latency);
    }

    /// Returns the number of orders with a recorded outcome.
    pub async fn charge_count(&self) -> usize {
        self.state.lock().await.charges.len()
    }

    /// Returns the number of charge calls received, including failed ones.
    pub async fn attempts(&self) -> usize {
        self.state.lock().await.attempts
    }

    /// Returns the recorded charge for an order.
    pub async fn charge_for(&self, order_id: AggregateId) -> Option<ChargeRecord> {
        self.state.lock().await.charges.get(&order_id).cloned()
    }
}

#[async_trait]
impl PaymentService for InMemoryPaymentService {
    async fn charge(
        &self,
        order_id: AggregateId,
        amount: Money,
        method: PaymentMethod,
    ) -> Result<ChargeOutcome, ServiceError> {
        let latency = self.state.lock().await.faults.latency();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state.lock().await;
        state.attempts += 1;
        state.faults.check(SERVICE)?;

        if let Some(record) = state.charges.get(&order_id) {
            return Ok(record.outcome.clone());
        }

        let outcome = if state.decline_all || state.declined_orders.remove(&order_id) {
            ChargeOutcome::Declined {
                reason: "card declined".to_string(),
            }
        } else {
            state.next_id += 1;
            ChargeOutcome::Completed {
                payment_id: format!("PAY-{:04}", state.next_id),
            }
        };

        tracing::debug!(%order_id, %amount, %method, ?outcome, "charge processed");
        state.charges.insert(
            order_id,
            ChargeRecord {
                amount,
                method,
                outcome: outcome.clone(),
            },
        );
        Ok(outcome)
    }
}
