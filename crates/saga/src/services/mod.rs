//! External service traits and in-memory implementations for saga steps.

pub mod delivery;
pub mod inventory;
pub mod payment;
pub mod publisher;

use std::time::Duration;

use crate::error::ServiceError;

pub use delivery::{DeliveryService, InMemoryDeliveryService};
pub use inventory::{Good, InMemoryInventoryService, InventoryOp, InventoryService};
pub use payment::{ChargeOutcome, ChargeRecord, InMemoryPaymentService, PaymentService};
pub use publisher::{
    EventPublisher, InMemoryEventPublisher, ORDER_EVENTS_TOPIC, OrderEventType, OrderMessage,
    PublishedMessage,
};

/// Scripted failures for an in-memory service operation.
#[derive(Debug, Default, Clone)]
pub(crate) struct Faults {
    /// Number of upcoming calls that fail transiently.
    transient: u32,
    /// Every call fails while set.
    down: bool,
    /// Added before each call is served.
    latency: Option<Duration>,
}

impl Faults {
    pub(crate) fn fail_next(&mut self, calls: u32) {
        self.transient = calls;
    }

    pub(crate) fn set_down(&mut self, down: bool) {
        self.down = down;
    }

    pub(crate) fn set_latency(&mut self, latency: Option<Duration>) {
        self.latency = latency;
    }

    pub(crate) fn latency(&self) -> Option<Duration> {
        self.latency
    }

    /// Consumes one scripted failure, if any is due.
    pub(crate) fn check(&mut self, service: &'static str) -> Result<(), ServiceError> {
        if self.down {
            return Err(ServiceError::unavailable(service, "service is down"));
        }
        if self.transient > 0 {
            self.transient -= 1;
            return Err(ServiceError::unavailable(service, "transient failure"));
        }
        Ok(())
    }
}
