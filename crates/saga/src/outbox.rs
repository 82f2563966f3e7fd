//! Per-order transactional outbox.
//!
//! Side effects that must survive a crash (lifecycle messages and delivery
//! retries) are first appended to the order's outbox stream and only then
//! dispatched. Entries of one order are dispatched strictly in sequence; the
//! first failure stops the walk so later messages never overtake it.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use common::AggregateId;
use domain::{Aggregate, CommandHandler, DomainError, DomainEvent};
use event_store::{EventStore, EventStoreExt, Version};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::Result;
use crate::order_fulfillment::OUTBOX_STREAM;
use crate::services::{OrderEventType, OrderMessage};

/// Work recorded in the outbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "task", rename_all = "snake_case")]
pub enum OutboxTask {
    /// Publish a lifecycle message to the order events topic.
    Publish { message: OrderMessage },

    /// Retry booking delivery for a paid order.
    ScheduleDelivery { address: String },
}

impl OutboxTask {
    pub fn publish(message: OrderMessage) -> Self {
        OutboxTask::Publish { message }
    }

    /// Returns the lifecycle event type for publish tasks.
    pub fn event_type(&self) -> Option<OrderEventType> {
        match self {
            OutboxTask::Publish { message } => Some(message.event_type),
            OutboxTask::ScheduleDelivery { .. } => None,
        }
    }
}

/// Events of an order's outbox stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum OutboxEvent {
    MessageEnqueued {
        outbox_id: AggregateId,
        order_id: AggregateId,
        seq: u64,
        task: OutboxTask,
        enqueued_at: DateTime<Utc>,
    },
    MessageDispatched {
        seq: u64,
        dispatched_at: DateTime<Utc>,
    },
    DispatchFailed {
        seq: u64,
        error: String,
        failed_at: DateTime<Utc>,
    },
}

impl DomainEvent for OutboxEvent {
    fn event_type(&self) -> &'static str {
        match self {
            OutboxEvent::MessageEnqueued { .. } => "MessageEnqueued",
            OutboxEvent::MessageDispatched { .. } => "MessageDispatched",
            OutboxEvent::DispatchFailed { .. } => "DispatchFailed",
        }
    }
}

/// One outbox entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub seq: u64,
    pub task: OutboxTask,
    pub dispatched: bool,
    pub attempts: u32,
    pub last_error: Option<String>,
}

/// Replayed state of one order's outbox.
#[derive(Debug, Clone, Default)]
pub struct OrderOutbox {
    id: Option<AggregateId>,
    version: Version,
    order_id: Option<AggregateId>,
    entries: BTreeMap<u64, OutboxEntry>,
}

impl Aggregate for OrderOutbox {
    type Event = OutboxEvent;
    type Error = DomainError;

    fn aggregate_type() -> &'static str {
        "OrderOutbox"
    }

    fn id(&self) -> Option<AggregateId> {
        self.id
    }

    fn version(&self) -> Version {
        self.version
    }

    fn set_version(&mut self, version: Version) {
        self.version = version;
    }

    fn apply(&mut self, event: Self::Event) {
        match event {
            OutboxEvent::MessageEnqueued {
                outbox_id,
                order_id,
                seq,
                task,
                ..
            } => {
                self.id = Some(outbox_id);
                self.order_id = Some(order_id);
                self.entries.insert(
                    seq,
                    OutboxEntry {
                        seq,
                        task,
                        dispatched: false,
                        attempts: 0,
                        last_error: None,
                    },
                );
            }
            OutboxEvent::MessageDispatched { seq, .. } => {
                if let Some(entry) = self.entries.get_mut(&seq) {
                    entry.dispatched = true;
                    entry.attempts += 1;
                    entry.last_error = None;
                }
            }
            OutboxEvent::DispatchFailed { seq, error, .. } => {
                if let Some(entry) = self.entries.get_mut(&seq) {
                    entry.attempts += 1;
                    entry.last_error = Some(error);
                }
            }
        }
    }
}

impl OrderOutbox {
    pub fn order_id(&self) -> Option<AggregateId> {
        self.order_id
    }

    /// All entries in sequence order.
    pub fn entries(&self) -> impl Iterator<Item = &OutboxEntry> {
        self.entries.values()
    }

    /// The oldest entry not yet dispatched.
    pub fn next_pending(&self) -> Option<&OutboxEntry> {
        self.entries.values().find(|e| !e.dispatched)
    }

    pub fn pending_count(&self) -> usize {
        self.entries.values().filter(|e| !e.dispatched).count()
    }

    /// Returns true if a message of this type was ever enqueued.
    pub fn contains_message(&self, event_type: OrderEventType) -> bool {
        self.entries
            .values()
            .any(|e| e.task.event_type() == Some(event_type))
    }

    fn next_seq(&self) -> u64 {
        self.entries.keys().next_back().map_or(1, |seq| seq + 1)
    }

    fn is_pending(&self, seq: u64) -> bool {
        self.entries.get(&seq).is_some_and(|e| !e.dispatched)
    }
}

/// Event-store backed outbox for all orders.
///
/// Callers serialize access per order; the outbox itself relies on
/// optimistic concurrency and surfaces conflicts as errors.
pub struct Outbox<S: EventStore> {
    handler: CommandHandler<S, OrderOutbox>,
    /// Orders with undispatched entries; `None` until the store is first scanned.
    pending: Mutex<Option<HashSet<AggregateId>>>,
}

impl<S: EventStore> Outbox<S> {
    pub fn new(store: S) -> Self {
        Self {
            handler: CommandHandler::new(store),
            pending: Mutex::default(),
        }
    }

    /// Returns the outbox stream id for an order.
    pub fn stream_id(order_id: AggregateId) -> AggregateId {
        order_id.derive(OUTBOX_STREAM)
    }

    pub async fn load(&self, order_id: AggregateId) -> Result<OrderOutbox> {
        Ok(self.handler.load(Self::stream_id(order_id)).await?)
    }

    /// Appends a task and returns its sequence number.
    pub async fn enqueue(&self, order_id: AggregateId, task: OutboxTask) -> Result<u64> {
        let outbox_id = Self::stream_id(order_id);
        let result = self
            .handler
            .execute(outbox_id, |outbox| {
                Ok::<_, DomainError>(vec![OutboxEvent::MessageEnqueued {
                    outbox_id,
                    order_id,
                    seq: outbox.next_seq(),
                    task,
                    enqueued_at: Utc::now(),
                }])
            })
            .await?;

        let seq = match result.events.first() {
            Some(OutboxEvent::MessageEnqueued { seq, .. }) => *seq,
            _ => 0,
        };
        self.track(order_id, true).await;
        tracing::debug!(%order_id, seq, "outbox entry enqueued");
        Ok(seq)
    }

    /// Enqueues a publish task unless a message of the same type is already recorded.
    ///
    /// Returns true if a new entry was appended.
    pub async fn enqueue_message_once(&self, message: OrderMessage) -> Result<bool> {
        let order_id = message.order_id;
        if self.load(order_id).await?.contains_message(message.event_type) {
            return Ok(false);
        }
        self.enqueue(order_id, OutboxTask::publish(message)).await?;
        Ok(true)
    }

    /// Marks an entry dispatched. Already dispatched entries are left alone.
    pub async fn mark_dispatched(&self, order_id: AggregateId, seq: u64) -> Result<()> {
        let result = self
            .handler
            .execute(Self::stream_id(order_id), |outbox| {
                let events = if outbox.is_pending(seq) {
                    vec![OutboxEvent::MessageDispatched {
                        seq,
                        dispatched_at: Utc::now(),
                    }]
                } else {
                    vec![]
                };
                Ok::<_, DomainError>(events)
            })
            .await?;
        self.track(order_id, result.aggregate.pending_count() > 0)
            .await;
        Ok(())
    }

    /// Records a failed dispatch attempt; the entry stays pending.
    pub async fn record_failure(
        &self,
        order_id: AggregateId,
        seq: u64,
        error: impl Into<String>,
    ) -> Result<()> {
        let error = error.into();
        self.handler
            .execute(Self::stream_id(order_id), |outbox| {
                let events = if outbox.is_pending(seq) {
                    vec![OutboxEvent::DispatchFailed {
                        seq,
                        error,
                        failed_at: Utc::now(),
                    }]
                } else {
                    vec![]
                };
                Ok::<_, DomainError>(events)
            })
            .await?;
        Ok(())
    }

    /// Orders that still have undispatched entries.
    ///
    /// The first call scans every outbox stream in the store; later calls
    /// read the index kept up to date by enqueue and dispatch.
    pub async fn orders_with_pending(&self) -> Result<Vec<AggregateId>> {
        let mut pending = self.pending.lock().await;
        if pending.is_none() {
            *pending = Some(self.scan_pending().await?);
        }
        Ok(pending
            .as_ref()
            .map(|orders| orders.iter().copied().collect())
            .unwrap_or_default())
    }

    async fn scan_pending(&self) -> Result<HashSet<AggregateId>> {
        let mut orders = HashSet::new();
        for outbox_id in self
            .handler
            .store()
            .aggregates_with_event("MessageEnqueued")
            .await?
        {
            let outbox = self.handler.load(outbox_id).await?;
            if outbox.pending_count() == 0 {
                continue;
            }
            if let Some(order_id) = outbox.order_id() {
                orders.insert(order_id);
            }
        }
        tracing::debug!(orders = orders.len(), "outbox index built");
        Ok(orders)
    }

    async fn track(&self, order_id: AggregateId, has_pending: bool) {
        if let Some(orders) = self.pending.lock().await.as_mut() {
            if has_pending {
                orders.insert(order_id);
            } else {
                orders.remove(&order_id);
            }
        }
    }
}
