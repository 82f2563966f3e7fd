use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::{
    AggregateId, EventEnvelope, EventStoreError, Result, Version,
    store::{AppendOptions, EventStore, EventStream, validate_events_for_append},
};

#[derive(Default)]
struct Log {
    events: Vec<EventEnvelope>,
    /// Positions in `events` per stream, in version order.
    streams: HashMap<AggregateId, Vec<usize>>,
}

impl Log {
    fn version_of(&self, aggregate_id: AggregateId) -> Version {
        self.streams
            .get(&aggregate_id)
            .and_then(|positions| positions.last())
            .map(|&pos| self.events[pos].version)
            .unwrap_or(Version::initial())
    }
}

/// In-memory event store.
///
/// Cheap to clone; clones share the same log.
#[derive(Clone, Default)]
pub struct InMemoryEventStore {
    log: Arc<RwLock<Log>>,
}

impl InMemoryEventStore {
    /// Creates a new empty in-memory event store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the total number of events stored.
    pub async fn event_count(&self) -> usize {
        self.log.read().await.events.len()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append(&self, events: Vec<EventEnvelope>, options: AppendOptions) -> Result<Version> {
        validate_events_for_append(&events)?;

        let aggregate_id = events[0].aggregate_id;
        let first_new_version = events[0].version;

        let mut log = self.log.write().await;
        let current_version = log.version_of(aggregate_id);

        if let Some(expected) = options.expected_version
            && current_version != expected
        {
            return Err(EventStoreError::ConcurrencyConflict {
                aggregate_id,
                expected,
                actual: current_version,
            });
        }

        if first_new_version != current_version.next() {
            return Err(EventStoreError::ConcurrencyConflict {
                aggregate_id,
                expected: options.expected_version.unwrap_or(current_version),
                actual: current_version,
            });
        }

        let last_version = first_new_version.as_i64() + events.len() as i64 - 1;
        for event in events {
            let position = log.events.len();
            log.events.push(event);
            log.streams.entry(aggregate_id).or_default().push(position);
        }

        Ok(Version::new(last_version))
    }

    async fn get_events_for_aggregate(
        &self,
        aggregate_id: AggregateId,
    ) -> Result<Vec<EventEnvelope>> {
        let log = self.log.read().await;
        Ok(log
            .streams
            .get(&aggregate_id)
            .map(|positions| {
                positions
                    .iter()
                    .map(|&pos| log.events[pos].clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get_events_by_type(&self, event_type: &str) -> Result<Vec<EventEnvelope>> {
        let log = self.log.read().await;
        Ok(log
            .events
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect())
    }

    async fn stream_all_events(&self) -> Result<EventStream> {
        use futures_util::stream;

        let events = self.log.read().await.events.clone();
        Ok(Box::pin(stream::iter(events.into_iter().map(Ok))))
    }

    async fn get_aggregate_version(&self, aggregate_id: AggregateId) -> Result<Option<Version>> {
        let log = self.log.read().await;
        Ok(log
            .streams
            .contains_key(&aggregate_id)
            .then(|| log.version_of(aggregate_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EventStoreExt;

    fn create_test_event(
        aggregate_id: AggregateId,
        version: Version,
        event_type: &str,
    ) -> EventEnvelope {
        EventEnvelope::builder()
            .aggregate_id(aggregate_id)
            .aggregate_type("TestStream")
            .event_type(event_type)
            .version(version)
            .payload_raw(serde_json::json!({"test": true}))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn append_single_event() {
        let store = InMemoryEventStore::new();
        let aggregate_id = AggregateId::new();
        let event = create_test_event(aggregate_id, Version::first(), "TestEvent");

        let version = store
            .append(vec![event], AppendOptions::expect_new())
            .await
            .unwrap();
        assert_eq!(version, Version::first());

        let events = store.get_events_for_aggregate(aggregate_id).await.unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn append_batch_returns_last_version() {
        let store = InMemoryEventStore::new();
        let aggregate_id = AggregateId::new();

        let events = vec![
            create_test_event(aggregate_id, Version::new(1), "Event1"),
            create_test_event(aggregate_id, Version::new(2), "Event2"),
            create_test_event(aggregate_id, Version::new(3), "Event3"),
        ];

        let version = store
            .append(events, AppendOptions::expect_new())
            .await
            .unwrap();
        assert_eq!(version, Version::new(3));
        assert_eq!(
            store.get_aggregate_version(aggregate_id).await.unwrap(),
            Some(Version::new(3))
        );
    }

    #[tokio::test]
    async fn concurrency_conflict_on_wrong_version() {
        let store = InMemoryEventStore::new();
        let aggregate_id = AggregateId::new();

        store
            .append(
                vec![create_test_event(aggregate_id, Version::first(), "Event1")],
                AppendOptions::expect_new(),
            )
            .await
            .unwrap();

        let result = store
            .append(
                vec![create_test_event(aggregate_id, Version::new(2), "Event2")],
                AppendOptions::expect_version(Version::initial()),
            )
            .await;

        assert!(matches!(
            result,
            Err(EventStoreError::ConcurrencyConflict { .. })
        ));
    }

    #[tokio::test]
    async fn unchecked_append_still_rejects_version_gaps() {
        let store = InMemoryEventStore::new();
        let aggregate_id = AggregateId::new();

        let result = store
            .append(
                vec![create_test_event(aggregate_id, Version::new(3), "Event3")],
                AppendOptions::new(),
            )
            .await;
        assert!(matches!(
            result,
            Err(EventStoreError::ConcurrencyConflict { .. })
        ));
    }

    #[tokio::test]
    async fn rejects_empty_and_mixed_batches() {
        let store = InMemoryEventStore::new();
        assert!(matches!(
            store.append(vec![], AppendOptions::new()).await,
            Err(EventStoreError::InvalidAppend(_))
        ));

        let mixed = vec![
            create_test_event(AggregateId::new(), Version::new(1), "Event1"),
            create_test_event(AggregateId::new(), Version::new(2), "Event2"),
        ];
        assert!(matches!(
            store.append(mixed, AppendOptions::new()).await,
            Err(EventStoreError::InvalidAppend(_))
        ));
    }

    #[tokio::test]
    async fn get_events_by_type_and_distinct_streams() {
        let store = InMemoryEventStore::new();
        let id1 = AggregateId::new();
        let id2 = AggregateId::new();

        for (id, version, kind) in [
            (id1, 1, "SagaStarted"),
            (id2, 1, "SagaStarted"),
            (id1, 2, "SagaCompleted"),
        ] {
            store
                .append(
                    vec![create_test_event(id, Version::new(version), kind)],
                    AppendOptions::new(),
                )
                .await
                .unwrap();
        }

        assert_eq!(store.get_events_by_type("SagaStarted").await.unwrap().len(), 2);
        assert_eq!(
            store.aggregates_with_event("SagaStarted").await.unwrap(),
            vec![id1, id2]
        );
        assert_eq!(
            store.aggregates_with_event("SagaCompleted").await.unwrap(),
            vec![id1]
        );
    }

    #[tokio::test]
    async fn stream_all_events_in_append_order() {
        use futures_util::StreamExt;

        let store = InMemoryEventStore::new();
        let id1 = AggregateId::new();
        let id2 = AggregateId::new();

        store
            .append(
                vec![create_test_event(id1, Version::first(), "Event1")],
                AppendOptions::new(),
            )
            .await
            .unwrap();
        store
            .append(
                vec![create_test_event(id2, Version::first(), "Event2")],
                AppendOptions::new(),
            )
            .await
            .unwrap();

        let stream = store.stream_all_events().await.unwrap();
        let events: Vec<_> = stream.collect().await;
        let types: Vec<_> = events
            .into_iter()
            .map(|e| e.unwrap().event_type)
            .collect();
        assert_eq!(types, vec!["Event1", "Event2"]);
    }

    #[tokio::test]
    async fn missing_stream_has_no_version() {
        let store = InMemoryEventStore::new();
        let aggregate_id = AggregateId::new();
        assert!(store.get_aggregate_version(aggregate_id).await.unwrap().is_none());
        assert!(!store.aggregate_exists(aggregate_id).await.unwrap());
    }
}
