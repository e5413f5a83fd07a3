use std::collections::HashMap;
use std::sync::RwLock;

use tally_core::{AggregateId, ExpectedVersion};

use super::r#trait::{EventStore, EventStoreError, StoredEvent, UncommittedEvent, validate_batch};

#[derive(Debug, Default)]
struct Inner {
    streams: HashMap<AggregateId, Vec<StoredEvent>>,
    /// Every committed event, in global append order.
    log: Vec<StoredEvent>,
}

/// In-memory append-only event store.
///
/// Intended for tests/dev. Not optimized for performance.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    inner: RwLock<Inner>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn current_version(stream: &[StoredEvent]) -> u64 {
        stream.last().map(|e| e.sequence_number).unwrap_or(0)
    }
}

impl EventStore for InMemoryEventStore {
    fn append(
        &self,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        if events.is_empty() {
            return Ok(vec![]);
        }
        validate_batch(&events)?;

        let aggregate_id = events[0].aggregate_id.clone();
        let aggregate_type = events[0].aggregate_type.clone();

        let mut inner = self
            .inner
            .write()
            .map_err(|_| EventStoreError::Unavailable("lock poisoned".to_string()))?;
        let Inner { streams, log } = &mut *inner;

        let stream = streams.entry(aggregate_id).or_default();
        let current = Self::current_version(stream);

        if !expected_version.matches(current) {
            return Err(EventStoreError::Concurrency(format!(
                "expected {expected_version:?}, found {current}"
            )));
        }

        if let Some(existing) = stream.first() {
            if existing.aggregate_type != aggregate_type {
                return Err(EventStoreError::AggregateTypeMismatch(format!(
                    "stream aggregate_type is '{}', attempted append with '{}'",
                    existing.aggregate_type, aggregate_type
                )));
            }
        }

        let mut next = current + 1;
        let mut committed = Vec::with_capacity(events.len());
        for e in events {
            let stored = StoredEvent {
                event_id: e.event_id,
                aggregate_id: e.aggregate_id,
                aggregate_type: e.aggregate_type,
                sequence_number: next,
                global_position: log.len() as u64 + 1,
                event_type: e.event_type,
                event_version: e.event_version,
                occurred_at: e.occurred_at,
                payload: e.payload,
            };
            next += 1;
            stream.push(stored.clone());
            log.push(stored.clone());
            committed.push(stored);
        }

        Ok(committed)
    }

    fn load_stream(&self, aggregate_id: &AggregateId) -> Result<Vec<StoredEvent>, EventStoreError> {
        let inner = self
            .inner
            .read()
            .map_err(|_| EventStoreError::Unavailable("lock poisoned".to_string()))?;

        Ok(inner.streams.get(aggregate_id).cloned().unwrap_or_default())
    }

    fn load_all(&self) -> Result<Vec<StoredEvent>, EventStoreError> {
        let inner = self
            .inner
            .read()
            .map_err(|_| EventStoreError::Unavailable("lock poisoned".to_string()))?;

        Ok(inner.log.clone())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    use super::*;

    fn uncommitted(id: &str, kind: &str) -> UncommittedEvent {
        UncommittedEvent {
            event_id: Uuid::now_v7(),
            aggregate_id: id.parse().unwrap(),
            aggregate_type: kind.to_string(),
            event_type: "test.happened".to_string(),
            event_version: 1,
            occurred_at: Utc::now(),
            payload: json!({}),
        }
    }

    #[test]
    fn append_assigns_contiguous_sequence_numbers() {
        let store = InMemoryEventStore::new();
        let first = store
            .append(vec![uncommitted("a", "t"), uncommitted("a", "t")], ExpectedVersion::Exact(0))
            .unwrap();
        let second = store.append(vec![uncommitted("a", "t")], ExpectedVersion::Exact(2)).unwrap();

        let seqs: Vec<_> = first.iter().chain(&second).map(|e| e.sequence_number).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(store.load_stream(&"a".parse().unwrap()).unwrap().len(), 3);
    }

    #[test]
    fn stale_expected_version_is_a_concurrency_error() {
        let store = InMemoryEventStore::new();
        store.append(vec![uncommitted("a", "t")], ExpectedVersion::Exact(0)).unwrap();

        let err = store.append(vec![uncommitted("a", "t")], ExpectedVersion::Exact(0)).unwrap_err();
        assert!(err.is_concurrency());
        assert_eq!(store.load_stream(&"a".parse().unwrap()).unwrap().len(), 1);
    }

    #[test]
    fn mixed_batches_and_type_changes_are_rejected() {
        let store = InMemoryEventStore::new();
        let err = store
            .append(vec![uncommitted("a", "t"), uncommitted("b", "t")], ExpectedVersion::Any)
            .unwrap_err();
        assert!(matches!(err, EventStoreError::InvalidAppend(_)));

        store.append(vec![uncommitted("a", "t")], ExpectedVersion::Any).unwrap();
        let err = store.append(vec![uncommitted("a", "other")], ExpectedVersion::Any).unwrap_err();
        assert!(matches!(err, EventStoreError::AggregateTypeMismatch(_)));
    }

    #[test]
    fn load_all_interleaves_streams_in_append_order() {
        let store = InMemoryEventStore::new();
        store.append(vec![uncommitted("a", "t")], ExpectedVersion::Any).unwrap();
        store.append(vec![uncommitted("b", "t")], ExpectedVersion::Any).unwrap();
        store.append(vec![uncommitted("a", "t")], ExpectedVersion::Any).unwrap();

        let all = store.load_all().unwrap();
        let order: Vec<_> = all
            .iter()
            .map(|e| (e.aggregate_id.to_string(), e.sequence_number, e.global_position))
            .collect();
        assert_eq!(
            order,
            vec![("a".into(), 1, 1), ("b".into(), 1, 2), ("a".into(), 2, 3)]
        );
    }
}
