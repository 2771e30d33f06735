//! In-memory reference backends.
//!
//! Everything lives behind one `RwLock`: holding the write lock for the whole
//! commit makes a batch atomic, and the uniqueness check is a map lookup.
//! Suitable for tests and single-process tools.

use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use uuid::Uuid;

use chronicle_core::CancellationToken;
use chronicle_core::error::Error;
use chronicle_core::identity::AggregateId;
use chronicle_core::persistence::{
    CommittedEvent, EventPersistence, GlobalEventPage, UncommittedEvent, validate_batch,
};
use chronicle_core::snapshot::{Snapshot, SnapshotStore};

type StreamKey = (String, AggregateId);

#[derive(Default)]
struct Inner {
    streams: HashMap<StreamKey, BTreeMap<u64, CommittedEvent>>,
    log: BTreeMap<u64, CommittedEvent>,
    next_global_sequence_number: u64,
}

/// Event persistence held in process memory.
#[derive(Default)]
pub struct InMemoryEventPersistence {
    inner: RwLock<Inner>,
}

impl std::fmt::Debug for InMemoryEventPersistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("InMemoryEventPersistence")
            .field("streams", &inner.streams.len())
            .field("events", &inner.log.len())
            .finish()
    }
}

impl InMemoryEventPersistence {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of committed events across all aggregates.
    #[must_use]
    pub fn event_count(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .log
            .len()
    }
}

fn ensure_live(cancel: &CancellationToken) -> Result<(), Error> {
    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }
    Ok(())
}

fn key(aggregate_name: &str, aggregate_id: &AggregateId) -> StreamKey {
    (aggregate_name.to_owned(), aggregate_id.clone())
}

/// Resolves a batch that overlaps committed sequence numbers: an exact
/// re-submission returns the stored events, anything else is a conflict.
fn resolve_overlap(
    aggregate_name: &str,
    aggregate_id: &AggregateId,
    stream: &BTreeMap<u64, CommittedEvent>,
    batch_id: Uuid,
    events: &[UncommittedEvent],
) -> Result<Vec<CommittedEvent>, Error> {
    let stored: Option<Vec<CommittedEvent>> = events
        .iter()
        .map(|event| {
            stream
                .get(&event.aggregate_sequence_number)
                .filter(|committed| event.is_committed_as(committed, batch_id))
                .cloned()
        })
        .collect();
    stored.ok_or_else(|| Error::Concurrency {
        aggregate_name: aggregate_name.to_owned(),
        aggregate_id: aggregate_id.clone(),
        sequence_number: events
            .iter()
            .map(|e| e.aggregate_sequence_number)
            .find(|seq| stream.contains_key(seq))
            .unwrap_or_default(),
    })
}

#[async_trait]
impl EventPersistence for InMemoryEventPersistence {
    #[tracing::instrument(skip(self, events), fields(event_count = events.len()))]
    async fn commit_events(
        &self,
        aggregate_name: &str,
        aggregate_id: &AggregateId,
        batch_id: Uuid,
        events: &[UncommittedEvent],
    ) -> Result<Vec<CommittedEvent>, Error> {
        validate_batch(events)?;
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let stream_key = key(aggregate_name, aggregate_id);

        if let Some(stream) = inner.streams.get(&stream_key) {
            if events
                .iter()
                .any(|e| stream.contains_key(&e.aggregate_sequence_number))
            {
                let stored = resolve_overlap(aggregate_name, aggregate_id, stream, batch_id, events)?;
                tracing::debug!("batch already committed");
                return Ok(stored);
            }
        }

        let mut committed = Vec::with_capacity(events.len());
        for event in events {
            inner.next_global_sequence_number += 1;
            committed.push(CommittedEvent {
                aggregate_id: aggregate_id.clone(),
                aggregate_name: aggregate_name.to_owned(),
                aggregate_sequence_number: event.aggregate_sequence_number,
                global_sequence_number: inner.next_global_sequence_number,
                event_name: event.event_name.clone(),
                event_version: event.event_version,
                payload: event.payload.clone(),
                metadata: event.metadata.clone(),
                batch_id,
            });
        }
        for event in &committed {
            inner
                .log
                .insert(event.global_sequence_number, event.clone());
        }
        inner.streams.entry(stream_key).or_default().extend(
            committed
                .iter()
                .map(|e| (e.aggregate_sequence_number, e.clone())),
        );
        drop(inner);
        tracing::debug!("events committed to stream");
        Ok(committed)
    }

    #[tracing::instrument(skip(self, cancel))]
    async fn load_committed_events(
        &self,
        aggregate_name: &str,
        aggregate_id: &AggregateId,
        from_sequence_number: u64,
        cancel: &CancellationToken,
    ) -> Result<Vec<CommittedEvent>, Error> {
        ensure_live(cancel)?;
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        Ok(inner
            .streams
            .get(&key(aggregate_name, aggregate_id))
            .map(|stream| {
                stream
                    .range(from_sequence_number..)
                    .map(|(_, e)| e.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    #[tracing::instrument(skip(self, cancel))]
    async fn load_all_committed_events(
        &self,
        from_global_sequence_number: u64,
        page_size: usize,
        cancel: &CancellationToken,
    ) -> Result<GlobalEventPage, Error> {
        ensure_live(cancel)?;
        if page_size == 0 {
            return Err(Error::InvalidArgument("page size must be positive".into()));
        }
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let events: Vec<CommittedEvent> = inner
            .log
            .range(from_global_sequence_number..)
            .take(page_size)
            .map(|(_, e)| e.clone())
            .collect();
        let next_global_sequence_number = events
            .last()
            .map_or(from_global_sequence_number, |e| e.global_sequence_number + 1);
        Ok(GlobalEventPage {
            events,
            next_global_sequence_number,
        })
    }

    #[tracing::instrument(skip(self, cancel))]
    async fn delete_events(
        &self,
        aggregate_name: &str,
        aggregate_id: &AggregateId,
        cancel: &CancellationToken,
    ) -> Result<u64, Error> {
        ensure_live(cancel)?;
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let Some(stream) = inner.streams.remove(&key(aggregate_name, aggregate_id)) else {
            return Ok(0);
        };
        for event in stream.values() {
            inner.log.remove(&event.global_sequence_number);
        }
        tracing::info!(removed = stream.len(), "purged aggregate events");
        Ok(stream.len() as u64)
    }
}

/// Snapshot store held in process memory. Keeps only the newest snapshot per
/// aggregate.
#[derive(Debug, Default)]
pub struct InMemorySnapshotStore {
    snapshots: RwLock<HashMap<StreamKey, Snapshot>>,
}

impl InMemorySnapshotStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn load_snapshot(
        &self,
        aggregate_name: &str,
        aggregate_id: &AggregateId,
        cancel: &CancellationToken,
    ) -> Result<Option<Snapshot>, Error> {
        ensure_live(cancel)?;
        Ok(self
            .snapshots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key(aggregate_name, aggregate_id))
            .cloned())
    }

    async fn store_snapshot(&self, snapshot: Snapshot) -> Result<(), Error> {
        let mut snapshots = self
            .snapshots
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let stream_key = key(&snapshot.aggregate_name, &snapshot.aggregate_id);
        let newer = snapshots
            .get(&stream_key)
            .is_none_or(|current| current.aggregate_sequence_number < snapshot.aggregate_sequence_number);
        if newer {
            snapshots.insert(stream_key, snapshot);
        }
        Ok(())
    }

    async fn delete_snapshots(
        &self,
        aggregate_name: &str,
        aggregate_id: &AggregateId,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        ensure_live(cancel)?;
        self.snapshots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&key(aggregate_name, aggregate_id));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chronicle_core::metadata::Metadata;

    use super::*;

    fn id(value: &str) -> AggregateId {
        AggregateId::new(value).unwrap()
    }

    fn event(seq: u64, payload: serde_json::Value) -> UncommittedEvent {
        UncommittedEvent {
            aggregate_sequence_number: seq,
            event_name: "ItemAdded".into(),
            event_version: 2,
            payload,
            metadata: Metadata::new(),
        }
    }

    fn batch(seqs: std::ops::RangeInclusive<u64>) -> Vec<UncommittedEvent> {
        seqs.map(|seq| event(seq, serde_json::json!({ "seq": seq })))
            .collect()
    }

    #[tokio::test]
    async fn test_commit_assigns_increasing_global_numbers() {
        // Arrange
        let store = InMemoryEventPersistence::new();

        // Act
        let first = store
            .commit_events("order", &id("order-1"), Uuid::now_v7(), &batch(1..=2))
            .await
            .unwrap();
        let second = store
            .commit_events("order", &id("order-2"), Uuid::now_v7(), &batch(1..=1))
            .await
            .unwrap();

        // Assert
        let globals: Vec<u64> = first
            .iter()
            .chain(&second)
            .map(|e| e.global_sequence_number)
            .collect();
        assert_eq!(globals, vec![1, 2, 3]);
        assert_eq!(store.event_count(), 3);
    }

    #[tokio::test]
    async fn test_commit_rejects_taken_sequence_number() {
        let store = InMemoryEventPersistence::new();
        store
            .commit_events("order", &id("order-1"), Uuid::now_v7(), &batch(1..=2))
            .await
            .unwrap();

        let result = store
            .commit_events("order", &id("order-1"), Uuid::now_v7(), &batch(2..=3))
            .await;

        match result {
            Err(Error::Concurrency {
                sequence_number, ..
            }) => assert_eq!(sequence_number, 2),
            other => panic!("expected Concurrency, got {other:?}"),
        }
        let loaded = store
            .load_committed_events("order", &id("order-1"), 1, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(loaded.len(), 2);
    }

    #[tokio::test]
    async fn test_resubmitted_batch_is_idempotent() {
        // Arrange
        let store = InMemoryEventPersistence::new();
        let batch_id = Uuid::now_v7();
        let events = batch(1..=2);
        let first = store
            .commit_events("order", &id("order-1"), batch_id, &events)
            .await
            .unwrap();

        // Act
        let second = store
            .commit_events("order", &id("order-1"), batch_id, &events)
            .await
            .unwrap();

        // Assert
        assert_eq!(first, second);
        assert_eq!(store.event_count(), 2);
    }

    #[tokio::test]
    async fn test_same_batch_id_with_different_content_conflicts() {
        let store = InMemoryEventPersistence::new();
        let batch_id = Uuid::now_v7();
        store
            .commit_events("order", &id("order-1"), batch_id, &batch(1..=1))
            .await
            .unwrap();

        let result = store
            .commit_events(
                "order",
                &id("order-1"),
                batch_id,
                &[event(1, serde_json::json!({"other": true}))],
            )
            .await;

        assert!(result.unwrap_err().is_concurrency_conflict());
    }

    #[tokio::test]
    async fn test_partial_overlap_conflicts() {
        let store = InMemoryEventPersistence::new();
        let batch_id = Uuid::now_v7();
        store
            .commit_events("order", &id("order-1"), batch_id, &batch(1..=1))
            .await
            .unwrap();

        let result = store
            .commit_events("order", &id("order-1"), batch_id, &batch(1..=2))
            .await;

        assert!(result.unwrap_err().is_concurrency_conflict());
        assert_eq!(store.event_count(), 1);
    }

    #[tokio::test]
    async fn test_commit_rejects_invalid_batches() {
        let store = InMemoryEventPersistence::new();

        let empty = store
            .commit_events("order", &id("order-1"), Uuid::now_v7(), &[])
            .await;
        let gapped = store
            .commit_events(
                "order",
                &id("order-1"),
                Uuid::now_v7(),
                &[event(1, serde_json::json!({})), event(3, serde_json::json!({}))],
            )
            .await;

        assert!(matches!(empty, Err(Error::InvalidBatch(_))));
        assert!(matches!(gapped, Err(Error::InvalidBatch(_))));
    }

    #[tokio::test]
    async fn test_streams_are_namespaced_by_aggregate_name() {
        let store = InMemoryEventPersistence::new();
        store
            .commit_events("order", &id("42"), Uuid::now_v7(), &batch(1..=1))
            .await
            .unwrap();

        let result = store
            .commit_events("invoice", &id("42"), Uuid::now_v7(), &batch(1..=1))
            .await;

        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_load_from_sequence_number_is_inclusive() {
        let store = InMemoryEventPersistence::new();
        store
            .commit_events("order", &id("order-1"), Uuid::now_v7(), &batch(1..=5))
            .await
            .unwrap();

        let loaded = store
            .load_committed_events("order", &id("order-1"), 3, &CancellationToken::new())
            .await
            .unwrap();

        let seqs: Vec<u64> = loaded.iter().map(|e| e.aggregate_sequence_number).collect();
        assert_eq!(seqs, vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn test_global_pages_resume_from_cursor() {
        // Arrange
        let store = InMemoryEventPersistence::new();
        for name in ["a", "b", "c"] {
            store
                .commit_events("order", &id(name), Uuid::now_v7(), &batch(1..=2))
                .await
                .unwrap();
        }

        // Act
        let mut cursor = 1;
        let mut seen = Vec::new();
        loop {
            let page = store
                .load_all_committed_events(cursor, 4, &CancellationToken::new())
                .await
                .unwrap();
            if page.events.is_empty() {
                assert_eq!(page.next_global_sequence_number, cursor);
                break;
            }
            seen.extend(page.events.iter().map(|e| e.global_sequence_number));
            cursor = page.next_global_sequence_number;
        }

        // Assert
        assert_eq!(seen, vec![1, 2, 3, 4, 5, 6]);
    }

    #[tokio::test]
    async fn test_zero_page_size_is_rejected() {
        let store = InMemoryEventPersistence::new();

        let result = store.load_all_committed_events(1, 0, &CancellationToken::new()).await;

        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_reads_refuse_cancelled_token() {
        let store = InMemoryEventPersistence::new();
        store
            .commit_events("order", &id("order-1"), Uuid::now_v7(), &batch(1..=2))
            .await
            .unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let stream = store
            .load_committed_events("order", &id("order-1"), 1, &cancel)
            .await;
        let page = store.load_all_committed_events(1, 10, &cancel).await;

        assert!(matches!(stream, Err(Error::Cancelled)));
        assert!(matches!(page, Err(Error::Cancelled)));
        assert_eq!(store.event_count(), 2);
    }

    #[tokio::test]
    async fn test_delete_events_removes_stream_and_global_entries() {
        let store = InMemoryEventPersistence::new();
        store
            .commit_events("order", &id("order-1"), Uuid::now_v7(), &batch(1..=3))
            .await
            .unwrap();
        store
            .commit_events("order", &id("order-2"), Uuid::now_v7(), &batch(1..=1))
            .await
            .unwrap();

        let removed = store
            .delete_events("order", &id("order-1"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(removed, 3);
        let page = store.load_all_committed_events(1, 10, &CancellationToken::new()).await.unwrap();
        assert_eq!(page.events.len(), 1);
        assert_eq!(page.events[0].aggregate_id, id("order-2"));
        assert_eq!(
            store
                .delete_events("order", &id("order-1"), &CancellationToken::new())
                .await
                .unwrap(),
            0,
        );
    }

    #[tokio::test]
    async fn test_concurrent_writers_to_one_sequence_number_have_one_winner() {
        // Arrange
        let store = Arc::new(InMemoryEventPersistence::new());

        // Act
        let handles: Vec<_> = (0..8)
            .map(|n| {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    store
                        .commit_events(
                            "order",
                            &id("order-1"),
                            Uuid::now_v7(),
                            &[event(1, serde_json::json!({ "writer": n }))],
                        )
                        .await
                })
            })
            .collect();
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                winners += 1;
            }
        }

        // Assert
        assert_eq!(winners, 1);
        assert_eq!(store.event_count(), 1);
    }

    fn snapshot(seq: u64) -> Snapshot {
        Snapshot {
            aggregate_id: id("order-1"),
            aggregate_name: "order".into(),
            aggregate_sequence_number: seq,
            state: serde_json::json!({ "seq": seq }),
            metadata: Metadata::new(),
        }
    }

    #[tokio::test]
    async fn test_snapshot_store_keeps_newest() {
        let store = InMemorySnapshotStore::new();

        store.store_snapshot(snapshot(10)).await.unwrap();
        store.store_snapshot(snapshot(5)).await.unwrap();

        let loaded = store
            .load_snapshot("order", &id("order-1"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(loaded.unwrap().aggregate_sequence_number, 10);
    }

    #[tokio::test]
    async fn test_delete_snapshots() {
        let store = InMemorySnapshotStore::new();
        store.store_snapshot(snapshot(10)).await.unwrap();

        store.delete_snapshots("order", &id("order-1"), &CancellationToken::new()).await.unwrap();

        assert!(store
            .load_snapshot("order", &id("order-1"), &CancellationToken::new())
            .await
            .unwrap()
            .is_none());
    }
}
