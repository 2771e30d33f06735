//! Admin command implementations.
//!
//! Commands work against the storage contracts, so the tests drive them with
//! the in-memory backends as well as `PostgreSQL`.

use std::io::Write;

use chronicle_core::CancellationToken;
use chronicle_core::error::Error;
use chronicle_core::identity::AggregateId;
use chronicle_core::persistence::EventPersistence;
use chronicle_core::snapshot::SnapshotStore;
use chronicle_event_store::schema::MIGRATOR;
use sqlx::PgPool;

use crate::error::AdminError;

/// Applies the embedded migrations.
///
/// # Errors
///
/// Returns `AdminError::Migrate` if a migration fails or the recorded
/// history does not match the embedded one.
pub async fn migrate(pool: &PgPool) -> Result<(), AdminError> {
    MIGRATOR.run(pool).await?;
    tracing::info!(migrations = MIGRATOR.iter().count(), "schema is up to date");
    Ok(())
}

/// Writes committed events from global sequence number `from` to `out`, one
/// JSON object per line, until the log is exhausted or `limit` events have
/// been written. Returns the number of events written.
///
/// # Errors
///
/// Returns `AdminError::Store` if a page cannot be read or `cancel` fires,
/// and `AdminError::Output` if writing fails.
pub async fn tail<W: Write>(
    persistence: &dyn EventPersistence,
    from: u64,
    page_size: usize,
    limit: Option<u64>,
    out: &mut W,
    cancel: &CancellationToken,
) -> Result<u64, AdminError> {
    let mut cursor = from;
    let mut written: u64 = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled.into());
        }
        let page = persistence
            .load_all_committed_events(cursor, page_size, cancel)
            .await?;
        if page.events.is_empty() {
            break;
        }
        for event in &page.events {
            if limit.is_some_and(|limit| written >= limit) {
                out.flush()?;
                return Ok(written);
            }
            serde_json::to_writer(&mut *out, event)?;
            out.write_all(b"\n")?;
            written += 1;
        }
        tracing::debug!(cursor, next = page.next_global_sequence_number, "read page");
        cursor = page.next_global_sequence_number;
    }
    out.flush()?;
    Ok(written)
}

/// Deletes every event and snapshot of one aggregate. Returns the number of
/// events deleted.
///
/// # Errors
///
/// Returns `AdminError::Store` for an empty aggregate id, a backend
/// failure, or when `cancel` fires. Events are deleted before snapshots, so
/// a purge cancelled half way leaves at most an orphaned snapshot, which
/// rerunning the purge removes.
pub async fn purge(
    persistence: &dyn EventPersistence,
    snapshots: &dyn SnapshotStore,
    aggregate_name: &str,
    aggregate_id: &str,
    cancel: &CancellationToken,
) -> Result<u64, AdminError> {
    let aggregate_id = AggregateId::new(aggregate_id)?;
    let deleted = persistence
        .delete_events(aggregate_name, &aggregate_id, cancel)
        .await?;
    snapshots
        .delete_snapshots(aggregate_name, &aggregate_id, cancel)
        .await?;
    tracing::info!(
        aggregate = aggregate_name,
        aggregate_id = %aggregate_id,
        deleted,
        "purged aggregate"
    );
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use chronicle_core::metadata::Metadata;
    use chronicle_core::persistence::{CommittedEvent, UncommittedEvent};
    use chronicle_core::snapshot::Snapshot;
    use chronicle_event_store::{InMemoryEventPersistence, InMemorySnapshotStore};
    use uuid::Uuid;

    use super::*;

    async fn seed(persistence: &InMemoryEventPersistence, aggregate_id: &str, count: u64) {
        let events: Vec<UncommittedEvent> = (1..=count)
            .map(|n| UncommittedEvent {
                aggregate_sequence_number: n,
                event_name: "ItemAdded".into(),
                event_version: 2,
                payload: serde_json::json!({ "n": n }),
                metadata: Metadata::new(),
            })
            .collect();
        persistence
            .commit_events(
                "order",
                &AggregateId::new(aggregate_id).unwrap(),
                Uuid::now_v7(),
                &events,
            )
            .await
            .unwrap();
    }

    fn lines(out: &[u8]) -> Vec<CommittedEvent> {
        String::from_utf8(out.to_vec())
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_tail_prints_every_event_across_pages() {
        // Arrange
        let persistence = InMemoryEventPersistence::new();
        seed(&persistence, "order-1", 3).await;
        seed(&persistence, "order-2", 2).await;
        let mut out = Vec::new();

        // Act
        let written = tail(&persistence, 1, 2, None, &mut out, &CancellationToken::new())
            .await
            .unwrap();

        // Assert
        assert_eq!(written, 5);
        let events = lines(&out);
        let globals: Vec<u64> = events.iter().map(|e| e.global_sequence_number).collect();
        assert_eq!(globals, vec![1, 2, 3, 4, 5]);
        assert_eq!(events[3].aggregate_id.as_str(), "order-2");
    }

    #[tokio::test]
    async fn test_tail_honours_start_and_limit() {
        let persistence = InMemoryEventPersistence::new();
        seed(&persistence, "order-1", 5).await;
        let mut out = Vec::new();

        let written = tail(&persistence, 2, 10, Some(2), &mut out, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(written, 2);
        let seqs: Vec<u64> = lines(&out)
            .iter()
            .map(|e| e.aggregate_sequence_number)
            .collect();
        assert_eq!(seqs, vec![2, 3]);
    }

    #[tokio::test]
    async fn test_tail_rejects_zero_page_size() {
        let persistence = InMemoryEventPersistence::new();
        let mut out = Vec::new();

        let result = tail(&persistence, 1, 0, None, &mut out, &CancellationToken::new()).await;

        assert!(matches!(
            result,
            Err(AdminError::Store(Error::InvalidArgument(_)))
        ));
    }

    #[tokio::test]
    async fn test_tail_stops_when_cancelled() {
        let persistence = InMemoryEventPersistence::new();
        seed(&persistence, "order-1", 1).await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut out = Vec::new();

        let result = tail(&persistence, 1, 10, None, &mut out, &cancel).await;

        assert!(matches!(result, Err(AdminError::Store(Error::Cancelled))));
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_purge_removes_events_and_snapshots() {
        // Arrange
        let persistence = InMemoryEventPersistence::new();
        let snapshots = InMemorySnapshotStore::new();
        seed(&persistence, "order-1", 3).await;
        seed(&persistence, "order-2", 1).await;
        let id = AggregateId::new("order-1").unwrap();
        snapshots
            .store_snapshot(Snapshot {
                aggregate_id: id.clone(),
                aggregate_name: "order".into(),
                aggregate_sequence_number: 3,
                state: serde_json::json!({}),
                metadata: Metadata::new(),
            })
            .await
            .unwrap();

        let cancel = CancellationToken::new();

        // Act
        let deleted = purge(&persistence, &snapshots, "order", "order-1", &cancel)
            .await
            .unwrap();

        // Assert
        assert_eq!(deleted, 3);
        assert!(
            persistence
                .load_committed_events("order", &id, 1, &cancel)
                .await
                .unwrap()
                .is_empty()
        );
        assert!(
            snapshots
                .load_snapshot("order", &id, &cancel)
                .await
                .unwrap()
                .is_none()
        );
        let other = AggregateId::new("order-2").unwrap();
        assert_eq!(
            persistence
                .load_committed_events("order", &other, 1, &cancel)
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_purge_rejects_empty_id() {
        let result = purge(
            &InMemoryEventPersistence::new(),
            &InMemorySnapshotStore::new(),
            "order",
            "",
            &CancellationToken::new(),
        )
        .await;

        assert!(matches!(
            result,
            Err(AdminError::Store(Error::InvalidAggregateId(_)))
        ));
    }
}
