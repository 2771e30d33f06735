//! Integration tests for the admin commands against `PostgreSQL`.

use chronicle_admin::commands;
use chronicle_core::CancellationToken;
use chronicle_core::identity::AggregateId;
use chronicle_core::metadata::Metadata;
use chronicle_core::persistence::{EventPersistence, UncommittedEvent};
use chronicle_core::snapshot::{Snapshot, SnapshotStore};
use chronicle_event_store::{PgEventPersistence, PgSnapshotStore};
use sqlx::PgPool;
use uuid::Uuid;

async fn seed(store: &PgEventPersistence, id: &AggregateId, count: u64) {
    let events: Vec<UncommittedEvent> = (1..=count)
        .map(|n| UncommittedEvent {
            aggregate_sequence_number: n,
            event_name: "ItemAdded".to_string(),
            event_version: 2,
            payload: serde_json::json!({"ItemAdded": {"sku": format!("sku-{n}"), "quantity": 1}}),
            metadata: Metadata::new(),
        })
        .collect();
    store
        .commit_events("order", id, Uuid::now_v7(), &events)
        .await
        .unwrap();
}

// --- migrate ---

#[sqlx::test(migrations = false)]
async fn test_migrate_creates_schema_and_is_repeatable(pool: PgPool) {
    commands::migrate(&pool).await.unwrap();
    commands::migrate(&pool).await.unwrap();

    let store = PgEventPersistence::new(pool);
    let id = AggregateId::new("order-1").unwrap();
    seed(&store, &id, 1).await;
    assert_eq!(
        store
            .load_committed_events("order", &id, 1, &CancellationToken::new())
            .await
            .unwrap()
            .len(),
        1
    );
}

// --- tail ---

#[sqlx::test(migrations = "../../migrations")]
async fn test_tail_writes_json_lines_in_global_order(pool: PgPool) {
    // Arrange
    let store = PgEventPersistence::new(pool);
    seed(&store, &AggregateId::new("order-1").unwrap(), 2).await;
    seed(&store, &AggregateId::new("order-2").unwrap(), 2).await;
    let mut out = Vec::new();

    // Act
    let written = commands::tail(&store, 1, 3, None, &mut out, &CancellationToken::new())
        .await
        .unwrap();

    // Assert
    assert_eq!(written, 4);
    let lines: Vec<serde_json::Value> = String::from_utf8(out)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    let ids: Vec<&str> = lines
        .iter()
        .map(|l| l["aggregate_id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["order-1", "order-1", "order-2", "order-2"]);
    assert!(
        lines
            .windows(2)
            .all(|w| w[0]["global_sequence_number"].as_u64() < w[1]["global_sequence_number"].as_u64())
    );
}

// --- purge ---

#[sqlx::test(migrations = "../../migrations")]
async fn test_purge_deletes_events_and_snapshot(pool: PgPool) {
    // Arrange
    let events = PgEventPersistence::new(pool.clone());
    let snapshots = PgSnapshotStore::new(pool);
    let id = AggregateId::new("order-1").unwrap();
    seed(&events, &id, 3).await;
    snapshots
        .store_snapshot(Snapshot {
            aggregate_id: id.clone(),
            aggregate_name: "order".into(),
            aggregate_sequence_number: 3,
            state: serde_json::json!({"lines": [], "submitted": false}),
            metadata: Metadata::new(),
        })
        .await
        .unwrap();

    let cancel = CancellationToken::new();

    // Act
    let deleted = commands::purge(&events, &snapshots, "order", "order-1", &cancel)
        .await
        .unwrap();

    // Assert
    assert_eq!(deleted, 3);
    assert!(
        events
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
}
