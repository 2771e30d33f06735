//! PostgreSQL-backed snapshot store.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::{PgPool, Row};

use chronicle_core::CancellationToken;
use chronicle_core::error::Error;
use chronicle_core::identity::AggregateId;
use chronicle_core::metadata::Metadata;
use chronicle_core::retry::{RetryStrategy, retry_transient};
use chronicle_core::snapshot::{Snapshot, SnapshotStore};

use crate::error::{PgError, to_i64, to_u64};
use crate::pg_retry::PgRetryStrategy;

/// Stores the newest snapshot of each aggregate in `chronicle_snapshots`.
#[derive(Clone)]
pub struct PgSnapshotStore {
    pool: PgPool,
    retry: Arc<dyn RetryStrategy<PgError>>,
}

impl std::fmt::Debug for PgSnapshotStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgSnapshotStore").finish_non_exhaustive()
    }
}

impl PgSnapshotStore {
    /// Creates a new `PgSnapshotStore` with the default retry strategy.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            retry: Arc::new(PgRetryStrategy::default()),
        }
    }

    /// Replaces the transient-failure retry strategy.
    #[must_use]
    pub fn with_retry_strategy(mut self, retry: Arc<dyn RetryStrategy<PgError>>) -> Self {
        self.retry = retry;
        self
    }

    async fn try_load(
        &self,
        aggregate_name: &str,
        aggregate_id: &AggregateId,
    ) -> Result<Option<Snapshot>, PgError> {
        let row = sqlx::query(
            r"
            SELECT aggregate_sequence_number, state, metadata
            FROM chronicle_snapshots
            WHERE aggregate_name = $1 AND aggregate_id = $2
            ",
        )
        .bind(aggregate_name)
        .bind(aggregate_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let sequence_number: i64 = row.try_get("aggregate_sequence_number")?;
        let state: Json<serde_json::Value> = row.try_get("state")?;
        let metadata: Json<Metadata> = row.try_get("metadata")?;
        Ok(Some(Snapshot {
            aggregate_id: aggregate_id.clone(),
            aggregate_name: aggregate_name.to_owned(),
            aggregate_sequence_number: to_u64(sequence_number, "aggregate_sequence_number")?,
            state: state.0,
            metadata: metadata.0,
        }))
    }

    async fn try_store(&self, snapshot: &Snapshot) -> Result<u64, PgError> {
        // Only replace a strictly older snapshot.
        let result = sqlx::query(
            r"
            INSERT INTO chronicle_snapshots
                (aggregate_name, aggregate_id, aggregate_sequence_number, state, metadata)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (aggregate_name, aggregate_id)
            DO UPDATE SET aggregate_sequence_number = EXCLUDED.aggregate_sequence_number,
                          state = EXCLUDED.state,
                          metadata = EXCLUDED.metadata,
                          created_at = NOW()
            WHERE chronicle_snapshots.aggregate_sequence_number < EXCLUDED.aggregate_sequence_number
            ",
        )
        .bind(snapshot.aggregate_name.as_str())
        .bind(snapshot.aggregate_id.as_str())
        .bind(to_i64(snapshot.aggregate_sequence_number, "snapshot sequence number")?)
        .bind(Json(&snapshot.state))
        .bind(Json(&snapshot.metadata))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn try_delete(
        &self,
        aggregate_name: &str,
        aggregate_id: &AggregateId,
    ) -> Result<(), PgError> {
        sqlx::query(
            "DELETE FROM chronicle_snapshots WHERE aggregate_name = $1 AND aggregate_id = $2",
        )
        .bind(aggregate_name)
        .bind(aggregate_id.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl SnapshotStore for PgSnapshotStore {
    #[tracing::instrument(skip(self, cancel))]
    async fn load_snapshot(
        &self,
        aggregate_name: &str,
        aggregate_id: &AggregateId,
        cancel: &CancellationToken,
    ) -> Result<Option<Snapshot>, Error> {
        let snapshot = retry_transient(self.retry.as_ref(), Some(cancel), || {
            self.try_load(aggregate_name, aggregate_id)
        })
        .await?;
        tracing::trace!(found = snapshot.is_some(), "snapshot lookup");
        Ok(snapshot)
    }

    #[tracing::instrument(
        skip(self, snapshot),
        fields(
            aggregate_name = %snapshot.aggregate_name,
            aggregate_id = %snapshot.aggregate_id,
            version = snapshot.aggregate_sequence_number,
        )
    )]
    async fn store_snapshot(&self, snapshot: Snapshot) -> Result<(), Error> {
        let stored =
            retry_transient(self.retry.as_ref(), None, || self.try_store(&snapshot)).await?;
        tracing::debug!(stored = stored > 0, "snapshot offer evaluated");
        Ok(())
    }

    #[tracing::instrument(skip(self, cancel))]
    async fn delete_snapshots(
        &self,
        aggregate_name: &str,
        aggregate_id: &AggregateId,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        retry_transient(self.retry.as_ref(), Some(cancel), || {
            self.try_delete(aggregate_name, aggregate_id)
        })
        .await?;
        Ok(())
    }
}
