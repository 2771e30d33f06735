//! `PostgreSQL` implementation of the `EventPersistence` trait.
//!
//! Each batch is inserted in one transaction. The unique constraint on
//! `(aggregate_name, aggregate_id, aggregate_sequence_number)` detects
//! conflicting writers; a violation is first checked against the stored rows
//! so that a re-submitted batch succeeds instead of conflicting.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use uuid::Uuid;

use chronicle_core::CancellationToken;
use chronicle_core::error::Error;
use chronicle_core::identity::AggregateId;
use chronicle_core::metadata::Metadata;
use chronicle_core::persistence::{
    CommittedEvent, EventPersistence, GlobalEventPage, UncommittedEvent, validate_batch,
};
use chronicle_core::retry::{RetryStrategy, retry_transient};

use crate::error::{PgError, to_i32_version, to_i64, to_u64};
use crate::pg_retry::PgRetryStrategy;
use crate::schema::COMMIT_LOCK_KEY;

/// SQLSTATE for `unique_violation`.
const UNIQUE_VIOLATION: &str = "23505";

const SELECT_COLUMNS: &str = "SELECT global_sequence_number, aggregate_name, aggregate_id, \
     aggregate_sequence_number, event_name, event_version, payload, metadata, batch_id \
     FROM chronicle_events";

/// PostgreSQL-backed event persistence.
#[derive(Clone)]
pub struct PgEventPersistence {
    pool: PgPool,
    retry: Arc<dyn RetryStrategy<PgError>>,
}

impl std::fmt::Debug for PgEventPersistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgEventPersistence").finish_non_exhaustive()
    }
}

impl PgEventPersistence {
    /// Creates a new `PgEventPersistence` with the default retry strategy.
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

    async fn try_commit(
        &self,
        aggregate_name: &str,
        aggregate_id: &AggregateId,
        batch_id: Uuid,
        events: &[UncommittedEvent],
        binds: &[(i64, i32)],
    ) -> Result<Vec<CommittedEvent>, PgError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(COMMIT_LOCK_KEY)
            .execute(&mut *tx)
            .await?;

        let mut qb = QueryBuilder::<Postgres>::new(
            "INSERT INTO chronicle_events (aggregate_name, aggregate_id, \
             aggregate_sequence_number, event_name, event_version, payload, metadata, batch_id) ",
        );
        qb.push_values(events.iter().zip(binds), |mut b, (event, &(sequence, version))| {
            b.push_bind(aggregate_name);
            b.push_bind(aggregate_id.as_str());
            b.push_bind(sequence);
            b.push_bind(event.event_name.as_str());
            b.push_bind(version);
            b.push_bind(Json(&event.payload));
            b.push_bind(Json(&event.metadata));
            b.push_bind(batch_id);
        });
        qb.push(" RETURNING global_sequence_number");

        let globals: Vec<i64> = match qb.build_query_scalar().fetch_all(&mut *tx).await {
            Ok(globals) => globals,
            Err(sqlx::Error::Database(db)) if db.code().as_deref() == Some(UNIQUE_VIOLATION) => {
                tx.rollback().await?;
                return self
                    .resolve_conflict(aggregate_name, aggregate_id, batch_id, events)
                    .await;
            }
            Err(e) => return Err(e.into()),
        };
        tx.commit().await?;

        events
            .iter()
            .zip(globals)
            .map(|(event, global)| {
                Ok(CommittedEvent {
                    aggregate_id: aggregate_id.clone(),
                    aggregate_name: aggregate_name.to_owned(),
                    aggregate_sequence_number: event.aggregate_sequence_number,
                    global_sequence_number: to_u64(global, "global_sequence_number")?,
                    event_name: event.event_name.clone(),
                    event_version: event.event_version,
                    payload: event.payload.clone(),
                    metadata: event.metadata.clone(),
                    batch_id,
                })
            })
            .collect()
    }

    /// Returns the stored batch if it is an exact re-submission, otherwise
    /// the concurrency conflict.
    async fn resolve_conflict(
        &self,
        aggregate_name: &str,
        aggregate_id: &AggregateId,
        batch_id: Uuid,
        events: &[UncommittedEvent],
    ) -> Result<Vec<CommittedEvent>, PgError> {
        let first = events.first().map_or(0, |e| e.aggregate_sequence_number);
        let last = events.last().map_or(0, |e| e.aggregate_sequence_number);
        let rows = sqlx::query(&format!(
            "{SELECT_COLUMNS} WHERE aggregate_name = $1 AND aggregate_id = $2 \
             AND aggregate_sequence_number BETWEEN $3 AND $4 \
             ORDER BY aggregate_sequence_number ASC"
        ))
        .bind(aggregate_name)
        .bind(aggregate_id.as_str())
        .bind(to_i64(first, "aggregate sequence number")?)
        .bind(to_i64(last, "aggregate sequence number")?)
        .fetch_all(&self.pool)
        .await?;
        let stored = decode_rows(&rows)?;

        let resubmitted = stored.len() == events.len()
            && events
                .iter()
                .zip(&stored)
                .all(|(event, committed)| event.is_committed_as(committed, batch_id));
        if resubmitted {
            tracing::debug!("batch already committed");
            return Ok(stored);
        }
        Err(PgError::Core(Error::Concurrency {
            aggregate_name: aggregate_name.to_owned(),
            aggregate_id: aggregate_id.clone(),
            sequence_number: stored
                .first()
                .map_or(first, |e| e.aggregate_sequence_number),
        }))
    }

    async fn try_load(
        &self,
        aggregate_name: &str,
        aggregate_id: &AggregateId,
        from_sequence_number: u64,
    ) -> Result<Vec<CommittedEvent>, PgError> {
        let rows = sqlx::query(&format!(
            "{SELECT_COLUMNS} WHERE aggregate_name = $1 AND aggregate_id = $2 \
             AND aggregate_sequence_number >= $3 \
             ORDER BY aggregate_sequence_number ASC"
        ))
        .bind(aggregate_name)
        .bind(aggregate_id.as_str())
        .bind(to_i64(from_sequence_number, "aggregate sequence number")?)
        .fetch_all(&self.pool)
        .await?;
        decode_rows(&rows)
    }

    async fn try_load_all(
        &self,
        from_global_sequence_number: u64,
        page_size: i64,
    ) -> Result<Vec<CommittedEvent>, PgError> {
        let rows = sqlx::query(&format!(
            "{SELECT_COLUMNS} WHERE global_sequence_number >= $1 \
             ORDER BY global_sequence_number ASC LIMIT $2"
        ))
        .bind(to_i64(from_global_sequence_number, "global sequence number")?)
        .bind(page_size)
        .fetch_all(&self.pool)
        .await?;
        decode_rows(&rows)
    }

    async fn try_delete(
        &self,
        aggregate_name: &str,
        aggregate_id: &AggregateId,
    ) -> Result<u64, PgError> {
        let result = sqlx::query(
            "DELETE FROM chronicle_events WHERE aggregate_name = $1 AND aggregate_id = $2",
        )
        .bind(aggregate_name)
        .bind(aggregate_id.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

/// Column values for each event of a batch, checked before any I/O so an
/// out-of-range value rejects the batch instead of being stored altered.
fn batch_binds(events: &[UncommittedEvent]) -> Result<Vec<(i64, i32)>, Error> {
    events
        .iter()
        .map(|event| {
            let sequence = i64::try_from(event.aggregate_sequence_number).map_err(|_| {
                Error::InvalidBatch(format!(
                    "sequence number {} exceeds the BIGINT range",
                    event.aggregate_sequence_number
                ))
            })?;
            Ok((sequence, to_i32_version(event.event_version)?))
        })
        .collect()
}

fn decode_rows(rows: &[PgRow]) -> Result<Vec<CommittedEvent>, PgError> {
    rows.iter().map(decode_row).collect()
}

fn decode_row(row: &PgRow) -> Result<CommittedEvent, PgError> {
    let aggregate_id: String = row.try_get("aggregate_id")?;
    let aggregate_sequence_number: i64 = row.try_get("aggregate_sequence_number")?;
    let global_sequence_number: i64 = row.try_get("global_sequence_number")?;
    let event_version: i32 = row.try_get("event_version")?;
    let payload: Json<serde_json::Value> = row.try_get("payload")?;
    let metadata: Json<Metadata> = row.try_get("metadata")?;
    Ok(CommittedEvent {
        aggregate_id: AggregateId::new(aggregate_id)?,
        aggregate_name: row.try_get("aggregate_name")?,
        aggregate_sequence_number: to_u64(aggregate_sequence_number, "aggregate_sequence_number")?,
        global_sequence_number: to_u64(global_sequence_number, "global_sequence_number")?,
        event_name: row.try_get("event_name")?,
        event_version: u32::try_from(event_version).map_err(|_| {
            PgError::Core(Error::Storage(format!("negative event_version: {event_version}")))
        })?,
        payload: payload.0,
        metadata: metadata.0,
        batch_id: row.try_get("batch_id")?,
    })
}

#[async_trait]
impl EventPersistence for PgEventPersistence {
    #[tracing::instrument(skip(self, events), fields(event_count = events.len()))]
    async fn commit_events(
        &self,
        aggregate_name: &str,
        aggregate_id: &AggregateId,
        batch_id: Uuid,
        events: &[UncommittedEvent],
    ) -> Result<Vec<CommittedEvent>, Error> {
        validate_batch(events)?;
        let binds = batch_binds(events)?;
        let committed = retry_transient(self.retry.as_ref(), None, || {
            self.try_commit(aggregate_name, aggregate_id, batch_id, events, &binds)
        })
        .await?;
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
        Ok(retry_transient(self.retry.as_ref(), Some(cancel), || {
            self.try_load(aggregate_name, aggregate_id, from_sequence_number)
        })
        .await?)
    }

    #[tracing::instrument(skip(self, cancel))]
    async fn load_all_committed_events(
        &self,
        from_global_sequence_number: u64,
        page_size: usize,
        cancel: &CancellationToken,
    ) -> Result<GlobalEventPage, Error> {
        if page_size == 0 {
            return Err(Error::InvalidArgument("page size must be positive".into()));
        }
        let limit = i64::try_from(page_size)
            .map_err(|_| Error::InvalidArgument(format!("page size {page_size} is too large")))?;
        let events = retry_transient(self.retry.as_ref(), Some(cancel), || {
            self.try_load_all(from_global_sequence_number, limit)
        })
        .await?;
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
        let removed = retry_transient(self.retry.as_ref(), Some(cancel), || {
            self.try_delete(aggregate_name, aggregate_id)
        })
        .await?;
        tracing::info!(removed, "purged aggregate events");
        Ok(removed)
    }
}
