//! Event persistence contract.
//!
//! Every backend stores committed events append-only and enforces uniqueness
//! of `(aggregate name, aggregate id, aggregate sequence number)`. That
//! constraint is the only concurrency control in the system: writers never
//! lock, they detect the conflict at commit time and retry.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::Error;
use crate::identity::AggregateId;
use crate::metadata::Metadata;

/// Persisted, immutable representation of a domain event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommittedEvent {
    /// Aggregate this event belongs to.
    pub aggregate_id: AggregateId,
    /// Aggregate type name.
    pub aggregate_name: String,
    /// 1-based position within the aggregate stream.
    pub aggregate_sequence_number: u64,
    /// Position across all aggregates of the backend instance.
    pub global_sequence_number: u64,
    /// Event name for deserialization routing.
    pub event_name: String,
    /// Schema version of the payload.
    pub event_version: u32,
    /// Serialized event payload.
    pub payload: serde_json::Value,
    /// Serialized event metadata.
    pub metadata: Metadata,
    /// Id shared by every event committed in the same batch.
    pub batch_id: Uuid,
}

/// Serialized event awaiting commit.
#[derive(Debug, Clone, PartialEq)]
pub struct UncommittedEvent {
    /// The sequence number this event expects to occupy.
    pub aggregate_sequence_number: u64,
    /// Event name.
    pub event_name: String,
    /// Schema version of the payload.
    pub event_version: u32,
    /// Serialized event payload.
    pub payload: serde_json::Value,
    /// Serialized event metadata.
    pub metadata: Metadata,
}

impl UncommittedEvent {
    /// Returns `true` if `committed` holds this event as part of `batch_id`.
    ///
    /// Used by backends to recognise a re-submitted batch.
    #[must_use]
    pub fn is_committed_as(&self, committed: &CommittedEvent, batch_id: Uuid) -> bool {
        committed.batch_id == batch_id
            && committed.aggregate_sequence_number == self.aggregate_sequence_number
            && committed.event_name == self.event_name
            && committed.event_version == self.event_version
            && committed.payload == self.payload
    }
}

/// One page of a global catch-up scan.
#[derive(Debug, Clone, Default)]
pub struct GlobalEventPage {
    /// Events in ascending global sequence order.
    pub events: Vec<CommittedEvent>,
    /// Cursor to pass to the next call. Equal to the requested cursor when
    /// no events were returned.
    pub next_global_sequence_number: u64,
}

/// Storage backend for committed events.
///
/// Read and delete operations take a cancellation token that the backend
/// checks before each storage call and while waiting to retry. A commit
/// takes none: once started it runs to completion.
#[async_trait]
pub trait EventPersistence: Send + Sync {
    /// Commits a contiguous, non-empty batch atomically.
    ///
    /// Re-submitting a batch that is already committed under the same
    /// `batch_id` with identical content succeeds and returns the stored
    /// events.
    ///
    /// # Errors
    ///
    /// Returns `Error::Concurrency` if any sequence number is already taken
    /// by different content, `Error::InvalidBatch` for an empty or
    /// non-contiguous batch, and `Error::Storage` for storage failures.
    async fn commit_events(
        &self,
        aggregate_name: &str,
        aggregate_id: &AggregateId,
        batch_id: Uuid,
        events: &[UncommittedEvent],
    ) -> Result<Vec<CommittedEvent>, Error>;

    /// Loads events of one aggregate with sequence number `>= from_sequence_number`,
    /// in ascending order.
    ///
    /// # Errors
    ///
    /// Returns `Error::Cancelled` once `cancel` fires, and `Error::Storage`
    /// for storage failures.
    async fn load_committed_events(
        &self,
        aggregate_name: &str,
        aggregate_id: &AggregateId,
        from_sequence_number: u64,
        cancel: &CancellationToken,
    ) -> Result<Vec<CommittedEvent>, Error>;

    /// Loads up to `page_size` events with global sequence number
    /// `>= from_global_sequence_number`, in ascending global order.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidArgument` for a zero `page_size`,
    /// `Error::Cancelled` once `cancel` fires, and `Error::Storage` for
    /// storage failures.
    async fn load_all_committed_events(
        &self,
        from_global_sequence_number: u64,
        page_size: usize,
        cancel: &CancellationToken,
    ) -> Result<GlobalEventPage, Error>;

    /// Removes every event of one aggregate. Administrative use only.
    /// Returns the number of events removed.
    async fn delete_events(
        &self,
        aggregate_name: &str,
        aggregate_id: &AggregateId,
        cancel: &CancellationToken,
    ) -> Result<u64, Error>;
}

/// Checks that `events` is non-empty and numbered contiguously.
///
/// # Errors
///
/// Returns `Error::InvalidBatch` describing the first violation.
pub fn validate_batch(events: &[UncommittedEvent]) -> Result<(), Error> {
    let Some(first) = events.first() else {
        return Err(Error::InvalidBatch("batch is empty".into()));
    };
    if first.aggregate_sequence_number == 0 {
        return Err(Error::InvalidBatch(
            "aggregate sequence numbers start at 1".into(),
        ));
    }
    for (offset, event) in events.iter().enumerate() {
        let expected = first.aggregate_sequence_number + offset as u64;
        if event.aggregate_sequence_number != expected {
            return Err(Error::InvalidBatch(format!(
                "expected sequence number {expected}, got {}",
                event.aggregate_sequence_number
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uncommitted(seq: u64) -> UncommittedEvent {
        UncommittedEvent {
            aggregate_sequence_number: seq,
            event_name: "ItemAdded".to_owned(),
            event_version: 2,
            payload: serde_json::json!({"sku": "X"}),
            metadata: Metadata::new(),
        }
    }

    #[test]
    fn test_validate_batch_accepts_contiguous_numbers() {
        assert!(validate_batch(&[uncommitted(4), uncommitted(5), uncommitted(6)]).is_ok());
    }

    #[test]
    fn test_validate_batch_rejects_empty_gapped_and_zero() {
        assert!(matches!(validate_batch(&[]), Err(Error::InvalidBatch(_))));
        assert!(matches!(
            validate_batch(&[uncommitted(1), uncommitted(3)]),
            Err(Error::InvalidBatch(_))
        ));
        assert!(matches!(
            validate_batch(&[uncommitted(0)]),
            Err(Error::InvalidBatch(_))
        ));
    }

    #[test]
    fn test_is_committed_as_requires_same_batch_and_content() {
        let batch_id = Uuid::new_v4();
        let event = uncommitted(1);
        let committed = CommittedEvent {
            aggregate_id: AggregateId::new("order-1").unwrap(),
            aggregate_name: "order".to_owned(),
            aggregate_sequence_number: 1,
            global_sequence_number: 10,
            event_name: "ItemAdded".to_owned(),
            event_version: 2,
            payload: serde_json::json!({"sku": "X"}),
            metadata: Metadata::new(),
            batch_id,
        };

        assert!(event.is_committed_as(&committed, batch_id));
        assert!(!event.is_committed_as(&committed, Uuid::new_v4()));

        let mut different = committed.clone();
        different.payload = serde_json::json!({"sku": "Y"});
        assert!(!event.is_committed_as(&different, batch_id));
    }
}
