//! Error taxonomy for the event store.

use thiserror::Error;

use crate::event::EventType;
use crate::identity::AggregateId;

/// Top-level error type shared by backends and the aggregate store.
#[derive(Debug, Error)]
pub enum Error {
    /// Another writer already committed one of the sequence numbers in the
    /// batch. Retried by the aggregate store; terminal once retries run out.
    #[error(
        "concurrency conflict on {aggregate_name} {aggregate_id}: sequence number {sequence_number} is already committed"
    )]
    Concurrency {
        /// Aggregate type name.
        aggregate_name: String,
        /// The aggregate that had the conflict.
        aggregate_id: AggregateId,
        /// First sequence number of the rejected batch.
        sequence_number: u64,
    },

    /// A storage failure that is fatal or whose transient retries ran out.
    #[error("storage error: {0}")]
    Storage(String),

    /// A payload or snapshot could not be (de)serialized.
    #[error(
        "serialization error for aggregate {aggregate_id} at sequence {sequence_number} ({event_name}@v{event_version}): {reason}"
    )]
    Serialization {
        /// The aggregate the event belongs to.
        aggregate_id: AggregateId,
        /// Aggregate sequence number of the offending event, or the sequence
        /// number a snapshot was taken at.
        sequence_number: u64,
        /// Event name as stored.
        event_name: String,
        /// Event version as stored.
        event_version: u32,
        /// Underlying serializer message.
        reason: String,
    },

    /// Replay met an event type the aggregate has no handler for.
    #[error("aggregate {aggregate_name} has no handler for event {event_type}")]
    MissingEventHandler {
        /// Aggregate type name.
        aggregate_name: &'static str,
        /// The unhandled event type.
        event_type: EventType,
    },

    /// The upgrader chain did not reach a fixpoint within the iteration bound.
    #[error("upgrading {event_type} did not terminate after {iterations} passes")]
    UpgradeLimitExceeded {
        /// Type of the stored event being upgraded.
        event_type: EventType,
        /// Number of passes performed.
        iterations: usize,
    },

    /// Upgrader registration would create a cycle.
    #[error("upgrader cycle detected: {0}")]
    UpgraderCycle(String),

    /// Two upgraders were registered for the same input type.
    #[error("duplicate upgrader for {0}")]
    DuplicateUpgrader(EventType),

    /// A metadata provider produced a key that is reserved or already set.
    #[error("metadata key collision: {key}")]
    MetadataCollision {
        /// The colliding key.
        key: String,
    },

    /// Aggregate identifiers must be non-empty.
    #[error("invalid aggregate id: {0:?}")]
    InvalidAggregateId(String),

    /// A batch handed to a backend was empty or not contiguous.
    #[error("invalid batch: {0}")]
    InvalidBatch(String),

    /// An argument was outside its accepted range.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A mutation rejected the requested change.
    #[error("validation error: {0}")]
    Validation(String),

    /// The caller cancelled the operation before it reached the backend.
    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    /// Returns `true` for the concurrency conflict variant, the only error the
    /// aggregate store retries.
    #[must_use]
    pub fn is_concurrency_conflict(&self) -> bool {
        matches!(self, Self::Concurrency { .. })
    }
}
