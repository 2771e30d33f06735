//! Chronicle Event Store — persistence backends.
//!
//! Provides the in-memory reference backends and the `PostgreSQL` backends
//! that implement the `EventPersistence` and `SnapshotStore` contracts from
//! `chronicle-core`.

pub mod error;
pub mod in_memory;
pub mod pg_event_persistence;
pub mod pg_retry;
pub mod pg_snapshot_store;
pub mod schema;

pub use in_memory::{InMemoryEventPersistence, InMemorySnapshotStore};
pub use pg_event_persistence::PgEventPersistence;
pub use pg_retry::{PgRetryConfig, PgRetryStrategy};
pub use pg_snapshot_store::PgSnapshotStore;
