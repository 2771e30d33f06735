//! Event store database schema.
//!
//! The DDL lives in the workspace `migrations/` directory and is embedded
//! here so binaries and tests apply exactly the same schema.

use sqlx::migrate::Migrator;

/// Embedded migrations for the events and snapshots tables.
pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

/// Committed events table.
pub const EVENTS_TABLE: &str = "chronicle_events";

/// Snapshots table, one row per aggregate.
pub const SNAPSHOTS_TABLE: &str = "chronicle_snapshots";

/// Key of the transaction-scoped advisory lock taken by every commit.
///
/// Holding it until commit makes global sequence numbers become visible in
/// allocation order, so a catch-up reader never passes over a lower number
/// that is still in flight.
pub const COMMIT_LOCK_KEY: i64 = 0x6368_726f_6e69;
