//! Snapshot support for bounding replay cost.
//!
//! A snapshot captures serialized aggregate state at a sequence number. On
//! load, only events strictly after that sequence number are replayed. A
//! [`SnapshotStrategy`] decides after each commit whether a new snapshot is
//! written; a failed write never affects the commit.

use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::identity::AggregateId;
use crate::metadata::Metadata;
use crate::rng::DeterministicRng;

/// Point-in-time aggregate state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Aggregate identity.
    pub aggregate_id: AggregateId,
    /// Aggregate type name.
    pub aggregate_name: String,
    /// Sequence number of the last event folded into `state`.
    pub aggregate_sequence_number: u64,
    /// Serialized aggregate state.
    pub state: serde_json::Value,
    /// Serialized snapshot metadata.
    pub metadata: Metadata,
}

/// Persistence for snapshots.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Loads the newest snapshot of an aggregate, if any.
    async fn load_snapshot(
        &self,
        aggregate_name: &str,
        aggregate_id: &AggregateId,
        cancel: &CancellationToken,
    ) -> Result<Option<Snapshot>, Error>;

    /// Stores a snapshot. A snapshot older than the one already stored is
    /// ignored.
    async fn store_snapshot(&self, snapshot: Snapshot) -> Result<(), Error>;

    /// Removes every snapshot of an aggregate.
    async fn delete_snapshots(
        &self,
        aggregate_name: &str,
        aggregate_id: &AggregateId,
        cancel: &CancellationToken,
    ) -> Result<(), Error>;
}

/// Decides whether to write a snapshot after a commit.
pub trait SnapshotStrategy: Send + Sync {
    /// `current_version` is the aggregate version after the commit;
    /// `last_snapshot_version` is the version of the snapshot the aggregate
    /// was loaded from (0 if none).
    fn should_snapshot(&self, current_version: u64, last_snapshot_version: u64) -> bool;
}

/// Snapshot once at least `n` versions have accumulated since the last one.
#[derive(Debug, Clone, Copy)]
pub struct EveryNVersions(pub u64);

impl SnapshotStrategy for EveryNVersions {
    fn should_snapshot(&self, current_version: u64, last_snapshot_version: u64) -> bool {
        self.0 > 0 && current_version.saturating_sub(last_snapshot_version) >= self.0
    }
}

/// Snapshot with a fixed probability per commit, spreading snapshot writes
/// across aggregates instead of bursting them at version boundaries.
pub struct Probabilistic<R> {
    probability: f64,
    rng: Mutex<R>,
}

impl<R> std::fmt::Debug for Probabilistic<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Probabilistic")
            .field("probability", &self.probability)
            .finish_non_exhaustive()
    }
}

impl<R: DeterministicRng> Probabilistic<R> {
    /// Creates the strategy; `probability` is clamped to `[0, 1]`.
    #[must_use]
    pub fn new(probability: f64, rng: R) -> Self {
        Self {
            probability: probability.clamp(0.0, 1.0),
            rng: Mutex::new(rng),
        }
    }
}

impl<R: DeterministicRng> SnapshotStrategy for Probabilistic<R> {
    fn should_snapshot(&self, current_version: u64, last_snapshot_version: u64) -> bool {
        if current_version <= last_snapshot_version {
            return false;
        }
        let roll = match self.rng.lock() {
            Ok(mut rng) => rng.next_f64(),
            Err(poisoned) => poisoned.into_inner().next_f64(),
        };
        roll < self.probability
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Scripted(Vec<f64>);

    impl DeterministicRng for Scripted {
        fn next_f64(&mut self) -> f64 {
            self.0.remove(0)
        }
    }

    #[test]
    fn test_every_n_versions() {
        let strategy = EveryNVersions(100);

        assert!(!strategy.should_snapshot(99, 0));
        assert!(strategy.should_snapshot(100, 0));
        assert!(!strategy.should_snapshot(150, 100));
        assert!(strategy.should_snapshot(203, 100));
    }

    #[test]
    fn test_every_zero_versions_never_snapshots() {
        assert!(!EveryNVersions(0).should_snapshot(10, 0));
    }

    #[test]
    fn test_probabilistic_follows_rng() {
        let strategy = Probabilistic::new(0.25, Scripted(vec![0.1, 0.9, 0.24]));

        assert!(strategy.should_snapshot(5, 0));
        assert!(!strategy.should_snapshot(6, 0));
        assert!(strategy.should_snapshot(7, 0));
    }

    #[test]
    fn test_probabilistic_skips_when_snapshot_is_current() {
        let strategy = Probabilistic::new(1.0, Scripted(vec![]));

        assert!(!strategy.should_snapshot(5, 5));
    }
}
