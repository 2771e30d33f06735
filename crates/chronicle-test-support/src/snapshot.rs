//! Test snapshot store — fails every call.

use async_trait::async_trait;
use chronicle_core::CancellationToken;
use chronicle_core::error::Error;
use chronicle_core::identity::AggregateId;
use chronicle_core::snapshot::{Snapshot, SnapshotStore};

/// A snapshot store whose every operation returns a storage error. Useful for
/// checking that snapshot failures never reach the caller.
#[derive(Debug)]
pub struct FailingSnapshotStore;

#[async_trait]
impl SnapshotStore for FailingSnapshotStore {
    async fn load_snapshot(
        &self,
        _aggregate_name: &str,
        _aggregate_id: &AggregateId,
        _cancel: &CancellationToken,
    ) -> Result<Option<Snapshot>, Error> {
        Err(Error::Storage("snapshot store unavailable".into()))
    }

    async fn store_snapshot(&self, _snapshot: Snapshot) -> Result<(), Error> {
        Err(Error::Storage("snapshot store unavailable".into()))
    }

    async fn delete_snapshots(
        &self,
        _aggregate_name: &str,
        _aggregate_id: &AggregateId,
        _cancel: &CancellationToken,
    ) -> Result<(), Error> {
        Err(Error::Storage("snapshot store unavailable".into()))
    }
}
