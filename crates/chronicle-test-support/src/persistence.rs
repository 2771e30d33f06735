//! Test persistence backends — `EventPersistence` wrappers and fakes.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chronicle_core::CancellationToken;
use chronicle_core::error::Error;
use chronicle_core::identity::AggregateId;
use chronicle_core::persistence::{
    CommittedEvent, EventPersistence, GlobalEventPage, UncommittedEvent,
};
use tokio::sync::Notify;
use uuid::Uuid;

/// An event backend that always returns a storage error. Useful for testing
/// error-handling paths.
#[derive(Debug)]
pub struct FailingEventPersistence;

fn connection_refused() -> Error {
    Error::Storage("connection refused".into())
}

#[async_trait]
impl EventPersistence for FailingEventPersistence {
    async fn commit_events(
        &self,
        _aggregate_name: &str,
        _aggregate_id: &AggregateId,
        _batch_id: Uuid,
        _events: &[UncommittedEvent],
    ) -> Result<Vec<CommittedEvent>, Error> {
        Err(connection_refused())
    }

    async fn load_committed_events(
        &self,
        _aggregate_name: &str,
        _aggregate_id: &AggregateId,
        _from_sequence_number: u64,
        _cancel: &CancellationToken,
    ) -> Result<Vec<CommittedEvent>, Error> {
        Err(connection_refused())
    }

    async fn load_all_committed_events(
        &self,
        _from_global_sequence_number: u64,
        _page_size: usize,
        _cancel: &CancellationToken,
    ) -> Result<GlobalEventPage, Error> {
        Err(connection_refused())
    }

    async fn delete_events(
        &self,
        _aggregate_name: &str,
        _aggregate_id: &AggregateId,
        _cancel: &CancellationToken,
    ) -> Result<u64, Error> {
        Err(connection_refused())
    }
}

/// Wraps a backend and counts the calls that reach it.
pub struct CountingEventPersistence {
    inner: Arc<dyn EventPersistence>,
    commits: AtomicUsize,
    loads: AtomicUsize,
}

impl std::fmt::Debug for CountingEventPersistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CountingEventPersistence")
            .field("commits", &self.commit_calls())
            .field("loads", &self.load_calls())
            .finish_non_exhaustive()
    }
}

impl CountingEventPersistence {
    /// Wrap `inner`.
    #[must_use]
    pub fn new(inner: Arc<dyn EventPersistence>) -> Self {
        Self {
            inner,
            commits: AtomicUsize::new(0),
            loads: AtomicUsize::new(0),
        }
    }

    /// Number of `commit_events` calls so far.
    pub fn commit_calls(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    /// Number of `load_committed_events` calls so far.
    pub fn load_calls(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventPersistence for CountingEventPersistence {
    async fn commit_events(
        &self,
        aggregate_name: &str,
        aggregate_id: &AggregateId,
        batch_id: Uuid,
        events: &[UncommittedEvent],
    ) -> Result<Vec<CommittedEvent>, Error> {
        self.commits.fetch_add(1, Ordering::SeqCst);
        self.inner
            .commit_events(aggregate_name, aggregate_id, batch_id, events)
            .await
    }

    async fn load_committed_events(
        &self,
        aggregate_name: &str,
        aggregate_id: &AggregateId,
        from_sequence_number: u64,
        cancel: &CancellationToken,
    ) -> Result<Vec<CommittedEvent>, Error> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        self.inner
            .load_committed_events(aggregate_name, aggregate_id, from_sequence_number, cancel)
            .await
    }

    async fn load_all_committed_events(
        &self,
        from_global_sequence_number: u64,
        page_size: usize,
        cancel: &CancellationToken,
    ) -> Result<GlobalEventPage, Error> {
        self.inner
            .load_all_committed_events(from_global_sequence_number, page_size, cancel)
            .await
    }

    async fn delete_events(
        &self,
        aggregate_name: &str,
        aggregate_id: &AggregateId,
        cancel: &CancellationToken,
    ) -> Result<u64, Error> {
        self.inner
            .delete_events(aggregate_name, aggregate_id, cancel)
            .await
    }
}

/// Simulates a competing writer: the first `conflicts` commits are preceded
/// by a commit of the same events under a foreign batch id, so the real
/// commit hits the uniqueness constraint.
///
/// The interloping events are copies of the caller's, so the aggregate can
/// replay them on the retry.
pub struct ConflictingEventPersistence {
    inner: Arc<dyn EventPersistence>,
    remaining: AtomicUsize,
    attempts: AtomicUsize,
}

impl std::fmt::Debug for ConflictingEventPersistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConflictingEventPersistence")
            .field("remaining", &self.remaining.load(Ordering::SeqCst))
            .field("attempts", &self.commit_attempts())
            .finish_non_exhaustive()
    }
}

impl ConflictingEventPersistence {
    /// Wrap `inner`, injecting `conflicts` competing commits.
    #[must_use]
    pub fn new(inner: Arc<dyn EventPersistence>, conflicts: usize) -> Self {
        Self {
            inner,
            remaining: AtomicUsize::new(conflicts),
            attempts: AtomicUsize::new(0),
        }
    }

    /// Number of `commit_events` calls so far, including conflicted ones.
    pub fn commit_attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    fn take_conflict(&self) -> bool {
        self.remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl EventPersistence for ConflictingEventPersistence {
    async fn commit_events(
        &self,
        aggregate_name: &str,
        aggregate_id: &AggregateId,
        batch_id: Uuid,
        events: &[UncommittedEvent],
    ) -> Result<Vec<CommittedEvent>, Error> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.take_conflict() {
            tracing::debug!("injecting competing commit");
            self.inner
                .commit_events(aggregate_name, aggregate_id, Uuid::now_v7(), events)
                .await?;
        }
        self.inner
            .commit_events(aggregate_name, aggregate_id, batch_id, events)
            .await
    }

    async fn load_committed_events(
        &self,
        aggregate_name: &str,
        aggregate_id: &AggregateId,
        from_sequence_number: u64,
        cancel: &CancellationToken,
    ) -> Result<Vec<CommittedEvent>, Error> {
        self.inner
            .load_committed_events(aggregate_name, aggregate_id, from_sequence_number, cancel)
            .await
    }

    async fn load_all_committed_events(
        &self,
        from_global_sequence_number: u64,
        page_size: usize,
        cancel: &CancellationToken,
    ) -> Result<GlobalEventPage, Error> {
        self.inner
            .load_all_committed_events(from_global_sequence_number, page_size, cancel)
            .await
    }

    async fn delete_events(
        &self,
        aggregate_name: &str,
        aggregate_id: &AggregateId,
        cancel: &CancellationToken,
    ) -> Result<u64, Error> {
        self.inner
            .delete_events(aggregate_name, aggregate_id, cancel)
            .await
    }
}

/// Holds one stream read open after it has fetched its events, so a test can
/// commit behind the reader's back before letting it return.
///
/// Call [`pause_next_load`](Self::pause_next_load), start the read, await
/// [`wait_until_loaded`](Self::wait_until_loaded), do the interleaved work,
/// then [`release`](Self::release) the reader.
pub struct PausingEventPersistence {
    inner: Arc<dyn EventPersistence>,
    armed: AtomicBool,
    loaded: Notify,
    released: Notify,
}

impl std::fmt::Debug for PausingEventPersistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PausingEventPersistence")
            .field("armed", &self.armed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl PausingEventPersistence {
    /// Wrap `inner`. Nothing pauses until [`pause_next_load`](Self::pause_next_load).
    #[must_use]
    pub fn new(inner: Arc<dyn EventPersistence>) -> Self {
        Self {
            inner,
            armed: AtomicBool::new(false),
            loaded: Notify::new(),
            released: Notify::new(),
        }
    }

    /// Makes the next `load_committed_events` call wait for
    /// [`release`](Self::release) after reading.
    pub fn pause_next_load(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }

    /// Resolves once the paused load has read its events.
    pub async fn wait_until_loaded(&self) {
        self.loaded.notified().await;
    }

    /// Lets the paused load return what it read.
    pub fn release(&self) {
        self.released.notify_one();
    }
}

#[async_trait]
impl EventPersistence for PausingEventPersistence {
    async fn commit_events(
        &self,
        aggregate_name: &str,
        aggregate_id: &AggregateId,
        batch_id: Uuid,
        events: &[UncommittedEvent],
    ) -> Result<Vec<CommittedEvent>, Error> {
        self.inner
            .commit_events(aggregate_name, aggregate_id, batch_id, events)
            .await
    }

    async fn load_committed_events(
        &self,
        aggregate_name: &str,
        aggregate_id: &AggregateId,
        from_sequence_number: u64,
        cancel: &CancellationToken,
    ) -> Result<Vec<CommittedEvent>, Error> {
        let events = self
            .inner
            .load_committed_events(aggregate_name, aggregate_id, from_sequence_number, cancel)
            .await?;
        if self.armed.swap(false, Ordering::SeqCst) {
            tracing::debug!(events = events.len(), "holding load until released");
            self.loaded.notify_one();
            self.released.notified().await;
        }
        Ok(events)
    }

    async fn load_all_committed_events(
        &self,
        from_global_sequence_number: u64,
        page_size: usize,
        cancel: &CancellationToken,
    ) -> Result<GlobalEventPage, Error> {
        self.inner
            .load_all_committed_events(from_global_sequence_number, page_size, cancel)
            .await
    }

    async fn delete_events(
        &self,
        aggregate_name: &str,
        aggregate_id: &AggregateId,
        cancel: &CancellationToken,
    ) -> Result<u64, Error> {
        self.inner
            .delete_events(aggregate_name, aggregate_id, cancel)
            .await
    }
}
