//! Load → mutate → commit with optimistic concurrency.
//!
//! [`AggregateStore`] rebuilds an aggregate from its snapshot and committed
//! events, runs a caller mutation against it, and commits the emitted events
//! at the sequence numbers immediately following the loaded version. A
//! conflicting writer surfaces as `Error::Concurrency`, which restarts the
//! whole cycle from a fresh load.

use std::sync::Arc;

use tracing::Instrument;
use uuid::Uuid;

use crate::CancellationToken;
use crate::aggregate::{Aggregate, AggregateRoot, EventHandlers};
use crate::cache::EventCache;
use crate::clock::{Clock, SystemClock};
use crate::config::AggregateStoreConfig;
use crate::error::Error;
use crate::event::DomainEvent;
use crate::identity::{AggregateId, SourceId};
use crate::metadata::{self, Metadata, MetadataContext, MetadataProvider, apply_providers};
use crate::persistence::{CommittedEvent, EventPersistence, UncommittedEvent};
use crate::retry::{Backoff, sleep_or_cancel};
use crate::serializer::{EventSerializer, JsonEventSerializer};
use crate::snapshot::{Snapshot, SnapshotStore, SnapshotStrategy};
use crate::upgrade::UpgraderChain;

/// Window of trailing events fetched when looking for the last batch behind
/// a snapshot. Grows until the batch boundary is found.
const LAST_BATCH_WINDOW: u64 = 16;

/// Event stream of one aggregate as it was read from storage.
///
/// This is what the [`EventCache`] holds: the snapshot the load started from,
/// the raw committed events after it, and those events deserialized and
/// upgraded. Aggregate state itself is never cached.
#[derive(Debug)]
pub struct LoadedStream<E> {
    snapshot: Option<Snapshot>,
    committed: Vec<CommittedEvent>,
    upgraded: Vec<E>,
    version: u64,
}

impl<E> LoadedStream<E> {
    /// Sequence number of the last committed event, or of the snapshot if no
    /// events follow it.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Committed events loaded after the snapshot, in sequence order.
    #[must_use]
    pub fn committed_events(&self) -> &[CommittedEvent] {
        &self.committed
    }

    /// Deserialized, upgraded events in replay order.
    #[must_use]
    pub fn upgraded_events(&self) -> &[E] {
        &self.upgraded
    }

    fn snapshot_version(&self) -> u64 {
        self.snapshot
            .as_ref()
            .map_or(0, |s| s.aggregate_sequence_number)
    }
}

/// Cache type accepted by [`AggregateStore::with_cache`].
pub type StreamCache<E> = EventCache<LoadedStream<E>>;

struct SnapshotConfig {
    store: Arc<dyn SnapshotStore>,
    strategy: Arc<dyn SnapshotStrategy>,
}

/// Loads and updates aggregates of type `A` against an event backend.
///
/// Holds no per-aggregate state and no locks; share one instance per
/// aggregate type through an `Arc`.
pub struct AggregateStore<A: Aggregate, S = JsonEventSerializer> {
    persistence: Arc<dyn EventPersistence>,
    serializer: S,
    handlers: Arc<EventHandlers<A>>,
    upgraders: UpgraderChain<A::Event>,
    snapshots: Option<SnapshotConfig>,
    cache: Option<Arc<StreamCache<A::Event>>>,
    metadata_providers: Vec<Arc<dyn MetadataProvider>>,
    clock: Arc<dyn Clock>,
    config: AggregateStoreConfig,
}

impl<A: Aggregate, S> std::fmt::Debug for AggregateStore<A, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregateStore")
            .field("aggregate", &A::NAME)
            .field("handlers", &self.handlers)
            .field("upgraders", &self.upgraders)
            .field("snapshots", &self.snapshots.is_some())
            .field("cache", &self.cache.is_some())
            .field("metadata_providers", &self.metadata_providers.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<A: Aggregate> AggregateStore<A> {
    /// Creates a store with the JSON serializer, no snapshots, no cache and
    /// default configuration.
    #[must_use]
    pub fn new(persistence: Arc<dyn EventPersistence>) -> Self {
        Self {
            persistence,
            serializer: JsonEventSerializer,
            handlers: Arc::new(EventHandlers::build()),
            upgraders: UpgraderChain::new(),
            snapshots: None,
            cache: None,
            metadata_providers: Vec::new(),
            clock: Arc::new(SystemClock),
            config: AggregateStoreConfig::default(),
        }
    }
}

impl<A: Aggregate, S: EventSerializer> AggregateStore<A, S> {
    /// Replaces the serializer.
    #[must_use]
    pub fn with_serializer<T: EventSerializer>(self, serializer: T) -> AggregateStore<A, T> {
        AggregateStore {
            persistence: self.persistence,
            serializer,
            handlers: self.handlers,
            upgraders: self.upgraders,
            snapshots: self.snapshots,
            cache: self.cache,
            metadata_providers: self.metadata_providers,
            clock: self.clock,
            config: self.config,
        }
    }

    /// Enables snapshots: loads start from the newest snapshot and
    /// `strategy` decides after each commit whether to write a new one.
    #[must_use]
    pub fn with_snapshots(
        mut self,
        store: Arc<dyn SnapshotStore>,
        strategy: Arc<dyn SnapshotStrategy>,
    ) -> Self {
        self.snapshots = Some(SnapshotConfig { store, strategy });
        self
    }

    /// Shares an event stream cache with this store.
    #[must_use]
    pub fn with_cache(mut self, cache: Arc<StreamCache<A::Event>>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Appends a metadata provider. Providers run in registration order.
    #[must_use]
    pub fn with_metadata_provider(mut self, provider: Arc<dyn MetadataProvider>) -> Self {
        self.metadata_providers.push(provider);
        self
    }

    /// Installs the upgrader chain applied to every loaded event. The
    /// configured iteration bound overrides the chain's own.
    #[must_use]
    pub fn with_upgraders(mut self, upgraders: UpgraderChain<A::Event>) -> Self {
        self.upgraders = upgraders.with_max_iterations(self.config.max_upgrade_iterations);
        self
    }

    /// Replaces the clock used for commit timestamps.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replaces the configuration.
    #[must_use]
    pub fn with_config(mut self, config: AggregateStoreConfig) -> Self {
        self.upgraders =
            std::mem::take(&mut self.upgraders).with_max_iterations(config.max_upgrade_iterations);
        self.config = config;
        self
    }

    /// Loads the current state and version of an aggregate.
    ///
    /// An aggregate with no events and no snapshot loads as the default state
    /// at version 0.
    ///
    /// # Errors
    ///
    /// Returns `Error::Cancelled` if `cancel` fires before a storage call,
    /// `Error::Serialization` for an undecodable payload,
    /// `Error::MissingEventHandler` for an event the aggregate cannot apply,
    /// and any backend error.
    pub async fn load(
        &self,
        aggregate_id: &AggregateId,
        cancel: &CancellationToken,
    ) -> Result<AggregateRoot<A>, Error> {
        let span = tracing::debug_span!("load", aggregate = A::NAME, aggregate_id = %aggregate_id);
        async {
            let (root, _) = self.load_root(aggregate_id, cancel).await?;
            Ok(root)
        }
        .instrument(span)
        .await
    }

    /// Runs `mutation` against the current state and commits the events it
    /// emits, retrying the whole cycle on concurrency conflicts.
    ///
    /// When `source_id` matches the source id of the most recently committed
    /// batch, the mutation is skipped and that batch is returned. A mutation
    /// that emits nothing commits nothing and returns an empty list.
    ///
    /// # Errors
    ///
    /// Returns `Error::Concurrency` once the configured retries are used up,
    /// `Error::Cancelled` if `cancel` fires before the commit starts, the
    /// mutation's own error unchanged, and any load, metadata or backend
    /// error.
    pub async fn update<F>(
        &self,
        aggregate_id: &AggregateId,
        source_id: Option<&SourceId>,
        mutation: F,
        cancel: &CancellationToken,
    ) -> Result<Vec<CommittedEvent>, Error>
    where
        F: Fn(&mut AggregateRoot<A>) -> Result<(), Error> + Send + Sync,
    {
        let span = tracing::debug_span!(
            "update",
            aggregate = A::NAME,
            aggregate_id = %aggregate_id,
            source_id = source_id.map(SourceId::as_str),
        );
        async {
            let backoff = Backoff::from(self.config.backoff);
            let mut retries: u32 = 0;
            loop {
                match self.try_update(aggregate_id, source_id, &mutation, cancel).await {
                    Err(err)
                        if err.is_concurrency_conflict()
                            && retries < self.config.max_concurrency_retries =>
                    {
                        retries += 1;
                        self.invalidate(aggregate_id);
                        let delay = backoff.delay(retries);
                        tracing::warn!(
                            retries,
                            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                            error = %err,
                            "concurrency conflict, reloading aggregate"
                        );
                        sleep_or_cancel(delay, cancel).await?;
                    }
                    Err(err) => {
                        if err.is_concurrency_conflict() {
                            self.invalidate(aggregate_id);
                        }
                        return Err(err);
                    }
                    Ok(committed) => return Ok(committed),
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn try_update<F>(
        &self,
        aggregate_id: &AggregateId,
        source_id: Option<&SourceId>,
        mutation: &F,
        cancel: &CancellationToken,
    ) -> Result<Vec<CommittedEvent>, Error>
    where
        F: Fn(&mut AggregateRoot<A>) -> Result<(), Error> + Send + Sync,
    {
        let (mut root, stream) = self.load_root(aggregate_id, cancel).await?;

        if let Some(source_id) = source_id {
            if let Some(batch) = self
                .find_batch_from_source(aggregate_id, &stream, source_id, cancel)
                .await?
            {
                tracing::debug!(
                    events = batch.len(),
                    "source id already committed, skipping mutation"
                );
                return Ok(batch);
            }
        }

        mutation(&mut root)?;
        let events = root.take_uncommitted();
        if events.is_empty() {
            return Ok(Vec::new());
        }

        let batch_id = Uuid::now_v7();
        let uncommitted =
            self.serialize_batch(aggregate_id, root.version(), source_id, batch_id, &events)?;

        check_cancelled(cancel)?;
        let committed = self
            .persistence
            .commit_events(A::NAME, aggregate_id, batch_id, &uncommitted)
            .await?;
        self.invalidate(aggregate_id);

        let version = committed
            .last()
            .map_or(root.version(), |e| e.aggregate_sequence_number);
        tracing::debug!(
            events = committed.len(),
            version,
            batch_id = %batch_id,
            "committed events"
        );
        self.offer_snapshot(&root, version, stream.snapshot_version())
            .await;
        Ok(committed)
    }

    /// Returns the most recent committed batch if it carries `source_id`.
    async fn find_batch_from_source(
        &self,
        aggregate_id: &AggregateId,
        stream: &LoadedStream<A::Event>,
        source_id: &SourceId,
        cancel: &CancellationToken,
    ) -> Result<Option<Vec<CommittedEvent>>, Error> {
        if let Some(last) = stream.committed.last() {
            if last.metadata.source_id() != Some(source_id.as_str()) {
                return Ok(None);
            }
        }
        let tail = trailing_batch(&stream.committed);
        let complete = tail.len() < stream.committed.len() || stream.snapshot.is_none();
        let batch = if !tail.is_empty() && complete {
            tail.to_vec()
        } else if stream.version == 0 {
            return Ok(None);
        } else {
            // The batch may start before the snapshot; read further back.
            self.load_last_batch(aggregate_id, stream.version, cancel)
                .await?
        };
        let matches = batch
            .last()
            .is_some_and(|e| e.metadata.source_id() == Some(source_id.as_str()));
        Ok(matches.then_some(batch))
    }

    async fn load_last_batch(
        &self,
        aggregate_id: &AggregateId,
        version: u64,
        cancel: &CancellationToken,
    ) -> Result<Vec<CommittedEvent>, Error> {
        let mut window = LAST_BATCH_WINDOW;
        loop {
            let from = version.saturating_sub(window - 1).max(1);
            check_cancelled(cancel)?;
            let events = self
                .persistence
                .load_committed_events(A::NAME, aggregate_id, from, cancel)
                .await?;
            let tail = trailing_batch(&events);
            if from == 1 || tail.len() < events.len() {
                return Ok(tail.to_vec());
            }
            window = window.saturating_mul(4);
        }
    }

    fn serialize_batch(
        &self,
        aggregate_id: &AggregateId,
        version: u64,
        source_id: Option<&SourceId>,
        batch_id: Uuid,
        events: &[A::Event],
    ) -> Result<Vec<UncommittedEvent>, Error> {
        let timestamp = self.clock.now().to_rfc3339();
        let batch_id = batch_id.to_string();
        let mut sequence_number = version;
        events
            .iter()
            .map(|event| {
                sequence_number += 1;
                let event_type = event.event_type();
                let payload = self.serializer.serialize_event(event).map_err(|reason| {
                    Error::Serialization {
                        aggregate_id: aggregate_id.clone(),
                        sequence_number,
                        event_name: event_type.name.to_owned(),
                        event_version: event_type.version,
                        reason,
                    }
                })?;

                let mut reserved = Metadata::new();
                reserved.insert(metadata::AGGREGATE_ID, aggregate_id.as_str())?;
                reserved.insert(metadata::AGGREGATE_NAME, A::NAME)?;
                reserved.insert(
                    metadata::AGGREGATE_SEQUENCE_NUMBER,
                    sequence_number.to_string(),
                )?;
                reserved.insert(metadata::EVENT_NAME, event_type.name)?;
                reserved.insert(metadata::EVENT_VERSION, event_type.version.to_string())?;
                reserved.insert(metadata::TIMESTAMP, timestamp.as_str())?;
                reserved.insert(metadata::BATCH_ID, batch_id.as_str())?;
                if let Some(source_id) = source_id {
                    reserved.insert(metadata::SOURCE_ID, source_id.as_str())?;
                }

                let mut metadata = reserved.clone();
                let context = MetadataContext {
                    aggregate_name: A::NAME,
                    aggregate_id,
                    event_name: event_type.name,
                    event_version: event_type.version,
                    payload: &payload,
                    metadata: &reserved,
                };
                apply_providers(&self.metadata_providers, &context, &mut metadata)?;

                Ok(UncommittedEvent {
                    aggregate_sequence_number: sequence_number,
                    event_name: event_type.name.to_owned(),
                    event_version: event_type.version,
                    payload,
                    metadata,
                })
            })
            .collect::<Result<Vec<_>, Error>>()
    }

    /// Writes a snapshot if the strategy asks for one. Failures are logged
    /// and never reach the caller.
    async fn offer_snapshot(&self, root: &AggregateRoot<A>, version: u64, last_snapshot: u64) {
        let Some(snapshots) = &self.snapshots else {
            return;
        };
        if !snapshots.strategy.should_snapshot(version, last_snapshot) {
            return;
        }
        let state = match self.serializer.serialize_state(root.state()) {
            Ok(state) => state,
            Err(reason) => {
                tracing::warn!(version, %reason, "failed to serialize snapshot state");
                return;
            }
        };
        let snapshot = Snapshot {
            aggregate_id: root.id().clone(),
            aggregate_name: A::NAME.to_owned(),
            aggregate_sequence_number: version,
            state,
            metadata: [
                (metadata::AGGREGATE_ID, root.id().as_str().to_owned()),
                (metadata::AGGREGATE_NAME, A::NAME.to_owned()),
                (metadata::AGGREGATE_SEQUENCE_NUMBER, version.to_string()),
                (metadata::TIMESTAMP, self.clock.now().to_rfc3339()),
            ]
            .into_iter()
            .collect(),
        };
        match snapshots.store.store_snapshot(snapshot).await {
            Ok(()) => tracing::debug!(version, "stored snapshot"),
            Err(err) => tracing::warn!(version, error = %err, "failed to store snapshot"),
        }
    }

    async fn load_root(
        &self,
        aggregate_id: &AggregateId,
        cancel: &CancellationToken,
    ) -> Result<(AggregateRoot<A>, Arc<LoadedStream<A::Event>>), Error> {
        if let Some(stream) = self
            .cache
            .as_ref()
            .and_then(|cache| cache.get(A::NAME, aggregate_id))
        {
            let root = self.rebuild(aggregate_id, &stream)?;
            return Ok((root, stream));
        }

        let generation = self
            .cache
            .as_ref()
            .map(|cache| cache.generation(A::NAME, aggregate_id));
        let stream = Arc::new(self.read_stream(aggregate_id, cancel).await?);
        let root = self.rebuild(aggregate_id, &stream)?;
        if let (Some(cache), Some(generation)) = (&self.cache, generation) {
            if !cache.insert(A::NAME, aggregate_id, generation, Arc::clone(&stream)) {
                tracing::debug!("stream invalidated while reading, not caching it");
            }
        }
        Ok((root, stream))
    }

    async fn read_stream(
        &self,
        aggregate_id: &AggregateId,
        cancel: &CancellationToken,
    ) -> Result<LoadedStream<A::Event>, Error> {
        let snapshot = match &self.snapshots {
            Some(snapshots) => {
                check_cancelled(cancel)?;
                self.usable_snapshot(snapshots, aggregate_id, cancel).await?
            }
            None => None,
        };
        let snapshot_version = snapshot.as_ref().map_or(0, |s| s.aggregate_sequence_number);

        check_cancelled(cancel)?;
        let committed = self
            .persistence
            .load_committed_events(A::NAME, aggregate_id, snapshot_version + 1, cancel)
            .await?;

        let mut upgraded = Vec::with_capacity(committed.len());
        for event in &committed {
            let decoded: A::Event = self
                .serializer
                .deserialize_event(&event.payload, &event.event_name, event.event_version)
                .map_err(|reason| Error::Serialization {
                    aggregate_id: aggregate_id.clone(),
                    sequence_number: event.aggregate_sequence_number,
                    event_name: event.event_name.clone(),
                    event_version: event.event_version,
                    reason,
                })?;
            upgraded.extend(self.upgraders.upgrade(decoded)?);
        }

        let version = committed
            .last()
            .map_or(snapshot_version, |e| e.aggregate_sequence_number);
        tracing::debug!(
            snapshot_version,
            events = committed.len(),
            version,
            "read event stream"
        );
        Ok(LoadedStream {
            snapshot,
            committed,
            upgraded,
            version,
        })
    }

    /// Loads the newest snapshot, falling back to a full replay when the
    /// snapshot cannot be read or no longer decodes into the current state
    /// type. Only cancellation is surfaced.
    async fn usable_snapshot(
        &self,
        snapshots: &SnapshotConfig,
        aggregate_id: &AggregateId,
        cancel: &CancellationToken,
    ) -> Result<Option<Snapshot>, Error> {
        let snapshot = match snapshots
            .store
            .load_snapshot(A::NAME, aggregate_id, cancel)
            .await
        {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => return Ok(None),
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(err) => {
                tracing::warn!(error = %err, "failed to load snapshot, replaying all events");
                return Ok(None);
            }
        };
        if let Err(reason) = self.serializer.deserialize_state::<A>(&snapshot.state) {
            tracing::warn!(
                version = snapshot.aggregate_sequence_number,
                %reason,
                "snapshot state does not decode, replaying all events"
            );
            return Ok(None);
        }
        Ok(Some(snapshot))
    }

    fn rebuild(
        &self,
        aggregate_id: &AggregateId,
        stream: &LoadedStream<A::Event>,
    ) -> Result<AggregateRoot<A>, Error> {
        let state = match &stream.snapshot {
            Some(snapshot) => self
                .serializer
                .deserialize_state(&snapshot.state)
                .map_err(|reason| Error::Serialization {
                    aggregate_id: aggregate_id.clone(),
                    sequence_number: snapshot.aggregate_sequence_number,
                    event_name: "snapshot".to_owned(),
                    event_version: 0,
                    reason,
                })?,
            None => A::default(),
        };
        let mut root = AggregateRoot::new(aggregate_id.clone(), state, 0, Arc::clone(&self.handlers));
        for event in &stream.upgraded {
            root.apply_committed(event)?;
        }
        root.set_version(stream.version);
        Ok(root)
    }

    fn invalidate(&self, aggregate_id: &AggregateId) {
        if let Some(cache) = &self.cache {
            cache.invalidate(A::NAME, aggregate_id);
        }
    }
}

fn check_cancelled(cancel: &CancellationToken) -> Result<(), Error> {
    if cancel.is_cancelled() {
        Err(Error::Cancelled)
    } else {
        Ok(())
    }
}

/// The run of events at the end of `events` that share the last event's
/// batch id.
fn trailing_batch(events: &[CommittedEvent]) -> &[CommittedEvent] {
    let Some(last) = events.last() else {
        return &[];
    };
    let start = events
        .iter()
        .rposition(|e| e.batch_id != last.batch_id)
        .map_or(0, |i| i + 1);
    &events[start..]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn committed(seq: u64, batch_id: Uuid) -> CommittedEvent {
        CommittedEvent {
            aggregate_id: AggregateId::new("order-1").unwrap(),
            aggregate_name: "order".into(),
            aggregate_sequence_number: seq,
            global_sequence_number: seq,
            event_name: "ItemAdded".into(),
            event_version: 2,
            payload: serde_json::json!({}),
            metadata: Metadata::new(),
            batch_id,
        }
    }

    #[test]
    fn test_trailing_batch_stops_at_batch_boundary() {
        let first = Uuid::now_v7();
        let second = Uuid::now_v7();
        let events = vec![
            committed(1, first),
            committed(2, first),
            committed(3, second),
            committed(4, second),
        ];

        let tail = trailing_batch(&events);

        let seqs: Vec<u64> = tail.iter().map(|e| e.aggregate_sequence_number).collect();
        assert_eq!(seqs, vec![3, 4]);
    }

    #[test]
    fn test_trailing_batch_of_single_batch_is_everything() {
        let batch = Uuid::now_v7();
        let events = vec![committed(1, batch), committed(2, batch)];

        assert_eq!(trailing_batch(&events).len(), 2);
        assert!(trailing_batch(&[]).is_empty());
    }

    #[test]
    fn test_check_cancelled() {
        let cancel = CancellationToken::new();
        assert!(check_cancelled(&cancel).is_ok());

        cancel.cancel();

        assert!(matches!(check_cancelled(&cancel), Err(Error::Cancelled)));
    }
}
