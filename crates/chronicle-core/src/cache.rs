//! In-memory cache of loaded event streams.
//!
//! Keyed by `(aggregate name, aggregate id)`. Entries expire after a TTL
//! measured with the injected [`Clock`]. Invalidation takes the write lock,
//! so once it returns no reader can observe the old entry.
//!
//! A stream read from storage may be older than an invalidation that
//! happened while the read was in flight. Readers therefore take a
//! [`Generation`] before reading and hand it back to [`EventCache::insert`],
//! which refuses the stream if the key was invalidated in the meantime.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::clock::Clock;
use crate::identity::AggregateId;

type CacheKey = (String, AggregateId);

/// Invalidation stamp of one cache key, taken before reading the stream that
/// is later inserted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Generation(u64);

struct Entry<S> {
    stream: Arc<S>,
    expires_at: DateTime<Utc>,
}

struct Slot<S> {
    entry: Option<Entry<S>>,
    invalidated_at: u64,
}

struct State<S> {
    slots: HashMap<CacheKey, Slot<S>>,
    /// Incremented by every invalidation and clear.
    counter: u64,
    cleared_at: u64,
}

impl<S> State<S> {
    fn generation(&self, key: &CacheKey) -> Generation {
        let invalidated_at = self.slots.get(key).map_or(0, |slot| slot.invalidated_at);
        Generation(invalidated_at.max(self.cleared_at))
    }
}

/// Shared, TTL-bounded cache of event streams.
///
/// Construct one per process and share it through an `Arc`.
pub struct EventCache<S> {
    state: RwLock<State<S>>,
    ttl: chrono::Duration,
    clock: Arc<dyn Clock>,
}

impl<S> std::fmt::Debug for EventCache<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventCache")
            .field("ttl", &self.ttl)
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

impl<S> EventCache<S> {
    /// Creates an empty cache.
    #[must_use]
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: RwLock::new(State {
                slots: HashMap::new(),
                counter: 0,
                cleared_at: 0,
            }),
            ttl: chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX),
            clock,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, State<S>> {
        self.state
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, State<S>> {
        self.state
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Returns the cached stream unless it is missing or expired.
    #[must_use]
    pub fn get(&self, aggregate_name: &str, aggregate_id: &AggregateId) -> Option<Arc<S>> {
        let key = (aggregate_name.to_owned(), aggregate_id.clone());
        let now = self.clock.now();
        {
            let state = self.read();
            match state.slots.get(&key).and_then(|slot| slot.entry.as_ref()) {
                None => return None,
                Some(entry) if entry.expires_at > now => return Some(Arc::clone(&entry.stream)),
                Some(_) => {}
            }
        }
        let mut state = self.write();
        if let Some(slot) = state.slots.get_mut(&key) {
            if slot.entry.as_ref().is_some_and(|e| e.expires_at <= now) {
                slot.entry = None;
            }
        }
        None
    }

    /// Returns the current generation of one key. Take it before reading the
    /// stream to be inserted.
    #[must_use]
    pub fn generation(&self, aggregate_name: &str, aggregate_id: &AggregateId) -> Generation {
        self.read()
            .generation(&(aggregate_name.to_owned(), aggregate_id.clone()))
    }

    /// Caches `stream`, replacing any previous entry, unless the key has
    /// been invalidated since `generation` was taken. Returns `true` if the
    /// stream was stored.
    pub fn insert(
        &self,
        aggregate_name: &str,
        aggregate_id: &AggregateId,
        generation: Generation,
        stream: Arc<S>,
    ) -> bool {
        let key = (aggregate_name.to_owned(), aggregate_id.clone());
        let expires_at = self
            .clock
            .now()
            .checked_add_signed(self.ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let mut state = self.write();
        if state.generation(&key) != generation {
            return false;
        }
        let invalidated_at = generation.0;
        state
            .slots
            .entry(key)
            .or_insert(Slot {
                entry: None,
                invalidated_at,
            })
            .entry = Some(Entry { stream, expires_at });
        true
    }

    /// Drops the entry for one aggregate. A stream read before this call
    /// can no longer be inserted.
    pub fn invalidate(&self, aggregate_name: &str, aggregate_id: &AggregateId) {
        let mut state = self.write();
        state.counter += 1;
        let invalidated_at = state.counter;
        state.slots.insert(
            (aggregate_name.to_owned(), aggregate_id.clone()),
            Slot {
                entry: None,
                invalidated_at,
            },
        );
    }

    /// Drops every entry.
    pub fn clear(&self) {
        let mut state = self.write();
        state.counter += 1;
        state.cleared_at = state.counter;
        state.slots.clear();
    }

    /// Number of entries, including expired ones not yet evicted.
    #[must_use]
    pub fn len(&self) -> usize {
        self.read()
            .slots
            .values()
            .filter(|slot| slot.entry.is_some())
            .count()
    }

    /// Returns `true` if the cache holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
