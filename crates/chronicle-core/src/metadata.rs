//! Event metadata and metadata providers.
//!
//! Every committed event carries an ordered, case-sensitive key/value map.
//! The aggregate store writes the reserved keys; [`MetadataProvider`]s may
//! only add keys that are neither reserved nor already present.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;
use crate::identity::AggregateId;

/// Reserved key: aggregate id.
pub const AGGREGATE_ID: &str = "aggregate_id";
/// Reserved key: aggregate type name.
pub const AGGREGATE_NAME: &str = "aggregate_name";
/// Reserved key: aggregate sequence number.
pub const AGGREGATE_SEQUENCE_NUMBER: &str = "aggregate_sequence_number";
/// Reserved key: event name.
pub const EVENT_NAME: &str = "event_name";
/// Reserved key: event schema version.
pub const EVENT_VERSION: &str = "event_version";
/// Reserved key: RFC 3339 commit timestamp.
pub const TIMESTAMP: &str = "timestamp";
/// Reserved key: idempotency token of the update that produced the event.
pub const SOURCE_ID: &str = "source_id";
/// Reserved key: id shared by every event committed in one batch.
pub const BATCH_ID: &str = "batch_id";

/// Keys written by the aggregate store itself.
pub const RESERVED_KEYS: &[&str] = &[
    AGGREGATE_ID,
    AGGREGATE_NAME,
    AGGREGATE_SEQUENCE_NUMBER,
    EVENT_NAME,
    EVENT_VERSION,
    TIMESTAMP,
    SOURCE_ID,
    BATCH_ID,
];

/// Ordered key/value metadata attached to an event or snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(BTreeMap<String, String>);

impl Metadata {
    /// Creates empty metadata.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an entry. Metadata is additive: an existing key is never
    /// overwritten.
    ///
    /// # Errors
    ///
    /// Returns `Error::MetadataCollision` if `key` is already present.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Result<(), Error> {
        match self.0.entry(key.into()) {
            Entry::Occupied(entry) => Err(Error::MetadataCollision {
                key: entry.key().clone(),
            }),
            Entry::Vacant(entry) => {
                entry.insert(value.into());
                Ok(())
            }
        }
    }

    /// Returns the value stored under `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Returns the source id recorded for the event, if any.
    #[must_use]
    pub fn source_id(&self) -> Option<&str> {
        self.get(SOURCE_ID)
    }

    /// Returns the batch id recorded for the event, if it parses.
    #[must_use]
    pub fn batch_id(&self) -> Option<Uuid> {
        self.get(BATCH_ID).and_then(|v| Uuid::parse_str(v).ok())
    }

    /// Iterates entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if there are no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Metadata {
    /// Collects entries; the first occurrence of a key wins.
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = BTreeMap::new();
        for (key, value) in iter {
            map.entry(key.into()).or_insert_with(|| value.into());
        }
        Self(map)
    }
}

/// What a metadata provider may inspect about the event being committed.
///
/// `metadata` holds only the reserved entries, so a provider never observes
/// another provider's output.
#[derive(Debug)]
pub struct MetadataContext<'a> {
    /// Aggregate type name.
    pub aggregate_name: &'a str,
    /// Aggregate identity.
    pub aggregate_id: &'a AggregateId,
    /// Name of the event being committed.
    pub event_name: &'a str,
    /// Schema version of the event being committed.
    pub event_version: u32,
    /// Serialized event payload.
    pub payload: &'a serde_json::Value,
    /// Reserved metadata already assigned to the event.
    pub metadata: &'a Metadata,
}

/// Contributes additional metadata entries to every committed event.
pub trait MetadataProvider: Send + Sync {
    /// Returns the entries to add. Keys must not be reserved.
    fn provide(&self, context: &MetadataContext<'_>) -> Vec<(String, String)>;
}

/// Adds the same fixed entries to every event (host name, application
/// version and similar provenance).
#[derive(Debug, Clone, Default)]
pub struct StaticMetadataProvider {
    entries: Vec<(String, String)>,
}

impl StaticMetadataProvider {
    /// Creates a provider with no entries.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a fixed entry.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.entries.push((key.into(), value.into()));
        self
    }
}

impl MetadataProvider for StaticMetadataProvider {
    fn provide(&self, _context: &MetadataContext<'_>) -> Vec<(String, String)> {
        self.entries.clone()
    }
}

/// Assigns every event a time-ordered unique id under `event_id`.
#[derive(Debug, Clone, Copy, Default)]
pub struct EventIdMetadataProvider;

/// Key written by [`EventIdMetadataProvider`].
pub const EVENT_ID: &str = "event_id";

impl MetadataProvider for EventIdMetadataProvider {
    fn provide(&self, _context: &MetadataContext<'_>) -> Vec<(String, String)> {
        vec![(EVENT_ID.to_owned(), Uuid::now_v7().to_string())]
    }
}

/// Merges provider output into `metadata`, rejecting reserved or duplicate
/// keys.
///
/// # Errors
///
/// Returns `Error::MetadataCollision` on the first reserved or already-present
/// key.
pub fn apply_providers(
    providers: &[std::sync::Arc<dyn MetadataProvider>],
    context: &MetadataContext<'_>,
    metadata: &mut Metadata,
) -> Result<(), Error> {
    for provider in providers {
        for (key, value) in provider.provide(context) {
            if RESERVED_KEYS.contains(&key.as_str()) {
                return Err(Error::MetadataCollision { key });
            }
            metadata.insert(key, value)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn context<'a>(id: &'a AggregateId, payload: &'a serde_json::Value, meta: &'a Metadata) -> MetadataContext<'a> {
        MetadataContext {
            aggregate_name: "order",
            aggregate_id: id,
            event_name: "ItemAdded",
            event_version: 2,
            payload,
            metadata: meta,
        }
    }

    #[test]
    fn test_insert_is_additive() {
        let mut meta = Metadata::new();
        meta.insert("host", "a").unwrap();

        let err = meta.insert("host", "b").unwrap_err();

        assert!(matches!(err, Error::MetadataCollision { key } if key == "host"));
        assert_eq!(meta.get("host"), Some("a"));
    }

    #[test]
    fn test_keys_are_case_sensitive() {
        let mut meta = Metadata::new();
        meta.insert("Host", "a").unwrap();
        meta.insert("host", "b").unwrap();

        assert_eq!(meta.len(), 2);
    }

    #[test]
    fn test_apply_providers_merges_independent_entries() {
        let id = AggregateId::new("order-1").unwrap();
        let payload = serde_json::json!({});
        let reserved = Metadata::new();
        let providers: Vec<Arc<dyn MetadataProvider>> = vec![
            Arc::new(StaticMetadataProvider::new().with("host", "worker-7")),
            Arc::new(EventIdMetadataProvider),
        ];
        let mut meta = Metadata::new();

        apply_providers(&providers, &context(&id, &payload, &reserved), &mut meta).unwrap();

        assert_eq!(meta.get("host"), Some("worker-7"));
        assert!(meta.get(EVENT_ID).is_some());
    }

    #[test]
    fn test_apply_providers_rejects_reserved_keys() {
        let id = AggregateId::new("order-1").unwrap();
        let payload = serde_json::json!({});
        let reserved = Metadata::new();
        let providers: Vec<Arc<dyn MetadataProvider>> =
            vec![Arc::new(StaticMetadataProvider::new().with(TIMESTAMP, "yesterday"))];
        let mut meta = Metadata::new();

        let err =
            apply_providers(&providers, &context(&id, &payload, &reserved), &mut meta).unwrap_err();

        assert!(matches!(err, Error::MetadataCollision { key } if key == TIMESTAMP));
    }

    #[test]
    fn test_apply_providers_rejects_collisions_between_providers() {
        let id = AggregateId::new("order-1").unwrap();
        let payload = serde_json::json!({});
        let reserved = Metadata::new();
        let providers: Vec<Arc<dyn MetadataProvider>> = vec![
            Arc::new(StaticMetadataProvider::new().with("host", "a")),
            Arc::new(StaticMetadataProvider::new().with("host", "b")),
        ];
        let mut meta = Metadata::new();

        let err =
            apply_providers(&providers, &context(&id, &payload, &reserved), &mut meta).unwrap_err();

        assert!(matches!(err, Error::MetadataCollision { key } if key == "host"));
    }
}
