//! Domain event abstractions.

use std::fmt;

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Name and schema version of one event variant.
///
/// This is the tag that handler tables and upgrader chains are keyed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventType {
    /// Stable event name, stored alongside the payload.
    pub name: &'static str,
    /// Schema version of the payload, starting at 1.
    pub version: u32,
}

impl EventType {
    /// Creates an event type tag.
    #[must_use]
    pub const fn new(name: &'static str, version: u32) -> Self {
        Self { name, version }
    }

    /// Returns `true` if this tag names the stored `(name, version)` pair.
    #[must_use]
    pub fn matches(&self, name: &str, version: u32) -> bool {
        self.name == name && self.version == version
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@v{}", self.name, self.version)
    }
}

/// Trait that all domain events implement.
///
/// Events are closed enums: every variant, including superseded schema
/// versions kept around for upgrading, reports its own [`EventType`].
pub trait DomainEvent:
    Serialize + DeserializeOwned + Clone + fmt::Debug + Send + Sync + 'static
{
    /// Returns the name and version of this event variant.
    fn event_type(&self) -> EventType;
}
