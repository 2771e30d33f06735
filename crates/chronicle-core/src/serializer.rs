//! Pluggable event and snapshot serialization.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::event::DomainEvent;

/// Converts typed events and aggregate state to stored payloads and back.
///
/// Re-serializing an unchanged value must produce semantically identical
/// output; byte identity is not required.
pub trait EventSerializer: Send + Sync {
    /// Serializes an event payload.
    ///
    /// # Errors
    ///
    /// Returns the serializer's message on failure.
    fn serialize_event<E: DomainEvent>(&self, event: &E) -> Result<serde_json::Value, String>;

    /// Deserializes an event payload, checking it against the stored
    /// `(name, version)` hint.
    ///
    /// # Errors
    ///
    /// Returns the serializer's message if the payload is malformed or does
    /// not decode to the hinted event type.
    fn deserialize_event<E: DomainEvent>(
        &self,
        payload: &serde_json::Value,
        event_name: &str,
        event_version: u32,
    ) -> Result<E, String>;

    /// Serializes aggregate state for a snapshot.
    ///
    /// # Errors
    ///
    /// Returns the serializer's message on failure.
    fn serialize_state<T: Serialize>(&self, state: &T) -> Result<serde_json::Value, String>;

    /// Deserializes aggregate state from a snapshot.
    ///
    /// # Errors
    ///
    /// Returns the serializer's message on failure.
    fn deserialize_state<T: DeserializeOwned>(&self, state: &serde_json::Value)
    -> Result<T, String>;
}

/// JSON serializer built on `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonEventSerializer;

impl EventSerializer for JsonEventSerializer {
    fn serialize_event<E: DomainEvent>(&self, event: &E) -> Result<serde_json::Value, String> {
        serde_json::to_value(event).map_err(|e| e.to_string())
    }

    fn deserialize_event<E: DomainEvent>(
        &self,
        payload: &serde_json::Value,
        event_name: &str,
        event_version: u32,
    ) -> Result<E, String> {
        let event: E = serde_json::from_value(payload.clone()).map_err(|e| e.to_string())?;
        let decoded = event.event_type();
        if !decoded.matches(event_name, event_version) {
            return Err(format!(
                "payload decodes to {decoded}, but was stored as {event_name}@v{event_version}"
            ));
        }
        Ok(event)
    }

    fn serialize_state<T: Serialize>(&self, state: &T) -> Result<serde_json::Value, String> {
        serde_json::to_value(state).map_err(|e| e.to_string())
    }

    fn deserialize_state<T: DeserializeOwned>(
        &self,
        state: &serde_json::Value,
    ) -> Result<T, String> {
        serde_json::from_value(state.clone()).map_err(|e| e.to_string())
    }
}
