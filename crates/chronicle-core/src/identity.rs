//! Aggregate and source identities.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Opaque, non-empty identity of one aggregate instance within its
/// aggregate-type namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AggregateId(String);

impl AggregateId {
    /// Creates an aggregate id.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidAggregateId` if `value` is empty or only
    /// whitespace.
    pub fn new(value: impl Into<String>) -> Result<Self, Error> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(Error::InvalidAggregateId(value));
        }
        Ok(Self(value))
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for AggregateId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<AggregateId> for String {
    fn from(id: AggregateId) -> Self {
        id.0
    }
}

impl fmt::Display for AggregateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Idempotency token supplied by the caller of an update, typically the id
/// of the command being handled.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(String);

impl SourceId {
    /// Creates a source id.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate_id_rejects_blank_values() {
        assert!(matches!(
            AggregateId::new(""),
            Err(Error::InvalidAggregateId(_))
        ));
        assert!(matches!(
            AggregateId::new("   "),
            Err(Error::InvalidAggregateId(_))
        ));
    }

    #[test]
    fn test_aggregate_id_deserialization_validates() {
        let ok: AggregateId = serde_json::from_str("\"order-1\"").unwrap();
        assert_eq!(ok.as_str(), "order-1");

        let err = serde_json::from_str::<AggregateId>("\"\"");
        assert!(err.is_err());
    }
}
