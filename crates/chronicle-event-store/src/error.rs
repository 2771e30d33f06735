//! Backend-local error type.
//!
//! Database errors stay typed while the transient-retry loop classifies
//! them, and are folded into `chronicle_core::error::Error` at the trait
//! boundary.

use chronicle_core::error::Error;

/// Failure inside a `PostgreSQL` backend operation.
#[derive(Debug, thiserror::Error)]
pub enum PgError {
    /// Error reported by sqlx or the database.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A domain-level failure such as a concurrency conflict. Never retried.
    #[error(transparent)]
    Core(#[from] Error),
}

impl From<PgError> for Error {
    fn from(error: PgError) -> Self {
        match error {
            PgError::Database(e) => Error::Storage(e.to_string()),
            PgError::Core(e) => e,
        }
    }
}

/// Converts a stored `BIGINT` back to a sequence number.
pub(crate) fn to_u64(value: i64, column: &str) -> Result<u64, PgError> {
    u64::try_from(value)
        .map_err(|_| PgError::Core(Error::Storage(format!("negative {column}: {value}"))))
}

/// Converts a sequence number to a `BIGINT` bind parameter.
pub(crate) fn to_i64(value: u64, what: &str) -> Result<i64, Error> {
    i64::try_from(value)
        .map_err(|_| Error::InvalidArgument(format!("{what} {value} exceeds the BIGINT range")))
}

/// Converts an event version to an `INTEGER` bind parameter.
pub(crate) fn to_i32_version(version: u32) -> Result<i32, Error> {
    i32::try_from(version).map_err(|_| {
        Error::InvalidBatch(format!("event version {version} exceeds the INTEGER range"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_errors_fold_into_storage() {
        let err: Error = PgError::Database(sqlx::Error::PoolTimedOut).into();

        assert!(matches!(err, Error::Storage(_)));
    }

    #[test]
    fn test_core_errors_pass_through() {
        let err: Error = PgError::Core(Error::Cancelled).into();

        assert!(matches!(err, Error::Cancelled));
    }

    #[test]
    fn test_sequence_conversions() {
        assert_eq!(to_u64(7, "seq").unwrap(), 7);
        assert!(to_u64(-1, "seq").is_err());
        assert_eq!(to_i64(7, "seq").unwrap(), 7);
    }

    #[test]
    fn test_out_of_range_binds_are_rejected_not_clamped() {
        assert!(matches!(
            to_i64(u64::MAX, "aggregate sequence number"),
            Err(Error::InvalidArgument(msg)) if msg.contains("aggregate sequence number")
        ));
        assert!(matches!(
            to_i32_version(u32::MAX),
            Err(Error::InvalidBatch(_))
        ));
        assert_eq!(to_i32_version(2).unwrap(), 2);
    }
}
