//! Chronicle admin — error types.

use thiserror::Error;

/// Errors surfaced by the admin commands.
#[derive(Debug, Error)]
pub enum AdminError {
    /// Database connection or pool error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Applying the embedded migrations failed.
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    /// An event store operation failed.
    #[error(transparent)]
    Store(#[from] chronicle_core::error::Error),

    /// Writing command output failed.
    #[error("output error: {0}")]
    Output(#[from] std::io::Error),

    /// An event could not be rendered as JSON.
    #[error("encoding error: {0}")]
    Encode(#[from] serde_json::Error),
}
