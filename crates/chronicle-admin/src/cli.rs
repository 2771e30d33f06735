//! Command line definition.

use clap::{Parser, Subcommand};

/// Maintenance tool for the Chronicle `PostgreSQL` event store.
#[derive(Debug, Parser)]
#[command(name = "chronicle-admin", version, about)]
pub struct Cli {
    /// `PostgreSQL` connection string.
    #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
    pub database_url: String,

    /// Maximum number of pooled connections.
    #[arg(long, env = "CHRONICLE_MAX_CONNECTIONS", default_value_t = 5)]
    pub max_connections: u32,

    #[command(subcommand)]
    pub command: Command,
}

/// Admin subcommands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Apply the embedded schema migrations.
    Migrate,

    /// Print committed events in global order as JSON lines.
    Tail {
        /// First global sequence number to print.
        #[arg(long, default_value_t = 1)]
        from: u64,

        /// Events fetched per round trip.
        #[arg(long, default_value_t = 500)]
        page_size: usize,

        /// Stop after this many events.
        #[arg(long)]
        limit: Option<u64>,
    },

    /// Delete every event and snapshot of one aggregate.
    Purge {
        /// Aggregate type name.
        aggregate_name: String,

        /// Aggregate identifier.
        aggregate_id: String,
    },
}
