//! Chronicle admin entry point.

use std::process::ExitCode;

use chronicle_admin::cli::{Cli, Command};
use chronicle_admin::commands;
use chronicle_admin::error::AdminError;
use chronicle_core::CancellationToken;
use chronicle_event_store::{PgEventPersistence, PgSnapshotStore};
use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    // Logs go to stderr so `tail` output stays pipeable.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .json()
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "command failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), AdminError> {
    let pool = PgPoolOptions::new()
        .max_connections(cli.max_connections)
        .connect(&cli.database_url)
        .await?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, stopping");
            on_signal.cancel();
        }
    });

    match cli.command {
        Command::Migrate => commands::migrate(&pool).await,
        Command::Tail {
            from,
            page_size,
            limit,
        } => {
            let persistence = PgEventPersistence::new(pool);
            let mut out = std::io::stdout().lock();
            let written =
                commands::tail(&persistence, from, page_size, limit, &mut out, &cancel).await?;
            tracing::info!(written, "tail finished");
            Ok(())
        }
        Command::Purge {
            aggregate_name,
            aggregate_id,
        } => {
            let persistence = PgEventPersistence::new(pool.clone());
            let snapshots = PgSnapshotStore::new(pool);
            commands::purge(
                &persistence,
                &snapshots,
                &aggregate_name,
                &aggregate_id,
                &cancel,
            )
            .await?;
            Ok(())
        }
    }
}
