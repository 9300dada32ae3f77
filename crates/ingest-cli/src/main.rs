use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ingest_storage::PgSubmissionStore;
use ingest_sync::{connect_engine, fetch_all_submissions, IngestConfig};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "replay-ingest")]
#[command(about = "Copy replay submissions from the submissions spreadsheet into the replay database")]
struct Cli {
    /// YAML config file; environment variables override it.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Google spreadsheet id (the `/d/<id>/edit` part of the sheet URL).
    #[arg(long, global = true, env = "SPREADSHEET_ID")]
    spreadsheet_id: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the watching daemon.
    Daemon {
        #[arg(long, env = "DATABASE_URL")]
        database_url: Option<String>,
        #[arg(long)]
        interval_secs: Option<u64>,
    },
    /// Fetch the sheet once and print its submissions as JSON.
    Dump,
    /// Apply database migrations and exit.
    Migrate {
        #[arg(long, env = "DATABASE_URL")]
        database_url: Option<String>,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let mut config = IngestConfig::load(cli.config.as_deref())?;
    if let Some(spreadsheet_id) = cli.spreadsheet_id {
        config.spreadsheet_id = Some(spreadsheet_id);
    }

    match cli.command.unwrap_or(Commands::Daemon {
        database_url: None,
        interval_secs: None,
    }) {
        Commands::Daemon {
            database_url,
            interval_secs,
        } => {
            if let Some(database_url) = database_url {
                config.database_url = database_url;
            }
            if let Some(interval_secs) = interval_secs {
                config.poll_interval_secs = interval_secs;
            }
            run_daemon(&config).await?;
        }
        Commands::Dump => {
            let submissions = fetch_all_submissions(&config).await?;
            let json = serde_json::to_string_pretty(&submissions).context("serializing submissions")?;
            println!("{json}");
        }
        Commands::Migrate { database_url } => {
            if let Some(database_url) = database_url {
                config.database_url = database_url;
            }
            PgSubmissionStore::connect(&config.database_url)
                .await?
                .migrate()
                .await?;
            info!(database_url = %config.database_url, "migrations applied");
        }
    }

    Ok(())
}

async fn run_daemon(config: &IngestConfig) -> Result<()> {
    let mut engine = connect_engine(config).await?;
    info!(
        spreadsheet_id = config.spreadsheet_id.as_deref().unwrap_or_default(),
        interval_secs = config.poll_interval().as_secs(),
        "ingest daemon started"
    );

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested, finishing current cycle");
            on_signal.cancel();
        }
    });

    engine.execute(cancel).await
}
