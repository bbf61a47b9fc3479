use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use cot_sync::{pipeline_from_config, PgCotStore, RefreshConfig, RefreshMode};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "cot-cli")]
#[command(about = "COT positioning index command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    Full,
    Year,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Ingest report archives and recompute metrics.
    Refresh {
        #[arg(long, value_enum, default_value_t = Mode::Full)]
        mode: Mode,
        /// Year to ingest (`--mode year`) or to backfill from (`--mode full`).
        #[arg(long)]
        year: Option<i32>,
    },
    /// Apply database migrations.
    Migrate,
    /// Serve the HTTP API.
    Serve,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = RefreshConfig::from_env();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Refresh { mode, year } => {
            let mode = match mode {
                Mode::Full => RefreshMode::Full { from: year },
                Mode::Year => RefreshMode::Year(year.context("--mode year requires --year")?),
            };
            let pipeline = pipeline_from_config(&config).await?;
            let outcome = pipeline.coordinator.try_refresh(mode).await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Commands::Migrate => {
            let store = PgCotStore::connect(&config.database_url, config.db_max_connections)
                .await
                .context("connecting to postgres")?;
            store.migrate().await.context("applying migrations")?;
            info!("migrations applied");
        }
        Commands::Serve => {
            cot_web::serve_from_env().await?;
        }
    }

    Ok(())
}
