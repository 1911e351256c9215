use anyhow::Result;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use grank_core::Platform;
use grank_storage::{BoardFilter, CatalogStore};
use grank_sync::SyncConfig;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "grank")]
#[command(about = "Game ranking collector and catalog")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync pass over the configured sources.
    Sync,
    /// Run the daemon: eager sync at startup, then the daily cron job.
    Schedule,
    /// Serve the catalog JSON API.
    Serve,
    /// Create the database and bootstrap the schema.
    Migrate,
    /// Print a day's ranking board.
    Board {
        /// Day to print; defaults to the most recent recorded day.
        #[arg(long)]
        date: Option<NaiveDate>,
        #[arg(long)]
        platform: Option<Platform>,
        #[arg(long, default_value = "hot")]
        rank_type: String,
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = grank_sync::run_sync_once_from_env().await?;
            println!(
                "sync complete: run_id={} sources={} saved={} failed={}",
                summary.run_id,
                summary.sources.len(),
                summary.total_saved(),
                summary.failed_sources().len()
            );
            for (source_id, outcome) in &summary.sources {
                let status = if outcome.skipped {
                    "skipped"
                } else if outcome.success {
                    "ok"
                } else {
                    "failed"
                };
                match &outcome.error {
                    Some(error) => println!("  {source_id}: {status} ({error})"),
                    None => println!("  {source_id}: {status}, saved {}", outcome.count),
                }
            }
        }
        Commands::Schedule => {
            grank_sync::run_daemon_from_env().await?;
        }
        Commands::Serve => {
            grank_web::serve_from_env().await?;
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env();
            let store = CatalogStore::open(&config.database_url).await?;
            store.close().await;
            println!("schema ready at {}", config.database_url);
        }
        Commands::Board {
            date,
            platform,
            rank_type,
            limit,
        } => {
            let config = SyncConfig::from_env();
            let store = CatalogStore::open(&config.database_url).await?;
            let board = store
                .ranking_board(&BoardFilter {
                    platform,
                    rank_type: Some(rank_type),
                    rank_date: date,
                    limit: Some(limit),
                })
                .await?;
            if board.is_empty() {
                println!("no rankings recorded for that day");
            } else {
                for row in &board {
                    println!(
                        "{:>3}. {} [{}:{}] fans={} hits={} wish={} tags={}",
                        row.position,
                        row.title,
                        row.platform,
                        row.platform_id,
                        row.metrics.fans_count,
                        row.metrics.hits_total,
                        row.metrics.wish_count,
                        row.tags.join(",")
                    );
                }
            }
            store.close().await;
        }
    }

    Ok(())
}
