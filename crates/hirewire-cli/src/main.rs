use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hirewire_ingest::IngestConfig;
use hirewire_parse::PostingConsumer;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "hirewire")]
#[command(about = "Hacker News hiring thread ingester")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Poll on the configured interval until interrupted.
    Run,
    /// Run a single fetch cycle and print its summary.
    Once,
    /// Consume published postings and parse them.
    Process,
    /// Parse a JSON-encoded job posting from a file.
    Parse { path: PathBuf },
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

/// Cancels the returned token on the first ctrl-c.
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for ctrl-c");
            return;
        }
        info!("shutdown signal received");
        trigger.cancel();
    });
    cancel
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let config = IngestConfig::from_env();
    info!(
        polling_interval = ?config.polling_interval,
        story_workers = config.pools.story_workers,
        comment_workers = config.pools.comment_workers,
        max_retries = config.retry.max_retries,
        nats_url = %config.nats_url,
        "loaded configuration"
    );

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let scheduler = hirewire_ingest::scheduler_from_config(&config).await?;
            let cancel = cancel_on_ctrl_c();
            // Cancellation is the normal way out of the loop.
            let _ = scheduler.start(cancel).await;
            scheduler.stop();
            info!(cycles = scheduler.cycles_started(), "ingester shut down");
        }
        Commands::Once => {
            let cycle = hirewire_ingest::fetch_cycle_from_config(&config).await?;
            let summary = cycle.run(&cancel_on_ctrl_c()).await?;
            println!(
                "fetch complete: cycle_id={} candidates={} hiring_threads={} comments={}",
                summary.cycle_id,
                summary.candidates,
                summary.hiring_threads_found,
                summary.comments_processed
            );
        }
        Commands::Process => {
            let consumer =
                PostingConsumer::connect(&config.nats_url, config.nats_connect_timeout).await?;
            let stats = consumer.run(cancel_on_ctrl_c()).await?;
            println!(
                "processing stopped: received={} parsed={} failed={}",
                stats.received, stats.parsed, stats.failed
            );
        }
        Commands::Parse { path } => {
            let raw = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            let job = hirewire_parse::parse_job_posting(&raw)
                .with_context(|| format!("parsing {}", path.display()))?;
            println!("{}", serde_json::to_string_pretty(&job)?);
        }
    }

    Ok(())
}
