//! Feed ingestor daemon.

use anyhow::{bail, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use iprisk::config::Config;
use iprisk::feeds::FeedsConfig;
use iprisk::ingestor::Ingestor;
use iprisk::store::PostgresStore;

#[derive(Parser)]
#[command(name = "iprisk-ingestor")]
#[command(author, version, about = "Threat feed ingestor service")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "configs/config.toml")]
    config: PathBuf,

    /// Path to feeds configuration file
    #[arg(short, long, default_value = "configs/feeds.toml")]
    feeds: PathBuf,

    /// Run every enabled feed once and exit
    #[arg(long)]
    once: bool,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();

    if let Err(e) = run(args).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }

    Ok(())
}

async fn run(args: Args) -> Result<()> {
    let config = Config::load(&args.config)?;
    let feeds = FeedsConfig::load(&args.feeds)?;

    if !config.ingestor.enabled {
        bail!("ingestor is disabled in configuration");
    }

    let enabled = feeds.enabled_feeds().len();
    info!(feeds = enabled, "loaded feed catalogue");

    let store = Arc::new(PostgresStore::connect(&config.database.postgres).await?);
    let ingestor = Arc::new(Ingestor::new(config.ingestor.clone(), feeds, store)?);

    ingestor.sync_whitelist().await?;

    if args.once {
        let stats = ingestor.run_once().await;
        println!("Feeds processed: {}", stats.feeds);
        println!("Entries fetched: {}", stats.fetched);
        println!("Entries stored:  {}", stats.stored);

        if stats.failed_feeds > 0 {
            bail!("{} feed(s) had errors", stats.failed_feeds);
        }
        return Ok(());
    }

    info!("ingestor service starting");
    let shutdown = iprisk::shutdown_channel();
    ingestor.run_scheduled(shutdown).await?;
    info!("ingestor stopped gracefully");

    Ok(())
}
