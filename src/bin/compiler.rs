//! Reputation database compiler daemon.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use iprisk::compiler::Compiler;
use iprisk::config::Config;
use iprisk::store::PostgresStore;

#[derive(Parser)]
#[command(name = "iprisk-compiler")]
#[command(author, version, about = "Reputation database compiler service")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "configs/config.toml")]
    config: PathBuf,

    /// Run compilation once and exit
    #[arg(long)]
    oneshot: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
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
    let store = Arc::new(PostgresStore::connect(&config.database.postgres).await?);
    let compiler = Compiler::new(&config, store);

    if args.oneshot {
        info!("running in one-shot mode");
        let report = compiler.compile_once().await?;
        info!(
            prefixes = report.prefixes,
            inserted = report.inserted,
            skipped = report.skipped,
            duration_ms = report.duration_ms,
            "compilation complete"
        );
        return Ok(());
    }

    let shutdown = iprisk::shutdown_channel();
    compiler.run(shutdown).await?;
    info!("compiler stopped gracefully");

    Ok(())
}
