//! iprisk: IP reputation service
//!
//! Fuses public threat-intelligence feeds into fast per-IP risk answers.
//! The pipeline ingests feed text into a PostgreSQL observation store,
//! scores and merges observations per prefix, compiles the result into a
//! memory-mappable MaxMind DB file, and serves longest-prefix-match
//! lookups with atomic hot-swap on recompile.

pub mod compiler;
pub mod config;
pub mod feeds;
pub mod ingestor;
pub mod iputil;
pub mod mmdb;
pub mod models;
pub mod parser;
pub mod scoring;
pub mod store;

pub use compiler::Compiler;
pub use config::Config;
pub use feeds::FeedsConfig;
pub use ingestor::Ingestor;
pub use mmdb::{MmdbReader, MmdbWriter};
pub use models::{IpCheckResult, Observation, RiskLevel};
pub use scoring::Scorer;
pub use store::PostgresStore;

use tokio::sync::watch;
use tracing::info;

/// Wait for SIGINT or SIGTERM. Long-running binaries select on this and
/// then finish in-flight work before exiting.
pub async fn wait_for_shutdown() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
}

/// Spawn the shutdown watcher and return the receiver side.
pub fn shutdown_channel() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_shutdown().await;
        let _ = tx.send(true);
    });
    rx
}
