use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tabled::{Table, Tabled};

use iprisk::compiler::Compiler;
use iprisk::config::Config;
use iprisk::feeds::FeedsConfig;
use iprisk::ingestor::Ingestor;
use iprisk::iputil;
use iprisk::mmdb::MmdbReader;
use iprisk::models::RiskLevel;
use iprisk::store::PostgresStore;

#[derive(Parser)]
#[command(name = "iprisk")]
#[command(author, version, about = "IP reputation service toolkit")]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Look up the reputation of an IP address
    Lookup {
        /// IP address to check
        ip: String,

        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Fetch threat feeds into the store
    Ingest {
        /// Path to the feed catalogue
        #[arg(short, long)]
        feeds: Option<PathBuf>,

        /// Run every enabled feed once and exit
        #[arg(long)]
        once: bool,
    },

    /// Compile the reputation database from the store
    Compile {
        /// Compile once and exit instead of running on the interval
        #[arg(long)]
        oneshot: bool,
    },

    /// Show store and database statistics
    Stats,

    /// Manage the whitelist
    Whitelist {
        #[command(subcommand)]
        action: WhitelistAction,
    },

    /// Remove expired observations from the store
    Cleanup,

    /// Generate a default configuration file
    GenConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Generate a default feed catalogue
    GenFeeds {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
pub enum WhitelistAction {
    /// Add an IP or CIDR range to the whitelist
    Add {
        /// IP address or CIDR prefix
        prefix: String,

        /// Comment/reason
        #[arg(short, long)]
        comment: Option<String>,
    },

    /// Remove an IP or CIDR range from the whitelist
    Remove {
        /// IP address or CIDR prefix
        prefix: String,
    },

    /// List whitelisted ranges
    List,
}

/// Table row for whitelist listing
#[derive(Tabled)]
struct WhitelistRow {
    #[tabled(rename = "Range")]
    range: String,
    #[tabled(rename = "Comment")]
    comment: String,
    #[tabled(rename = "Permanent")]
    permanent: String,
    #[tabled(rename = "Added")]
    added: String,
}

pub async fn run_command(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default()?,
    };

    match cli.command {
        Commands::Lookup { ip, json } => cmd_lookup(config, ip, json).await,
        Commands::Ingest { feeds, once } => cmd_ingest(config, feeds, once).await,
        Commands::Compile { oneshot } => cmd_compile(config, oneshot).await,
        Commands::Stats => cmd_stats(config).await,
        Commands::Whitelist { action } => cmd_whitelist(config, action).await,
        Commands::Cleanup => cmd_cleanup(config).await,
        Commands::GenConfig { output } => cmd_gen_config(output),
        Commands::GenFeeds { output } => cmd_gen_feeds(output),
    }
}

async fn cmd_lookup(config: Config, ip: String, json: bool) -> Result<()> {
    let addr: IpAddr = iputil::parse_ip(&ip).context("invalid IP address")?;

    if !iputil::is_valid_for_lookup(addr) {
        bail!(
            "{} is not a valid lookup target (private, loopback, multicast, or unspecified)",
            addr
        );
    }

    let reader = MmdbReader::open(
        Some(Path::new(&config.mmdb.reputation_path)),
        config.mmdb.geoip(),
        config.mmdb.asn(),
    )
    .context("failed to open reputation database; run `iprisk compile` first")?;

    let result = reader.lookup_all(addr)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    }

    let level = match result.risk_level {
        RiskLevel::Critical => result.risk_level.to_string().red().bold(),
        RiskLevel::High => result.risk_level.to_string().red(),
        RiskLevel::Medium => result.risk_level.to_string().yellow(),
        RiskLevel::Low => result.risk_level.to_string().cyan(),
        RiskLevel::Clean => result.risk_level.to_string().green(),
    };

    println!("IP:         {}", result.ip);
    println!("Risk score: {} ({})", result.risk_score, level);

    if let Some(ref threat_type) = result.threat_type {
        println!("Threat:     {}", threat_type);
    }
    if !result.sources.is_empty() {
        println!("Sources:    {}", result.sources.join(", "));
    }
    if result.confidence > 0 {
        println!("Confidence: {}%", result.confidence);
    }

    let mut flags = Vec::new();
    if result.flags.is_tor {
        flags.push("tor");
    }
    if result.flags.is_vpn {
        flags.push("vpn");
    }
    if result.flags.is_proxy {
        flags.push("proxy");
    }
    if result.flags.is_datacenter {
        flags.push("datacenter");
    }
    if result.flags.is_botnet {
        flags.push("botnet");
    }
    if result.flags.is_malware {
        flags.push("malware");
    }
    if result.flags.is_spam {
        flags.push("spam");
    }
    if result.flags.is_attacker {
        flags.push("attacker");
    }
    if !flags.is_empty() {
        println!("Flags:      {}", flags.join(", ").red());
    }

    if let Some(ref geo) = result.geo {
        let mut location = Vec::new();
        if let Some(ref city) = geo.city {
            location.push(city.clone());
        }
        if let Some(ref country) = geo.country {
            location.push(country.clone());
        }
        if !location.is_empty() {
            println!("Location:   {}", location.join(", "));
        }
    }
    if let Some(ref asn) = result.asn {
        println!("ASN:        AS{} ({})", asn.asn, asn.org);
    }

    Ok(())
}

async fn cmd_ingest(config: Config, feeds_path: Option<PathBuf>, once: bool) -> Result<()> {
    let feeds = load_feeds(feeds_path)?;
    let store = Arc::new(PostgresStore::connect(&config.database.postgres).await?);
    let ingestor = Arc::new(Ingestor::new(config.ingestor.clone(), feeds, store)?);

    ingestor.sync_whitelist().await?;

    if once {
        let stats = ingestor.run_once().await;
        println!();
        println!("Feeds processed: {}", stats.feeds);
        println!("Entries fetched: {}", stats.fetched);
        println!("Entries stored:  {}", stats.stored);

        if stats.failed_feeds > 0 {
            bail!("{} feed(s) had errors", stats.failed_feeds);
        }
        println!("{}", "Ingestion completed successfully".green().bold());
        return Ok(());
    }

    println!("Starting ingestor (Ctrl+C to stop)...");
    let shutdown = iprisk::shutdown_channel();
    ingestor.run_scheduled(shutdown).await
}

async fn cmd_compile(config: Config, oneshot: bool) -> Result<()> {
    let store = Arc::new(PostgresStore::connect(&config.database.postgres).await?);
    let compiler = Compiler::new(&config, store);

    if oneshot {
        let report = compiler.compile_once().await?;
        println!(
            "{} {} prefixes from {} observations in {}ms ({} skipped)",
            "Compiled:".green().bold(),
            report.inserted,
            report.observations,
            report.duration_ms,
            report.skipped,
        );
        return Ok(());
    }

    println!("Starting compiler (Ctrl+C to stop)...");
    let shutdown = iprisk::shutdown_channel();
    compiler.run(shutdown).await
}

async fn cmd_stats(config: Config) -> Result<()> {
    let store = Arc::new(PostgresStore::connect(&config.database.postgres).await?);
    let stats = store.stats().await?;

    println!("{}", "=== Store ===".bold());
    println!("Observations:  {}", stats.total_observations);
    println!("Sources:       {}", stats.distinct_sources);
    println!("Threat types:  {}", stats.distinct_threat_types);
    println!("Whitelist:     {}", stats.whitelist_entries);
    if let Some(oldest) = stats.oldest_entry {
        println!("Oldest entry:  {}", oldest.format("%Y-%m-%d %H:%M UTC"));
    }
    if let Some(newest) = stats.newest_entry {
        println!("Newest entry:  {}", newest.format("%Y-%m-%d %H:%M UTC"));
    }

    let reputation_path = Path::new(&config.mmdb.reputation_path);
    if reputation_path.exists() {
        let reader = MmdbReader::open(Some(reputation_path), None, None)?;
        if let Some(db) = reader.stats().reputation {
            println!();
            println!("{}", "=== Reputation DB ===".bold());
            println!("Type:          {}", db.database_type);
            println!("Nodes:         {}", db.node_count);
            println!("Record size:   {} bits", db.record_size);
            println!(
                "Built:         {}",
                chrono::DateTime::from_timestamp(db.build_epoch as i64, 0)
                    .map(|t| t.format("%Y-%m-%d %H:%M UTC").to_string())
                    .unwrap_or_else(|| db.build_epoch.to_string())
            );
        }
    } else {
        println!();
        println!("Reputation DB not found at {}", config.mmdb.reputation_path);
    }

    Ok(())
}

async fn cmd_whitelist(config: Config, action: WhitelistAction) -> Result<()> {
    let store = PostgresStore::connect(&config.database.postgres).await?;

    match action {
        WhitelistAction::Add { prefix, comment } => {
            let prefix = iputil::parse_ip_or_prefix(&prefix)?;
            store.add_whitelist(prefix, comment, true, None).await?;
            println!("{} {} to whitelist", "Added".green().bold(), prefix);
        }
        WhitelistAction::Remove { prefix } => {
            let prefix = iputil::parse_ip_or_prefix(&prefix)?;
            if store.remove_whitelist(prefix).await? {
                println!("{} {} from whitelist", "Removed".green().bold(), prefix);
            } else {
                println!("{} {} was not in whitelist", "Note:".yellow().bold(), prefix);
            }
        }
        WhitelistAction::List => {
            let entries = store.list_whitelist().await?;

            if entries.is_empty() {
                println!("Whitelist is empty");
                return Ok(());
            }

            let rows: Vec<WhitelistRow> = entries
                .iter()
                .map(|entry| WhitelistRow {
                    range: entry.cidr.to_string(),
                    comment: entry.description.clone().unwrap_or_default(),
                    permanent: if entry.permanent { "yes" } else { "no" }.to_string(),
                    added: entry.created_at.format("%Y-%m-%d %H:%M").to_string(),
                })
                .collect();

            println!("{}", Table::new(rows));
        }
    }

    Ok(())
}

async fn cmd_cleanup(config: Config) -> Result<()> {
    let store = PostgresStore::connect(&config.database.postgres).await?;
    let removed = store.cleanup_expired().await?;
    println!("{} {} expired observations", "Removed".green().bold(), removed);
    Ok(())
}

fn cmd_gen_config(output: Option<PathBuf>) -> Result<()> {
    let config = Config::default();
    let toml_str = toml::to_string_pretty(&config)?;
    write_or_print(output, &toml_str, "Configuration")
}

fn cmd_gen_feeds(output: Option<PathBuf>) -> Result<()> {
    let feeds = FeedsConfig::default();
    let toml_str = toml::to_string_pretty(&feeds)?;
    write_or_print(output, &toml_str, "Feed catalogue")
}

fn write_or_print(output: Option<PathBuf>, content: &str, label: &str) -> Result<()> {
    match output {
        Some(path) => {
            std::fs::write(&path, content)?;
            println!("{} written to {}", label, path.display());
        }
        None => println!("{}", content),
    }
    Ok(())
}

fn load_feeds(path: Option<PathBuf>) -> Result<FeedsConfig> {
    match path {
        Some(path) => FeedsConfig::load(path),
        None => {
            let defaults = [
                PathBuf::from("/etc/iprisk/feeds.toml"),
                PathBuf::from("configs/feeds.toml"),
                PathBuf::from("feeds.toml"),
            ];
            for candidate in &defaults {
                if candidate.exists() {
                    return FeedsConfig::load(candidate);
                }
            }
            Ok(FeedsConfig::default())
        }
    }
}
