use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::scoring::ScoringConfig;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub redis: RedisConfig,

    #[serde(default)]
    pub mmdb: MmdbConfig,

    #[serde(default)]
    pub scoring: ScoringConfig,

    #[serde(default)]
    pub ingestor: IngestorConfig,

    #[serde(default)]
    pub judge: JudgeConfig,
}

impl Config {
    /// Load configuration from file, with environment overrides applied.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))?;

        config.apply_env_overrides();
        Ok(config)
    }

    /// Load config from default locations or fall back to defaults.
    pub fn load_or_default() -> Result<Self> {
        let paths = [
            PathBuf::from("/etc/iprisk/config.toml"),
            PathBuf::from("config.toml"),
        ];

        for path in &paths {
            if path.exists() {
                return Self::load(path);
            }
        }

        let mut config = Self::default();
        config.apply_env_overrides();
        Ok(config)
    }

    /// Save configuration to file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    /// Apply `IPRISK_*` environment overrides to configuration leaves.
    pub fn apply_env_overrides(&mut self) {
        override_string("IPRISK_LOG_LEVEL", &mut self.logging.level);
        override_string("IPRISK_LOG_FORMAT", &mut self.logging.format);

        override_string("IPRISK_POSTGRES_HOST", &mut self.database.postgres.host);
        override_parse("IPRISK_POSTGRES_PORT", &mut self.database.postgres.port);
        override_string("IPRISK_POSTGRES_USER", &mut self.database.postgres.username);
        override_string("IPRISK_POSTGRES_PASSWORD", &mut self.database.postgres.password);
        override_string("IPRISK_POSTGRES_DATABASE", &mut self.database.postgres.database);
        override_string("IPRISK_POSTGRES_SSLMODE", &mut self.database.postgres.ssl_mode);

        override_string("IPRISK_REDIS_HOST", &mut self.redis.host);
        override_parse("IPRISK_REDIS_PORT", &mut self.redis.port);

        override_path("IPRISK_MMDB_REPUTATION_PATH", &mut self.mmdb.reputation_path);
        override_path("IPRISK_MMDB_OUTPUT_PATH", &mut self.mmdb.output_path);

        override_string("IPRISK_INGESTOR_USER_AGENT", &mut self.ingestor.user_agent);
        override_parse("IPRISK_INGESTOR_CONCURRENCY", &mut self.ingestor.concurrency);
    }
}

fn override_string(var: &str, field: &mut String) {
    if let Ok(value) = std::env::var(var) {
        if !value.is_empty() {
            *field = value;
        }
    }
}

fn override_path(var: &str, field: &mut String) {
    override_string(var, field)
}

fn override_parse<T: std::str::FromStr>(var: &str, field: &mut T) {
    if let Ok(value) = std::env::var(var) {
        if let Ok(parsed) = value.parse() {
            *field = parsed;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_server_port")]
    pub port: u16,

    /// Read timeout in seconds
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,

    /// Write timeout in seconds
    #[serde(default = "default_write_timeout")]
    pub write_timeout_secs: u64,

    /// Idle timeout in seconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_server_port(),
            read_timeout_secs: default_read_timeout(),
            write_timeout_secs: default_write_timeout(),
            idle_timeout_secs: default_idle_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (text, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub postgres: PostgresConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresConfig {
    #[serde(default = "default_pg_host")]
    pub host: String,

    #[serde(default = "default_pg_port")]
    pub port: u16,

    #[serde(default = "default_pg_user")]
    pub username: String,

    #[serde(default)]
    pub password: String,

    #[serde(default = "default_pg_database")]
    pub database: String,

    #[serde(default = "default_ssl_mode")]
    pub ssl_mode: String,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Maximum connection lifetime in seconds
    #[serde(default = "default_conn_lifetime")]
    pub max_conn_lifetime_secs: u64,

    /// Maximum connection idle time in seconds
    #[serde(default = "default_conn_idle")]
    pub max_conn_idle_secs: u64,
}

impl PostgresConfig {
    /// Connection URL for the pool.
    pub fn url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}?sslmode={}",
            self.username, self.password, self.host, self.port, self.database, self.ssl_mode
        )
    }

    pub fn lifetime(&self) -> Duration {
        Duration::from_secs(self.max_conn_lifetime_secs)
    }

    pub fn idle(&self) -> Duration {
        Duration::from_secs(self.max_conn_idle_secs)
    }
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            host: default_pg_host(),
            port: default_pg_port(),
            username: default_pg_user(),
            password: String::new(),
            database: default_pg_database(),
            ssl_mode: default_ssl_mode(),
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            max_conn_lifetime_secs: default_conn_lifetime(),
            max_conn_idle_secs: default_conn_idle(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Result caching is an external collaborator; disabled by default.
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_host_local")]
    pub host: String,

    #[serde(default = "default_redis_port")]
    pub port: u16,

    #[serde(default)]
    pub password: String,

    #[serde(default)]
    pub db: u8,

    #[serde(default = "default_redis_pool")]
    pub pool_size: u32,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: default_host_local(),
            port: default_redis_port(),
            password: String::new(),
            db: 0,
            pool_size: default_redis_pool(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MmdbConfig {
    /// Path the reader opens for reputation lookups
    #[serde(default = "default_reputation_path")]
    pub reputation_path: String,

    /// GeoLite2 City database path (optional co-located DB)
    #[serde(default)]
    pub geoip_path: String,

    /// GeoLite2 ASN database path (optional co-located DB)
    #[serde(default)]
    pub asn_path: String,

    /// Path the compiler writes to
    #[serde(default = "default_reputation_path")]
    pub output_path: String,

    /// Reader reload interval in seconds
    #[serde(default = "default_reload_interval")]
    pub reload_interval_secs: u64,

    /// Compiler interval in seconds
    #[serde(default = "default_compile_interval")]
    pub compile_interval_secs: u64,

    /// MMDB record size in bits: 24, 28, or 32
    #[serde(default = "default_record_size")]
    pub record_size: u16,
}

impl MmdbConfig {
    pub fn reload_interval(&self) -> Duration {
        Duration::from_secs(self.reload_interval_secs)
    }

    pub fn compile_interval(&self) -> Duration {
        Duration::from_secs(self.compile_interval_secs)
    }

    pub fn geoip(&self) -> Option<&Path> {
        if self.geoip_path.is_empty() {
            None
        } else {
            Some(Path::new(&self.geoip_path))
        }
    }

    pub fn asn(&self) -> Option<&Path> {
        if self.asn_path.is_empty() {
            None
        } else {
            Some(Path::new(&self.asn_path))
        }
    }
}

impl Default for MmdbConfig {
    fn default() -> Self {
        Self {
            reputation_path: default_reputation_path(),
            geoip_path: String::new(),
            asn_path: String::new(),
            output_path: default_reputation_path(),
            reload_interval_secs: default_reload_interval(),
            compile_interval_secs: default_compile_interval(),
            record_size: default_record_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestorConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Maximum simultaneously active feed fetches
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Per-request HTTP timeout in seconds
    #[serde(default = "default_http_timeout")]
    pub http_timeout_secs: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Fixed delay between retries in seconds
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Interval of the expired-observation sweep in seconds
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
}

impl IngestorConfig {
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

impl Default for IngestorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            concurrency: default_concurrency(),
            http_timeout_secs: default_http_timeout(),
            max_retries: default_max_retries(),
            retry_delay_secs: default_retry_delay(),
            user_agent: default_user_agent(),
            cleanup_interval_secs: default_cleanup_interval(),
        }
    }
}

/// The judge scanner is an external collaborator; only its configuration
/// contract lives here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_judge_port")]
    pub port: u16,

    /// Per-probe timeout in seconds
    #[serde(default = "default_scan_timeout")]
    pub scan_timeout_secs: u64,

    #[serde(default = "default_scan_workers")]
    pub scan_workers: usize,

    #[serde(default = "default_scan_ports")]
    pub scan_ports: Vec<u16>,
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_judge_port(),
            scan_timeout_secs: default_scan_timeout(),
            scan_workers: default_scan_workers(),
            scan_ports: default_scan_ports(),
        }
    }
}

// Default value functions

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_host_local() -> String {
    "localhost".to_string()
}

fn default_server_port() -> u16 {
    8080
}

fn default_read_timeout() -> u64 {
    5
}

fn default_write_timeout() -> u64 {
    10
}

fn default_idle_timeout() -> u64 {
    120
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_pg_host() -> String {
    "localhost".to_string()
}

fn default_pg_port() -> u16 {
    5432
}

fn default_pg_user() -> String {
    "iprisk".to_string()
}

fn default_pg_database() -> String {
    "iprisk".to_string()
}

fn default_ssl_mode() -> String {
    "disable".to_string()
}

fn default_max_connections() -> u32 {
    100
}

fn default_min_connections() -> u32 {
    10
}

fn default_conn_lifetime() -> u64 {
    3600 // 1 hour
}

fn default_conn_idle() -> u64 {
    1800 // 30 minutes
}

fn default_redis_port() -> u16 {
    6379
}

fn default_redis_pool() -> u32 {
    10
}

fn default_reputation_path() -> String {
    "./data/mmdb/reputation.mmdb".to_string()
}

fn default_reload_interval() -> u64 {
    3600
}

fn default_compile_interval() -> u64 {
    3600
}

fn default_record_size() -> u16 {
    28
}

fn default_true() -> bool {
    true
}

fn default_concurrency() -> usize {
    10
}

fn default_http_timeout() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    5
}

fn default_user_agent() -> String {
    format!("iprisk-ingestor/{}", env!("CARGO_PKG_VERSION"))
}

fn default_cleanup_interval() -> u64 {
    3600
}

fn default_judge_port() -> u16 {
    8082
}

fn default_scan_timeout() -> u64 {
    5
}

fn default_scan_workers() -> usize {
    32
}

fn default_scan_ports() -> Vec<u16> {
    vec![80, 443, 1080, 3128, 8080, 8888]
}
