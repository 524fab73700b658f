//! Declarative threat-feed catalogue
//!
//! Feeds are described in an external TOML document: each feed carries a
//! threat type, default confidence/weight, a schedule, and one or more
//! HTTP sources sharing a line format.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, Utc};
use cron::Schedule;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;

/// Catalogue of feeds, line formats, and static whitelist ranges.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedsConfig {
    #[serde(default)]
    pub feeds: HashMap<String, FeedConfig>,

    #[serde(default)]
    pub formats: HashMap<String, FormatConfig>,

    #[serde(default)]
    pub whitelist: WhitelistConfig,
}

/// Configuration for a single feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Stable source identifier stamped on every observation.
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// Threat type assigned to all observations from this feed.
    pub threat_type: String,

    #[serde(default = "default_confidence")]
    pub confidence: f64,

    #[serde(default = "default_weight")]
    pub weight: i32,

    /// Standard 5-field cron expression, or `@hourly`/`@daily`/`@weekly`.
    #[serde(default = "default_schedule")]
    pub schedule: String,

    pub sources: Vec<SourceConfig>,
}

/// One HTTP source within a feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub url: String,

    /// Line format tag: `plain`, `ip_port`, `cidr_comments`, `netset`.
    pub format: String,

    pub name: String,
}

/// How to parse a feed format.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FormatConfig {
    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub comment_prefix: Option<String>,

    #[serde(default)]
    pub separator: Option<String>,
}

/// Static whitelist ranges shipped with the catalogue.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WhitelistConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub sources: Vec<WhitelistSource>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhitelistSource {
    pub name: String,

    #[serde(default)]
    pub ranges: Vec<String>,
}

fn default_true() -> bool {
    true
}

fn default_confidence() -> f64 {
    0.8
}

fn default_weight() -> i32 {
    50
}

fn default_schedule() -> String {
    "@daily".to_string()
}

impl FeedsConfig {
    /// Load the feed catalogue from file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read feeds file: {}", path.as_ref().display()))?;

        let config: FeedsConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse feeds file: {}", path.as_ref().display()))?;

        Ok(config)
    }

    /// Save the catalogue to file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    /// Enabled feeds only, keyed by catalogue name.
    pub fn enabled_feeds(&self) -> Vec<(&String, &FeedConfig)> {
        let mut feeds: Vec<_> = self.feeds.iter().filter(|(_, f)| f.enabled).collect();
        feeds.sort_by(|a, b| a.0.cmp(b.0));
        feeds
    }

    pub fn get_feed(&self, name: &str) -> Option<&FeedConfig> {
        self.feeds.get(name)
    }

    pub fn get_format(&self, name: &str) -> Option<&FormatConfig> {
        self.formats.get(name)
    }
}

impl Default for FeedsConfig {
    /// Catalogue of well-known public feeds, matching what `gen-feeds`
    /// writes.
    fn default() -> Self {
        let mut feeds = HashMap::new();

        feeds.insert(
            "tor_exit_nodes".to_string(),
            FeedConfig {
                enabled: true,
                name: "tor_exit_nodes".to_string(),
                description: "Tor project exit node list".to_string(),
                threat_type: "tor".to_string(),
                confidence: 1.0,
                weight: 70,
                schedule: "@hourly".to_string(),
                sources: vec![SourceConfig {
                    url: "https://check.torproject.org/torbulkexitlist".to_string(),
                    format: "plain".to_string(),
                    name: "torproject".to_string(),
                }],
            },
        );

        feeds.insert(
            "spamhaus_drop".to_string(),
            FeedConfig {
                enabled: true,
                name: "spamhaus_drop".to_string(),
                description: "Spamhaus DROP hijacked/leased netblocks".to_string(),
                threat_type: "hijacked".to_string(),
                confidence: 0.95,
                weight: 95,
                schedule: "0 */12 * * *".to_string(),
                sources: vec![SourceConfig {
                    url: "https://www.spamhaus.org/drop/drop.txt".to_string(),
                    format: "cidr_comments".to_string(),
                    name: "spamhaus".to_string(),
                }],
            },
        );

        feeds.insert(
            "feodo_c2".to_string(),
            FeedConfig {
                enabled: true,
                name: "feodo_c2".to_string(),
                description: "Abuse.ch Feodo tracker botnet C2 IPs".to_string(),
                threat_type: "botnet_c2".to_string(),
                confidence: 0.9,
                weight: 95,
                schedule: "@hourly".to_string(),
                sources: vec![SourceConfig {
                    url: "https://feodotracker.abuse.ch/downloads/ipblocklist.txt".to_string(),
                    format: "plain".to_string(),
                    name: "abuse_ch".to_string(),
                }],
            },
        );

        feeds.insert(
            "blocklist_de".to_string(),
            FeedConfig {
                enabled: true,
                name: "blocklist_de".to_string(),
                description: "blocklist.de reported attackers".to_string(),
                threat_type: "attack".to_string(),
                confidence: 0.7,
                weight: 75,
                schedule: "@daily".to_string(),
                sources: vec![SourceConfig {
                    url: "https://lists.blocklist.de/lists/all.txt".to_string(),
                    format: "plain".to_string(),
                    name: "blocklist_de".to_string(),
                }],
            },
        );

        feeds.insert(
            "firehol_level1".to_string(),
            FeedConfig {
                enabled: false,
                name: "firehol_level1".to_string(),
                description: "FireHOL level 1 aggregate netset".to_string(),
                threat_type: "malicious".to_string(),
                confidence: 0.8,
                weight: 85,
                schedule: "@daily".to_string(),
                sources: vec![SourceConfig {
                    url: "https://raw.githubusercontent.com/firehol/blocklist-ipsets/master/firehol_level1.netset".to_string(),
                    format: "netset".to_string(),
                    name: "firehol".to_string(),
                }],
            },
        );

        let mut formats = HashMap::new();
        formats.insert(
            "plain".to_string(),
            FormatConfig {
                description: "one IP or CIDR per line".to_string(),
                comment_prefix: Some("#".to_string()),
                separator: None,
            },
        );
        formats.insert(
            "ip_port".to_string(),
            FormatConfig {
                description: "IP:PORT per line".to_string(),
                comment_prefix: Some("#".to_string()),
                separator: Some(":".to_string()),
            },
        );
        formats.insert(
            "cidr_comments".to_string(),
            FormatConfig {
                description: "CIDR ; commentary".to_string(),
                comment_prefix: Some(";".to_string()),
                separator: Some(";".to_string()),
            },
        );
        formats.insert(
            "netset".to_string(),
            FormatConfig {
                description: "FireHOL netset".to_string(),
                comment_prefix: Some("#".to_string()),
                separator: None,
            },
        );

        Self {
            feeds,
            formats,
            whitelist: WhitelistConfig {
                enabled: true,
                sources: vec![WhitelistSource {
                    name: "well_known_resolvers".to_string(),
                    ranges: vec![
                        "8.8.8.8/32".to_string(),
                        "8.8.4.4/32".to_string(),
                        "1.1.1.1/32".to_string(),
                        "9.9.9.9/32".to_string(),
                    ],
                }],
            },
        }
    }
}

/// A feed's firing schedule: either a fixed interval (the `@` shortcuts)
/// or a 5-field cron expression.
#[derive(Debug, Clone)]
pub enum FeedSchedule {
    Interval(Duration),
    Cron(Box<Schedule>),
}

impl FeedSchedule {
    /// Parse a schedule string. `@hourly`, `@daily`, and `@weekly` map to
    /// fixed intervals; anything else must be a standard 5-field cron
    /// expression (minute hour day-of-month month day-of-week).
    pub fn parse(s: &str) -> Result<Self> {
        match s.trim() {
            "@hourly" => Ok(FeedSchedule::Interval(Duration::hours(1))),
            "@daily" => Ok(FeedSchedule::Interval(Duration::days(1))),
            "@weekly" => Ok(FeedSchedule::Interval(Duration::weeks(1))),
            expr => {
                let fields = expr.split_whitespace().count();
                if fields != 5 {
                    return Err(anyhow!(
                        "schedule must be 5-field cron or @hourly/@daily/@weekly: {}",
                        expr
                    ));
                }
                // The cron crate wants a seconds field.
                let with_seconds = format!("0 {}", expr);
                let schedule = Schedule::from_str(&with_seconds)
                    .map_err(|e| anyhow!("invalid cron expression {}: {}", expr, e))?;
                Ok(FeedSchedule::Cron(Box::new(schedule)))
            }
        }
    }

    /// Next fire time strictly after `now`.
    pub fn next_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            FeedSchedule::Interval(interval) => Some(now + *interval),
            FeedSchedule::Cron(schedule) => schedule.after(&now).next(),
        }
    }
}
