//! Reputation database compiler
//!
//! Aggregates the store's active observations into one merged record per
//! prefix and serializes the result to the binary reputation database.
//! The compiled file is a pure function of the non-expired observations
//! and the scoring configuration.

use anyhow::{Context, Result};
use chrono::Utc;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::iputil;
use crate::mmdb::writer::{CompileStats, MmdbWriter, ReputationEntry, WriterConfig};
use crate::models::{Observation, ThreatFlags};
use crate::scoring::Scorer;
use crate::store::PostgresStore;

/// Outcome of one compile cycle.
#[derive(Debug, Clone, Default)]
pub struct CompileReport {
    pub observations: usize,
    pub prefixes: usize,
    pub inserted: usize,
    pub skipped: usize,
    pub duration_ms: u64,
}

/// Compiles the current store snapshot into the reputation database.
pub struct Compiler {
    store: Arc<PostgresStore>,
    scorer: Scorer,
    writer: MmdbWriter,
    output_path: PathBuf,
    interval: Duration,
}

impl Compiler {
    pub fn new(config: &Config, store: Arc<PostgresStore>) -> Self {
        let writer = MmdbWriter::new(WriterConfig {
            record_size: config.mmdb.record_size,
            ..Default::default()
        });

        Self {
            store,
            scorer: Scorer::new(config.scoring.clone()),
            writer,
            output_path: PathBuf::from(&config.mmdb.output_path),
            interval: config.mmdb.compile_interval(),
        }
    }

    /// Run one compile cycle: snapshot, merge, score, write, record.
    pub async fn compile_once(&self) -> Result<CompileReport> {
        let started_at = Utc::now();
        let start = Instant::now();

        let observations = self
            .store
            .fetch_active()
            .await
            .context("failed to snapshot active observations")?;

        info!(observations = observations.len(), "starting MMDB compilation");

        if observations.is_empty() {
            warn!("no reputation data to compile");
        }

        let entries = merge_observations(&self.scorer, observations.as_slice());
        let prefixes = entries.len();

        let outcome = self.writer.compile(&entries, &self.output_path);
        let duration_ms = start.elapsed().as_millis() as u64;

        let (stats, error_text): (CompileStats, Option<String>) = match &outcome {
            Ok(stats) => (stats.clone(), None),
            Err(e) => (CompileStats::default(), Some(format!("{:#}", e))),
        };

        if let Err(e) = self
            .store
            .record_compile(
                started_at,
                duration_ms as i64,
                prefixes as i32,
                stats.inserted as i32,
                stats.skipped as i32,
                &self.output_path.to_string_lossy(),
                error_text.as_deref(),
            )
            .await
        {
            warn!(error = %e, "failed to record compile history");
        }

        let stats = outcome?;

        Ok(CompileReport {
            observations: observations.len(),
            prefixes,
            inserted: stats.inserted,
            skipped: stats.skipped,
            duration_ms,
        })
    }

    /// Compile on the configured interval until shutdown. Each cycle's
    /// failure is logged and the next cycle still runs; the live file is
    /// only ever replaced by a completed compile.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(interval_secs = self.interval.as_secs(), "compiler started");

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.compile_once().await {
                        Ok(report) => info!(
                            prefixes = report.prefixes,
                            inserted = report.inserted,
                            duration_ms = report.duration_ms,
                            "compile cycle complete"
                        ),
                        Err(e) => error!(error = %format!("{:#}", e), "compile cycle failed"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("compiler stopping");
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Merge observations into one record per prefix key.
///
/// The merged record at each exact prefix reflects only observations
/// with that exact prefix; coverage at finer granularity survives via
/// longest-prefix-match in the written tree.
pub fn merge_observations(scorer: &Scorer, observations: &[Observation]) -> Vec<ReputationEntry> {
    let now = Utc::now();

    // Grouped by canonical prefix key; BTreeMap keeps the output
    // deterministic. Group members stay in snapshot (first-seen) order.
    let mut groups: BTreeMap<String, Vec<&Observation>> = BTreeMap::new();
    for obs in observations {
        groups
            .entry(iputil::prefix_key(&obs.prefix))
            .or_default()
            .push(obs);
    }

    let mut entries = Vec::with_capacity(groups.len());

    for group in groups.values() {
        let threats: Vec<_> = group.iter().map(|o| o.as_threat()).collect();
        let risk_score = scorer.score(&threats, None, now);

        // Primary threat type: largest weight x confidence x decay
        // contribution, ties broken lexicographically.
        let mut primary: Option<(&str, f64)> = None;
        for threat in &threats {
            let contribution = scorer.contribution(threat, now);
            primary = match primary {
                None => Some((&threat.threat_type, contribution)),
                Some((best, best_contribution)) => {
                    if contribution > best_contribution
                        || (contribution == best_contribution
                            && threat.threat_type.as_str() < best)
                    {
                        Some((&threat.threat_type, contribution))
                    } else {
                        Some((best, best_contribution))
                    }
                }
            };
        }

        let mut flags = ThreatFlags::default();
        let mut sources: Vec<String> = Vec::new();
        let mut confidence = 0.0f64;
        let mut last_update = group[0].last_seen;

        for obs in group {
            flags.merge(ThreatFlags::from_threat_type(&obs.threat_type));
            if !sources.contains(&obs.source) {
                sources.push(obs.source.clone());
            }
            if obs.confidence > confidence {
                confidence = obs.confidence;
            }
            if obs.last_seen > last_update {
                last_update = obs.last_seen;
            }
        }

        entries.push(ReputationEntry {
            prefix: group[0].prefix,
            risk_score,
            risk_level: scorer.classify(risk_score),
            threat_type: primary.map(|(t, _)| t.to_string()).unwrap_or_default(),
            confidence,
            sources,
            flags,
            last_update,
        });
    }

    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RiskLevel;
    use chrono::{Duration as ChronoDuration, Utc};

    fn observation(
        prefix: &str,
        source: &str,
        threat_type: &str,
        confidence: f64,
        first_seen_offset_mins: i64,
    ) -> Observation {
        let now = Utc::now();
        Observation {
            prefix: iputil::parse_ip_or_prefix(prefix).unwrap(),
            source: source.to_string(),
            threat_type: threat_type.to_string(),
            confidence,
            weight: 50,
            first_seen: now - ChronoDuration::minutes(first_seen_offset_mins),
            last_seen: now,
            expires_at: None,
        }
    }

    #[test]
    fn test_merge_single_prefix_multiple_sources() {
        let scorer = Scorer::default();
        let observations = vec![
            observation("100.64.5.0/24", "feed_a", "tor", 0.7, 30),
            observation("100.64.5.0/24", "feed_b", "proxy", 0.9, 20),
            observation("100.64.5.0/24", "feed_a", "tor", 0.8, 10),
        ];

        let entries = merge_observations(&scorer, &observations);
        assert_eq!(entries.len(), 1);

        let entry = &entries[0];
        assert_eq!(entry.prefix.to_string(), "100.64.5.0/24");
        // Sources keep first-appearance order, deduplicated.
        assert_eq!(entry.sources, vec!["feed_a", "feed_b"]);
        assert!(entry.flags.is_tor);
        assert!(entry.flags.is_proxy);
        assert!((entry.confidence - 0.9).abs() < f64::EPSILON);
        assert_eq!(entry.risk_level, RiskLevel::from_score(entry.risk_score));
    }

    #[test]
    fn test_merge_primary_threat_by_contribution() {
        let scorer = Scorer::default();
        // tor weight 70 x 1.0 beats proxy 50 x 1.0.
        let observations = vec![
            observation("100.64.5.0/24", "feed_a", "proxy", 1.0, 0),
            observation("100.64.5.0/24", "feed_b", "tor", 1.0, 0),
        ];

        let entries = merge_observations(&scorer, &observations);
        assert_eq!(entries[0].threat_type, "tor");
    }

    #[test]
    fn test_merge_primary_threat_tie_lexicographic() {
        let scorer = Scorer::default();
        // Both unknown types share the default weight 50 and identical
        // confidence, so the tie breaks lexicographically.
        let observations = vec![
            observation("100.64.5.0/24", "feed_a", "zz_unknown", 1.0, 0),
            observation("100.64.5.0/24", "feed_b", "aa_unknown", 1.0, 0),
        ];

        let entries = merge_observations(&scorer, &observations);
        assert_eq!(entries[0].threat_type, "aa_unknown");
    }

    #[test]
    fn test_merge_keeps_distinct_prefixes() {
        let scorer = Scorer::default();
        let observations = vec![
            observation("100.64.0.0/16", "feed_a", "proxy", 0.8, 0),
            observation("100.64.5.0/24", "feed_b", "botnet_c2", 0.9, 0),
        ];

        let entries = merge_observations(&scorer, &observations);
        assert_eq!(entries.len(), 2);
        let keys: Vec<String> = entries.iter().map(|e| e.prefix.to_string()).collect();
        assert!(keys.contains(&"100.64.0.0/16".to_string()));
        assert!(keys.contains(&"100.64.5.0/24".to_string()));
    }

    #[test]
    fn test_merge_deterministic() {
        let scorer = Scorer::default();
        let observations = vec![
            observation("100.64.0.0/16", "feed_a", "proxy", 0.8, 5),
            observation("100.64.5.0/24", "feed_b", "botnet_c2", 0.9, 3),
            observation("100.64.5.0/24", "feed_c", "malware", 0.7, 1),
        ];

        let a = merge_observations(&scorer, &observations);
        let b = merge_observations(&scorer, &observations);
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.prefix, y.prefix);
            assert_eq!(x.risk_score, y.risk_score);
            assert_eq!(x.threat_type, y.threat_type);
            assert_eq!(x.sources, y.sources);
        }
    }
}
