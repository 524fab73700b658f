//! Threat feed ingestor
//!
//! Drives each enabled feed through fetch, parse, and store, on a
//! per-feed schedule or once on demand. Sources fail independently; a
//! bad feed never stops the others.

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use reqwest::Client;
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::IngestorConfig;
use crate::feeds::{FeedConfig, FeedSchedule, FeedsConfig, SourceConfig};
use crate::iputil;
use crate::models::Observation;
use crate::parser::{self, FeedFormat, FeedMeta};
use crate::store::PostgresStore;

/// Observations per store batch.
const BATCH_SIZE: usize = 5000;

/// Aggregate result of a run-once pass.
#[derive(Debug, Clone, Default)]
pub struct IngestStats {
    pub feeds: usize,
    pub fetched: usize,
    pub stored: u64,
    pub failed_feeds: usize,
}

/// Result of one feed pass.
#[derive(Debug, Clone, Default)]
struct FeedOutcome {
    fetched: usize,
    stored: u64,
    errors: usize,
}

/// Periodic feed fetcher and store writer.
pub struct Ingestor {
    config: IngestorConfig,
    feeds: FeedsConfig,
    client: Client,
    store: Arc<PostgresStore>,
    running: Mutex<bool>,
}

impl Ingestor {
    pub fn new(
        config: IngestorConfig,
        feeds: FeedsConfig,
        store: Arc<PostgresStore>,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.http_timeout())
            .user_agent(config.user_agent.clone())
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            config,
            feeds,
            client,
            store,
            running: Mutex::new(false),
        })
    }

    /// Run every enabled feed once and report aggregate counts. Used by
    /// `--once` mode; any feed error is reflected in `failed_feeds`.
    pub async fn run_once(self: Arc<Self>) -> IngestStats {
        let enabled: Vec<(String, FeedConfig)> = self
            .feeds
            .enabled_feeds()
            .into_iter()
            .map(|(name, feed)| (name.clone(), feed.clone()))
            .collect();

        let mut stats = IngestStats {
            feeds: enabled.len(),
            ..Default::default()
        };

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut set = JoinSet::new();

        for (name, feed) in enabled {
            let ingestor = self.clone();
            let semaphore = semaphore.clone();
            let shutdown = shutdown_rx.clone();
            set.spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
                ingestor.process_feed(&name, &feed, shutdown).await
            });
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(outcome) => {
                    stats.fetched += outcome.fetched;
                    stats.stored += outcome.stored;
                    if outcome.errors > 0 {
                        stats.failed_feeds += 1;
                    }
                }
                Err(e) => {
                    error!(error = %e, "feed task panicked");
                    stats.failed_feeds += 1;
                }
            }
        }

        info!(
            feeds = stats.feeds,
            fetched = stats.fetched,
            stored = stats.stored,
            failed = stats.failed_feeds,
            "run-once ingestion complete"
        );

        stats
    }

    /// Run all feeds on their schedules until shutdown. An initial pass
    /// fetches everything once, then each feed ticks independently; the
    /// semaphore caps simultaneously active fetches across feeds.
    pub async fn run_scheduled(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Result<()> {
        {
            let mut running = self.running.lock();
            if *running {
                bail!("ingestor already running");
            }
            *running = true;
        }

        let enabled: Vec<(String, FeedConfig)> = self
            .feeds
            .enabled_feeds()
            .into_iter()
            .map(|(name, feed)| (name.clone(), feed.clone()))
            .collect();

        // Parse schedules up front; a bad schedule is a config error.
        let mut schedules = Vec::with_capacity(enabled.len());
        for (name, feed) in &enabled {
            let schedule = FeedSchedule::parse(&feed.schedule)
                .with_context(|| format!("feed {}: invalid schedule", name))?;
            info!(feed = %name, schedule = %feed.schedule, "scheduling feed");
            schedules.push(schedule);
        }

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut set = JoinSet::new();

        // Initial fetch for all feeds.
        for (name, feed) in &enabled {
            let ingestor = self.clone();
            let semaphore = semaphore.clone();
            let shutdown = shutdown.clone();
            let name = name.clone();
            let feed = feed.clone();
            set.spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
                ingestor.process_feed(&name, &feed, shutdown).await;
            });
        }

        // One scheduler task per feed.
        for ((name, feed), schedule) in enabled.into_iter().zip(schedules) {
            let ingestor = self.clone();
            let semaphore = semaphore.clone();
            let shutdown = shutdown.clone();
            set.spawn(async move {
                ingestor
                    .feed_loop(name, feed, schedule, semaphore, shutdown)
                    .await;
            });
        }

        // Expired-observation sweep.
        {
            let ingestor = self.clone();
            let shutdown = shutdown.clone();
            set.spawn(async move {
                ingestor.sweep_loop(shutdown).await;
            });
        }

        while set.join_next().await.is_some() {}

        *self.running.lock() = false;
        info!("ingestor stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        *self.running.lock()
    }

    /// Sleep-until-next-fire loop for one feed. Ticks skipped during
    /// shutdown are not backfilled.
    async fn feed_loop(
        &self,
        name: String,
        feed: FeedConfig,
        schedule: FeedSchedule,
        semaphore: Arc<Semaphore>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let now = Utc::now();
            let next = match schedule.next_after(now) {
                Some(next) => next,
                None => {
                    warn!(feed = %name, "schedule yields no further fire times");
                    return;
                }
            };
            let wait = (next - now).to_std().unwrap_or_default();

            tokio::select! {
                _ = tokio::time::sleep(wait) => {
                    let _permit = semaphore.acquire().await.expect("semaphore closed");
                    if *shutdown.borrow() {
                        return;
                    }
                    self.process_feed(&name, &feed, shutdown.clone()).await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    async fn sweep_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.cleanup_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // skip the immediate tick

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.store.cleanup_expired().await {
                        Ok(removed) if removed > 0 => {
                            info!(removed, "expired observation sweep");
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "expired observation sweep failed"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    /// Fetch, parse, and store every source of one feed. Per-source
    /// errors are isolated and counted.
    async fn process_feed(
        &self,
        name: &str,
        feed: &FeedConfig,
        shutdown: watch::Receiver<bool>,
    ) -> FeedOutcome {
        info!(feed = %name, sources = feed.sources.len(), "processing feed");
        let started = std::time::Instant::now();
        let mut outcome = FeedOutcome::default();

        for source in &feed.sources {
            if *shutdown.borrow() {
                debug!(feed = %name, "shutdown requested, skipping remaining sources");
                break;
            }

            match self.fetch_and_store(name, feed, source, &shutdown).await {
                Ok((fetched, stored)) => {
                    outcome.fetched += fetched;
                    outcome.stored += stored;
                    info!(
                        feed = %name,
                        source = %source.name,
                        fetched,
                        stored,
                        "source complete"
                    );
                }
                Err(e) => {
                    outcome.errors += 1;
                    error!(
                        feed = %name,
                        source = %source.name,
                        error = %format!("{:#}", e),
                        "source failed"
                    );
                    let _ = self
                        .store
                        .record_fetch(name, &source.name, 0, 0, Some(&format!("{:#}", e)))
                        .await;
                }
            }
        }

        info!(
            feed = %name,
            fetched = outcome.fetched,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "feed complete"
        );
        outcome
    }

    /// One source: HTTP fetch with retries, parse, chunked upsert.
    async fn fetch_and_store(
        &self,
        feed_name: &str,
        feed: &FeedConfig,
        source: &SourceConfig,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<(usize, u64)> {
        let body = self.fetch_source(source).await?;

        let format: FeedFormat = source
            .format
            .parse()
            .map_err(|e: String| anyhow!("source {}: {}", source.name, e))?;

        let comment_prefix = self
            .feeds
            .get_format(&source.format)
            .and_then(|f| f.comment_prefix.as_deref());

        let now = Utc::now();
        let meta = FeedMeta {
            source: feed.name.clone(),
            threat_type: feed.threat_type.clone(),
            confidence: feed.confidence,
            weight: feed.weight,
            fetched_at: now,
        };

        let parsed = parser::parse_content(&body, format, comment_prefix, &meta);

        if parsed.entries.is_empty() {
            warn!(
                feed = %feed_name,
                source = %source.name,
                invalid = parsed.invalid,
                "feed source produced no valid entries"
            );
            let _ = self
                .store
                .record_fetch(feed_name, &source.name, 0, 0, None)
                .await;
            return Ok((0, 0));
        }

        let observations: Vec<Observation> = parsed
            .entries
            .iter()
            .map(|entry| Observation {
                prefix: entry.prefix,
                source: entry.source.clone(),
                threat_type: entry.threat_type.clone(),
                confidence: entry.confidence,
                weight: entry.weight,
                first_seen: entry.fetched_at,
                last_seen: entry.fetched_at,
                expires_at: None,
            })
            .collect();

        // Chunked upserts; a failing batch aborts itself, not the rest.
        let mut stored = 0u64;
        for batch in observations.chunks(BATCH_SIZE) {
            if *shutdown.borrow() {
                debug!(feed = %feed_name, "shutdown requested, stopping batches");
                break;
            }
            match self.store.upsert_batch(batch).await {
                Ok(written) => stored += written,
                Err(e) => {
                    error!(
                        feed = %feed_name,
                        source = %source.name,
                        error = %format!("{:#}", e),
                        "batch upsert failed"
                    );
                }
            }
        }

        let _ = self
            .store
            .record_fetch(
                feed_name,
                &source.name,
                observations.len() as i32,
                stored as i32,
                None,
            )
            .await;

        Ok((observations.len(), stored))
    }

    /// HTTP GET with fixed-delay retries. Non-success statuses retry like
    /// network errors; the body is decoded tolerantly.
    async fn fetch_source(&self, source: &SourceConfig) -> Result<String> {
        let mut last_error: Option<anyhow::Error> = None;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                tokio::time::sleep(self.config.retry_delay()).await;
            }

            match self.client.get(&source.url).send().await {
                Ok(response) if response.status().is_success() => {
                    let bytes = response
                        .bytes()
                        .await
                        .context("failed to read response body")?;
                    return Ok(String::from_utf8_lossy(&bytes).into_owned());
                }
                Ok(response) => {
                    last_error = Some(anyhow!("unexpected status code: {}", response.status()));
                }
                Err(e) => {
                    last_error = Some(anyhow::Error::from(e).context("request failed"));
                }
            }

            debug!(
                url = %source.url,
                attempt = attempt + 1,
                "fetch attempt failed, retrying"
            );
        }

        Err(last_error.unwrap_or_else(|| anyhow!("fetch failed"))).with_context(|| {
            format!(
                "failed to fetch {} after {} retries",
                source.url, self.config.max_retries
            )
        })
    }

    /// Sync the catalogue's static whitelist ranges into the store.
    pub async fn sync_whitelist(&self) -> Result<u64> {
        if !self.feeds.whitelist.enabled {
            return Ok(0);
        }

        let mut synced = 0u64;
        for source in &self.feeds.whitelist.sources {
            for range in &source.ranges {
                let prefix = match iputil::parse_ip_or_prefix(range) {
                    Ok(prefix) => prefix,
                    Err(e) => {
                        warn!(source = %source.name, range = %range, error = %e,
                              "invalid whitelist range");
                        continue;
                    }
                };
                self.store
                    .add_whitelist(prefix, Some(source.name.clone()), true, None)
                    .await?;
                synced += 1;
            }
        }

        if synced > 0 {
            info!(synced, "whitelist ranges synced");
        }
        Ok(synced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_size() {
        assert_eq!(BATCH_SIZE, 5000);
    }

    #[test]
    fn test_feed_outcome_default() {
        let outcome = FeedOutcome::default();
        assert_eq!(outcome.fetched, 0);
        assert_eq!(outcome.errors, 0);
    }
}
