//! PostgreSQL observation store
//!
//! Authoritative persistent table of observations with upsert-friendly
//! writes and range-containment reads. Conflict resolution is
//! commutative: confidence and weight merge to the maximum seen, the
//! newest `last_seen` wins.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use ipnetwork::IpNetwork;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Executor, FromRow, Postgres, QueryBuilder};
use std::net::IpAddr;
use tracing::{debug, info};

use crate::config::PostgresConfig;
use crate::iputil;
use crate::models::{AsnInfo, Observation};

/// Batches at or above this size go through the staging-table bulk path.
const BULK_THRESHOLD: usize = 500;

/// Idempotent schema, applied at connect time.
const SCHEMA_SQL: &str = r#"
-- Observations: one row per (prefix, source) claim
CREATE TABLE IF NOT EXISTS ip_reputation (
    id BIGSERIAL PRIMARY KEY,
    ip_start INET NOT NULL,
    ip_end INET NOT NULL,
    cidr INET NOT NULL,
    source VARCHAR(100) NOT NULL,
    threat_type VARCHAR(50) NOT NULL,
    confidence DOUBLE PRECISION NOT NULL DEFAULT 0.5,
    weight INTEGER NOT NULL DEFAULT 50,
    first_seen TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    last_seen TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    expires_at TIMESTAMPTZ,
    UNIQUE (ip_start, ip_end, source)
);
CREATE INDEX IF NOT EXISTS idx_reputation_source ON ip_reputation(source);
CREATE INDEX IF NOT EXISTS idx_reputation_threat_type ON ip_reputation(threat_type);
CREATE INDEX IF NOT EXISTS idx_reputation_last_seen ON ip_reputation(last_seen DESC);
CREATE INDEX IF NOT EXISTS idx_reputation_expires ON ip_reputation(expires_at)
    WHERE expires_at IS NOT NULL;

-- Whitelist: ranges that override reputation
CREATE TABLE IF NOT EXISTS whitelist (
    id BIGSERIAL PRIMARY KEY,
    ip_start INET NOT NULL,
    ip_end INET NOT NULL,
    cidr INET NOT NULL,
    description TEXT,
    permanent BOOLEAN NOT NULL DEFAULT FALSE,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    expires_at TIMESTAMPTZ,
    UNIQUE (ip_start, ip_end)
);

-- ASN reference table
CREATE TABLE IF NOT EXISTS asn_info (
    asn BIGINT PRIMARY KEY,
    name VARCHAR(255),
    org VARCHAR(255) NOT NULL DEFAULT '',
    country_code VARCHAR(2),
    asn_type VARCHAR(20),
    risk_modifier INTEGER NOT NULL DEFAULT 0,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

-- History tables
CREATE TABLE IF NOT EXISTS feed_fetch_history (
    id BIGSERIAL PRIMARY KEY,
    feed VARCHAR(100) NOT NULL,
    source VARCHAR(100) NOT NULL,
    fetched_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    entries INTEGER NOT NULL DEFAULT 0,
    stored INTEGER NOT NULL DEFAULT 0,
    error TEXT
);
CREATE INDEX IF NOT EXISTS idx_fetch_history_feed
    ON feed_fetch_history(feed, fetched_at DESC);

CREATE TABLE IF NOT EXISTS compile_history (
    id BIGSERIAL PRIMARY KEY,
    started_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    duration_ms BIGINT NOT NULL DEFAULT 0,
    prefixes INTEGER NOT NULL DEFAULT 0,
    inserted INTEGER NOT NULL DEFAULT 0,
    skipped INTEGER NOT NULL DEFAULT 0,
    output_path TEXT NOT NULL DEFAULT '',
    error TEXT
);
"#;

const UPSERT_CONFLICT_SQL: &str = r#" ON CONFLICT (ip_start, ip_end, source) DO UPDATE SET
    confidence = GREATEST(ip_reputation.confidence, EXCLUDED.confidence),
    weight = GREATEST(ip_reputation.weight, EXCLUDED.weight),
    last_seen = EXCLUDED.last_seen,
    expires_at = COALESCE(EXCLUDED.expires_at, ip_reputation.expires_at)"#;

/// A whitelist range.
#[derive(Debug, Clone, FromRow)]
pub struct WhitelistEntry {
    pub cidr: IpNetwork,
    pub description: Option<String>,
    pub permanent: bool,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Store-wide statistics for the CLI.
#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    pub total_observations: i64,
    pub distinct_sources: i64,
    pub distinct_threat_types: i64,
    pub whitelist_entries: i64,
    pub oldest_entry: Option<DateTime<Utc>>,
    pub newest_entry: Option<DateTime<Utc>>,
}

#[derive(FromRow)]
struct ObservationRow {
    cidr: IpNetwork,
    source: String,
    threat_type: String,
    confidence: f64,
    weight: i32,
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
}

impl From<ObservationRow> for Observation {
    fn from(row: ObservationRow) -> Self {
        Observation {
            prefix: row.cidr,
            source: row.source,
            threat_type: row.threat_type,
            confidence: row.confidence,
            weight: row.weight,
            first_seen: row.first_seen,
            last_seen: row.last_seen,
            expires_at: row.expires_at,
        }
    }
}

/// PostgreSQL-backed observation store.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect, verify the connection, and apply the schema.
    pub async fn connect(config: &PostgresConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .max_lifetime(config.lifetime())
            .idle_timeout(config.idle())
            .connect(&config.url())
            .await
            .with_context(|| {
                format!(
                    "Failed to connect to PostgreSQL at {}:{}",
                    config.host, config.port
                )
            })?;

        let store = Self { pool };
        store.init_schema().await?;

        info!(
            host = %config.host,
            database = %config.database,
            "Connected to PostgreSQL"
        );
        Ok(store)
    }

    /// Wrap an existing pool (for tests).
    pub async fn with_pool(pool: PgPool) -> Result<Self> {
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        self.pool
            .execute(SCHEMA_SQL)
            .await
            .context("Failed to apply store schema")?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Verify the store answers queries.
    pub async fn health(&self) -> Result<()> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("store health check failed")?;
        Ok(())
    }

    // ==================== Observations ====================

    /// Upsert a batch of observations. Returns rows written (inserted or
    /// updated). Batches at or above the bulk threshold are loaded via a
    /// staging table and merged with a single upsert.
    pub async fn upsert_batch(&self, observations: &[Observation]) -> Result<u64> {
        if observations.is_empty() {
            return Ok(0);
        }

        if observations.len() >= BULK_THRESHOLD {
            self.upsert_bulk(observations).await
        } else {
            self.upsert_small(observations).await
        }
    }

    async fn upsert_small(&self, observations: &[Observation]) -> Result<u64> {
        // A feed can list the same prefix twice; a multi-row upsert must
        // not touch one conflict target twice, so keep the last claim.
        let mut deduped: Vec<&Observation> = Vec::with_capacity(observations.len());
        let mut index: std::collections::HashMap<(String, String), usize> =
            std::collections::HashMap::new();
        for obs in observations {
            let key = (iputil::prefix_key(&obs.prefix), obs.source.clone());
            match index.get(&key) {
                Some(&at) => deduped[at] = obs,
                None => {
                    index.insert(key, deduped.len());
                    deduped.push(obs);
                }
            }
        }

        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO ip_reputation \
             (ip_start, ip_end, cidr, source, threat_type, confidence, weight, \
              first_seen, last_seen, expires_at) ",
        );

        qb.push_values(deduped, |mut b, obs| {
            let (start, end) = iputil::range_from_prefix(&obs.prefix);
            b.push_bind(iputil::host_prefix(start))
                .push_bind(iputil::host_prefix(end))
                .push_bind(obs.prefix)
                .push_bind(&obs.source)
                .push_bind(&obs.threat_type)
                .push_bind(obs.confidence)
                .push_bind(obs.weight)
                .push_bind(obs.first_seen)
                .push_bind(obs.last_seen)
                .push_bind(obs.expires_at);
        });
        qb.push(UPSERT_CONFLICT_SQL);

        let result = qb
            .build()
            .execute(&self.pool)
            .await
            .context("batch upsert failed")?;

        Ok(result.rows_affected())
    }

    /// Copy-style path: one round trip loads the batch into a TEMP table
    /// via UNNEST, a second merges it into `ip_reputation`.
    async fn upsert_bulk(&self, observations: &[Observation]) -> Result<u64> {
        let mut starts = Vec::with_capacity(observations.len());
        let mut ends = Vec::with_capacity(observations.len());
        let mut cidrs = Vec::with_capacity(observations.len());
        let mut sources = Vec::with_capacity(observations.len());
        let mut threat_types = Vec::with_capacity(observations.len());
        let mut confidences = Vec::with_capacity(observations.len());
        let mut weights = Vec::with_capacity(observations.len());
        let mut first_seens = Vec::with_capacity(observations.len());
        let mut last_seens = Vec::with_capacity(observations.len());
        let mut expires: Vec<Option<DateTime<Utc>>> = Vec::with_capacity(observations.len());

        for obs in observations {
            let (start, end) = iputil::range_from_prefix(&obs.prefix);
            starts.push(iputil::host_prefix(start));
            ends.push(iputil::host_prefix(end));
            cidrs.push(obs.prefix);
            sources.push(obs.source.clone());
            threat_types.push(obs.threat_type.clone());
            confidences.push(obs.confidence);
            weights.push(obs.weight);
            first_seens.push(obs.first_seen);
            last_seens.push(obs.last_seen);
            expires.push(obs.expires_at);
        }

        let mut tx = self.pool.begin().await.context("begin bulk upsert")?;

        sqlx::query(
            "CREATE TEMP TABLE staging_reputation (
                ip_start INET NOT NULL,
                ip_end INET NOT NULL,
                cidr INET NOT NULL,
                source VARCHAR(100) NOT NULL,
                threat_type VARCHAR(50) NOT NULL,
                confidence DOUBLE PRECISION NOT NULL,
                weight INTEGER NOT NULL,
                first_seen TIMESTAMPTZ NOT NULL,
                last_seen TIMESTAMPTZ NOT NULL,
                expires_at TIMESTAMPTZ
            ) ON COMMIT DROP",
        )
        .execute(&mut *tx)
        .await
        .context("create staging table")?;

        sqlx::query(
            "INSERT INTO staging_reputation
             SELECT * FROM UNNEST(
                $1::inet[], $2::inet[], $3::inet[], $4::text[], $5::text[],
                $6::float8[], $7::int4[], $8::timestamptz[], $9::timestamptz[],
                $10::timestamptz[])",
        )
        .bind(&starts)
        .bind(&ends)
        .bind(&cidrs)
        .bind(&sources)
        .bind(&threat_types)
        .bind(&confidences)
        .bind(&weights)
        .bind(&first_seens)
        .bind(&last_seens)
        .bind(&expires)
        .execute(&mut *tx)
        .await
        .context("load staging table")?;

        // Duplicate (start, end, source) rows within one batch would make
        // the single upsert nondeterministic; collapse them first.
        let result = sqlx::query(&format!(
            "INSERT INTO ip_reputation
             (ip_start, ip_end, cidr, source, threat_type, confidence, weight,
              first_seen, last_seen, expires_at)
             SELECT DISTINCT ON (ip_start, ip_end, source)
                 ip_start, ip_end, cidr, source, threat_type, confidence, weight,
                 first_seen, last_seen, expires_at
             FROM staging_reputation
             ORDER BY ip_start, ip_end, source, last_seen DESC{}",
            UPSERT_CONFLICT_SQL
        ))
        .execute(&mut *tx)
        .await
        .context("merge staging table")?;

        tx.commit().await.context("commit bulk upsert")?;

        debug!(rows = result.rows_affected(), "bulk upsert merged");
        Ok(result.rows_affected())
    }

    /// All non-expired observations containing an address, ordered by
    /// `(weight DESC, confidence DESC)`.
    pub async fn lookup_ip(&self, addr: IpAddr) -> Result<Vec<Observation>> {
        let host = iputil::host_prefix(addr);

        let rows: Vec<ObservationRow> = sqlx::query_as(
            "SELECT cidr, source, threat_type, confidence, weight,
                    first_seen, last_seen, expires_at
             FROM ip_reputation
             WHERE $1 >= ip_start AND $1 <= ip_end
               AND (expires_at IS NULL OR expires_at > NOW())
             ORDER BY weight DESC, confidence DESC",
        )
        .bind(host)
        .fetch_all(&self.pool)
        .await
        .context("IP lookup failed")?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// All non-expired observations, in deterministic first-seen order;
    /// the compiler's snapshot.
    pub async fn fetch_active(&self) -> Result<Vec<Observation>> {
        let rows: Vec<ObservationRow> = sqlx::query_as(
            "SELECT cidr, source, threat_type, confidence, weight,
                    first_seen, last_seen, expires_at
             FROM ip_reputation
             WHERE expires_at IS NULL OR expires_at > NOW()
             ORDER BY first_seen ASC, id ASC",
        )
        .fetch_all(&self.pool)
        .await
        .context("fetch active observations failed")?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Delete observations whose `expires_at` has passed.
    pub async fn cleanup_expired(&self) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM ip_reputation
             WHERE expires_at IS NOT NULL AND expires_at < NOW()",
        )
        .execute(&self.pool)
        .await
        .context("cleanup failed")?;

        let removed = result.rows_affected();
        if removed > 0 {
            info!(removed, "removed expired observations");
        }
        Ok(removed)
    }

    // ==================== Whitelist ====================

    /// Whether an address falls inside any active whitelist range.
    pub async fn is_whitelisted(&self, addr: IpAddr) -> Result<bool> {
        let host = iputil::host_prefix(addr);

        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (
                SELECT 1 FROM whitelist
                WHERE $1 >= ip_start AND $1 <= ip_end
                  AND (permanent = TRUE OR expires_at IS NULL OR expires_at > NOW())
             )",
        )
        .bind(host)
        .fetch_one(&self.pool)
        .await
        .context("whitelist check failed")?;

        Ok(exists)
    }

    pub async fn add_whitelist(
        &self,
        prefix: IpNetwork,
        description: Option<String>,
        permanent: bool,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let (start, end) = iputil::range_from_prefix(&prefix);

        sqlx::query(
            "INSERT INTO whitelist (ip_start, ip_end, cidr, description, permanent, expires_at)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (ip_start, ip_end) DO UPDATE SET
                 description = EXCLUDED.description,
                 permanent = EXCLUDED.permanent,
                 expires_at = EXCLUDED.expires_at",
        )
        .bind(iputil::host_prefix(start))
        .bind(iputil::host_prefix(end))
        .bind(prefix)
        .bind(description)
        .bind(permanent)
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .context("whitelist insert failed")?;

        Ok(())
    }

    pub async fn remove_whitelist(&self, prefix: IpNetwork) -> Result<bool> {
        let (start, end) = iputil::range_from_prefix(&prefix);

        let result = sqlx::query("DELETE FROM whitelist WHERE ip_start = $1 AND ip_end = $2")
            .bind(iputil::host_prefix(start))
            .bind(iputil::host_prefix(end))
            .execute(&self.pool)
            .await
            .context("whitelist delete failed")?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn list_whitelist(&self) -> Result<Vec<WhitelistEntry>> {
        let entries: Vec<WhitelistEntry> = sqlx::query_as(
            "SELECT cidr, description, permanent, created_at, expires_at
             FROM whitelist
             ORDER BY cidr",
        )
        .fetch_all(&self.pool)
        .await
        .context("whitelist listing failed")?;

        Ok(entries)
    }

    // ==================== ASN reference ====================

    pub async fn get_asn(&self, asn: i64) -> Result<Option<AsnInfo>> {
        let row: Option<(i64, Option<String>, String, Option<String>, Option<String>, i32)> =
            sqlx::query_as(
                "SELECT asn, name, org, country_code, asn_type, risk_modifier
                 FROM asn_info WHERE asn = $1",
            )
            .bind(asn)
            .fetch_optional(&self.pool)
            .await
            .context("ASN lookup failed")?;

        Ok(row.map(|(asn, name, org, country_code, asn_type, risk_modifier)| AsnInfo {
            asn,
            name,
            org,
            country_code,
            asn_type,
            risk_modifier,
        }))
    }

    pub async fn upsert_asn(&self, info: &AsnInfo) -> Result<()> {
        sqlx::query(
            "INSERT INTO asn_info (asn, name, org, country_code, asn_type, risk_modifier, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, NOW())
             ON CONFLICT (asn) DO UPDATE SET
                 name = EXCLUDED.name,
                 org = EXCLUDED.org,
                 country_code = EXCLUDED.country_code,
                 asn_type = EXCLUDED.asn_type,
                 risk_modifier = EXCLUDED.risk_modifier,
                 updated_at = NOW()",
        )
        .bind(info.asn)
        .bind(&info.name)
        .bind(&info.org)
        .bind(&info.country_code)
        .bind(&info.asn_type)
        .bind(info.risk_modifier)
        .execute(&self.pool)
        .await
        .context("ASN upsert failed")?;

        Ok(())
    }

    // ==================== History ====================

    pub async fn record_fetch(
        &self,
        feed: &str,
        source: &str,
        entries: i32,
        stored: i32,
        error: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO feed_fetch_history (feed, source, entries, stored, error)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(feed)
        .bind(source)
        .bind(entries)
        .bind(stored)
        .bind(error)
        .execute(&self.pool)
        .await
        .context("fetch history insert failed")?;

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn record_compile(
        &self,
        started_at: DateTime<Utc>,
        duration_ms: i64,
        prefixes: i32,
        inserted: i32,
        skipped: i32,
        output_path: &str,
        error: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO compile_history
             (started_at, duration_ms, prefixes, inserted, skipped, output_path, error)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(started_at)
        .bind(duration_ms)
        .bind(prefixes)
        .bind(inserted)
        .bind(skipped)
        .bind(output_path)
        .bind(error)
        .execute(&self.pool)
        .await
        .context("compile history insert failed")?;

        Ok(())
    }

    // ==================== Stats ====================

    pub async fn stats(&self) -> Result<StoreStats> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM ip_reputation")
            .fetch_one(&self.pool)
            .await?;
        let sources: i64 = sqlx::query_scalar("SELECT COUNT(DISTINCT source) FROM ip_reputation")
            .fetch_one(&self.pool)
            .await?;
        let threat_types: i64 =
            sqlx::query_scalar("SELECT COUNT(DISTINCT threat_type) FROM ip_reputation")
                .fetch_one(&self.pool)
                .await?;
        let whitelist: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM whitelist")
            .fetch_one(&self.pool)
            .await?;
        let (oldest, newest): (Option<DateTime<Utc>>, Option<DateTime<Utc>>) =
            sqlx::query_as("SELECT MIN(first_seen), MAX(last_seen) FROM ip_reputation")
                .fetch_one(&self.pool)
                .await?;

        Ok(StoreStats {
            total_observations: total,
            distinct_sources: sources,
            distinct_threat_types: threat_types,
            whitelist_entries: whitelist,
            oldest_entry: oldest,
            newest_entry: newest,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn observation(prefix: &str, source: &str) -> Observation {
        let now = Utc::now();
        Observation {
            prefix: crate::iputil::parse_ip_or_prefix(prefix).unwrap(),
            source: source.to_string(),
            threat_type: "proxy".to_string(),
            confidence: 0.8,
            weight: 50,
            first_seen: now,
            last_seen: now,
            expires_at: None,
        }
    }

    async fn test_store() -> Option<PostgresStore> {
        let url = std::env::var("IPRISK_TEST_DATABASE_URL").ok()?;
        let pool = PgPool::connect(&url).await.ok()?;
        PostgresStore::with_pool(pool).await.ok()
    }

    // Live-database tests; run with
    // `IPRISK_TEST_DATABASE_URL=postgres://... cargo test -- --ignored`.

    #[tokio::test]
    #[ignore]
    async fn test_upsert_idempotent() {
        let store = test_store().await.expect("IPRISK_TEST_DATABASE_URL not set");
        let obs = observation("198.51.100.0/24", "upsert_idem_test");

        store.upsert_batch(&[obs.clone()]).await.unwrap();
        let first = store.lookup_ip("198.51.100.7".parse().unwrap()).await.unwrap();

        let mut later = obs.clone();
        later.last_seen = Utc::now();
        later.confidence = 0.5; // lower confidence must not win
        store.upsert_batch(&[later]).await.unwrap();
        let second = store.lookup_ip("198.51.100.7".parse().unwrap()).await.unwrap();

        let a: Vec<_> = first
            .iter()
            .filter(|o| o.source == "upsert_idem_test")
            .collect();
        let b: Vec<_> = second
            .iter()
            .filter(|o| o.source == "upsert_idem_test")
            .collect();
        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 1);
        assert_eq!(b[0].confidence, 0.8);
        assert!(b[0].last_seen >= a[0].last_seen);
    }

    #[tokio::test]
    #[ignore]
    async fn test_whitelist_roundtrip() {
        let store = test_store().await.expect("IPRISK_TEST_DATABASE_URL not set");
        let prefix = crate::iputil::parse_ip_or_prefix("203.0.113.0/24").unwrap();

        store
            .add_whitelist(prefix, Some("test".into()), true, None)
            .await
            .unwrap();
        assert!(store.is_whitelisted("203.0.113.9".parse().unwrap()).await.unwrap());
        assert!(store.remove_whitelist(prefix).await.unwrap());
        assert!(!store.is_whitelisted("203.0.113.9".parse().unwrap()).await.unwrap());
    }

    #[tokio::test]
    #[ignore]
    async fn test_bulk_path_matches_small_path() {
        let store = test_store().await.expect("IPRISK_TEST_DATABASE_URL not set");

        let big: Vec<Observation> = (0..BULK_THRESHOLD + 10)
            .map(|i| {
                observation(
                    &format!("10.{}.{}.0/24", 200 + i / 250, i % 250),
                    "bulk_path_test",
                )
            })
            .collect();

        let written = store.upsert_batch(&big).await.unwrap();
        assert_eq!(written as usize, big.len());
    }
}
