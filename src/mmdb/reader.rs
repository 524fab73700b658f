//! Memory-mapped reputation database reader
//!
//! Serves longest-prefix-match lookups against the compiled reputation
//! database plus optional co-located GeoLite2 City/ASN databases, and
//! supports atomic hot-swap: lookups clone the current handle under a
//! short read guard, a reload installs fresh handles under the write
//! guard, and an old mapping is unmapped only after the last in-flight
//! lookup drops its clone.

use maxminddb::{MaxMindDBError, Mmap, Reader};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::models::{AsnInfo, GeoInfo, IpCheckResult, RiskLevel, ThreatFlags};

/// Errors from reputation lookups.
#[derive(Error, Debug)]
pub enum MmdbError {
    /// The reputation database has not been loaded yet. Callers decide
    /// whether this becomes a clean default or a hard failure.
    #[error("reputation database not loaded")]
    NotLoaded,

    #[error("MMDB error: {0}")]
    MaxMind(#[from] MaxMindDBError),
}

/// The record stored per prefix in the reputation database. Field names
/// are the external contract of the compiled file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReputationRecord {
    pub risk_score: u16,
    pub risk_level: String,
    pub threat_type: String,
    /// 0-100.
    pub confidence: u16,
    pub sources: Vec<String>,
    /// Unix seconds.
    pub last_update: u64,
    pub is_tor: bool,
    pub is_vpn: bool,
    pub is_proxy: bool,
    pub is_datacenter: bool,
    pub is_botnet: bool,
    pub is_malware: bool,
    pub is_spam: bool,
    pub is_attacker: bool,

    // Optional co-located fields.
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub country_code: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub asn: Option<i64>,
    #[serde(default)]
    pub asn_org: Option<String>,
    #[serde(default)]
    pub asn_type: Option<String>,
}

impl ReputationRecord {
    pub fn flags(&self) -> ThreatFlags {
        ThreatFlags {
            is_tor: self.is_tor,
            is_vpn: self.is_vpn,
            is_proxy: self.is_proxy,
            is_datacenter: self.is_datacenter,
            is_botnet: self.is_botnet,
            is_malware: self.is_malware,
            is_spam: self.is_spam,
            is_attacker: self.is_attacker,
        }
    }
}

// GeoLite2 City layout, reduced to the fields served.

#[derive(Debug, Default, Deserialize)]
struct GeoNames {
    #[serde(default)]
    names: Option<std::collections::BTreeMap<String, String>>,
}

#[derive(Debug, Default, Deserialize)]
struct GeoCountry {
    #[serde(default)]
    iso_code: Option<String>,
    #[serde(default)]
    names: Option<std::collections::BTreeMap<String, String>>,
}

#[derive(Debug, Default, Deserialize)]
struct GeoLocation {
    #[serde(default)]
    latitude: Option<f64>,
    #[serde(default)]
    longitude: Option<f64>,
    #[serde(default)]
    time_zone: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct GeoCityRecord {
    #[serde(default)]
    country: Option<GeoCountry>,
    #[serde(default)]
    city: Option<GeoNames>,
    #[serde(default)]
    subdivisions: Option<Vec<GeoNames>>,
    #[serde(default)]
    location: Option<GeoLocation>,
}

#[derive(Debug, Default, Deserialize)]
struct AsnRecord {
    #[serde(default)]
    autonomous_system_number: Option<i64>,
    #[serde(default)]
    autonomous_system_organization: Option<String>,
}

/// Per-database metadata exposed by `stats`.
#[derive(Debug, Clone, Serialize)]
pub struct DbStats {
    pub database_type: String,
    pub build_epoch: u64,
    pub node_count: u32,
    pub record_size: u16,
    pub ip_version: u16,
}

/// Metadata for all loaded databases.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReaderStats {
    pub reputation: Option<DbStats>,
    pub geoip: Option<DbStats>,
    pub asn: Option<DbStats>,
}

type Handle = Arc<Reader<Mmap>>;

#[derive(Default)]
struct Handles {
    reputation: Option<Handle>,
    geoip: Option<Handle>,
    asn: Option<Handle>,
}

/// Hot-swappable reader over the reputation, geo, and ASN databases.
pub struct MmdbReader {
    handles: RwLock<Handles>,
}

impl MmdbReader {
    /// Open databases. A missing reputation database is an error; the
    /// geo/ASN databases are optional and only warn.
    pub fn open(
        reputation: Option<&Path>,
        geoip: Option<&Path>,
        asn: Option<&Path>,
    ) -> Result<Self, MmdbError> {
        let handles = Self::open_handles(reputation, geoip, asn)?;
        Ok(Self {
            handles: RwLock::new(handles),
        })
    }

    /// A reader with nothing loaded; lookups return `NotLoaded` until a
    /// reload succeeds.
    pub fn empty() -> Self {
        Self {
            handles: RwLock::new(Handles::default()),
        }
    }

    fn open_handles(
        reputation: Option<&Path>,
        geoip: Option<&Path>,
        asn: Option<&Path>,
    ) -> Result<Handles, MmdbError> {
        let mut handles = Handles::default();

        if let Some(path) = reputation {
            let reader = Reader::open_mmap(path)?;
            info!(path = %path.display(), "loaded reputation MMDB");
            handles.reputation = Some(Arc::new(reader));
        }

        handles.geoip = open_optional(geoip, "GeoIP");
        handles.asn = open_optional(asn, "ASN");

        Ok(handles)
    }

    /// Atomically replace the current databases. New files are opened
    /// first; on any reputation open failure the current handles stay
    /// installed. Old mappings drop after the last borrower finishes.
    pub fn reload(
        &self,
        reputation: Option<&Path>,
        geoip: Option<&Path>,
        asn: Option<&Path>,
    ) -> Result<(), MmdbError> {
        let new_handles = Self::open_handles(reputation, geoip, asn)?;

        let old = {
            let mut guard = self.handles.write();
            std::mem::replace(&mut *guard, new_handles)
        };
        drop(old);

        info!("reloaded MMDB databases");
        Ok(())
    }

    /// Release all handles. In-flight lookups complete against the
    /// mappings they already hold.
    pub fn close(&self) {
        let mut guard = self.handles.write();
        *guard = Handles::default();
    }

    fn snapshot(&self) -> (Option<Handle>, Option<Handle>, Option<Handle>) {
        let guard = self.handles.read();
        (
            guard.reputation.clone(),
            guard.geoip.clone(),
            guard.asn.clone(),
        )
    }

    /// Longest-prefix-match reputation lookup. `Ok(None)` means the IP
    /// has no record; `NotLoaded` means there is no database to ask.
    pub fn lookup_reputation(&self, addr: IpAddr) -> Result<Option<ReputationRecord>, MmdbError> {
        let reputation = self.handles.read().reputation.clone();
        let reader = reputation.ok_or(MmdbError::NotLoaded)?;

        match reader.lookup::<ReputationRecord>(addr) {
            Ok(record) => Ok(Some(record)),
            Err(MaxMindDBError::AddressNotFoundError(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Geolocation lookup; absent database or miss both yield `None`.
    pub fn lookup_geo(&self, addr: IpAddr) -> Option<GeoInfo> {
        let geoip = self.handles.read().geoip.clone()?;

        let record = match geoip.lookup::<GeoCityRecord>(addr) {
            Ok(record) => record,
            Err(MaxMindDBError::AddressNotFoundError(_)) => return None,
            Err(e) => {
                debug!(ip = %addr, error = %e, "GeoIP lookup failed");
                return None;
            }
        };

        let mut geo = GeoInfo::default();
        if let Some(country) = record.country {
            geo.country_code = country.iso_code;
            geo.country = country.names.and_then(|n| n.get("en").cloned());
        }
        if let Some(city) = record.city {
            geo.city = city.names.and_then(|n| n.get("en").cloned());
        }
        if let Some(subdivisions) = record.subdivisions {
            geo.region = subdivisions
                .into_iter()
                .next()
                .and_then(|s| s.names)
                .and_then(|n| n.get("en").cloned());
        }
        if let Some(location) = record.location {
            geo.latitude = location.latitude;
            geo.longitude = location.longitude;
            geo.timezone = location.time_zone;
        }

        Some(geo)
    }

    /// ASN lookup; absent database or miss both yield `None`.
    pub fn lookup_asn(&self, addr: IpAddr) -> Option<AsnInfo> {
        let asn_db = self.handles.read().asn.clone()?;

        let record = match asn_db.lookup::<AsnRecord>(addr) {
            Ok(record) => record,
            Err(MaxMindDBError::AddressNotFoundError(_)) => return None,
            Err(e) => {
                debug!(ip = %addr, error = %e, "ASN lookup failed");
                return None;
            }
        };

        let asn = record.autonomous_system_number?;
        Some(AsnInfo {
            asn,
            name: None,
            org: record.autonomous_system_organization.unwrap_or_default(),
            country_code: None,
            asn_type: None,
            risk_modifier: 0,
        })
    }

    /// Combined lookup. A miss in the reputation database yields a clean
    /// result; geo/ASN failures degrade to absent fields.
    pub fn lookup_all(&self, addr: IpAddr) -> Result<IpCheckResult, MmdbError> {
        let mut result = IpCheckResult::clean(addr);

        if let Some(record) = self.lookup_reputation(addr)? {
            result.risk_score = record.risk_score;
            result.risk_level = record
                .risk_level
                .parse()
                .unwrap_or_else(|_| RiskLevel::from_score(record.risk_score));
            result.flags = record.flags();
            result.threat_type = if record.threat_type.is_empty() {
                None
            } else {
                Some(record.threat_type)
            };
            result.sources = record.sources;
            result.confidence = record.confidence;
            result.last_update = Some(record.last_update);
        }

        result.geo = self.lookup_geo(addr);
        result.asn = self.lookup_asn(addr);

        Ok(result)
    }

    /// Metadata of the loaded databases.
    pub fn stats(&self) -> ReaderStats {
        let (reputation, geoip, asn) = self.snapshot();
        ReaderStats {
            reputation: reputation.as_deref().map(db_stats),
            geoip: geoip.as_deref().map(db_stats),
            asn: asn.as_deref().map(db_stats),
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.handles.read().reputation.is_some()
    }
}

fn db_stats(reader: &Reader<Mmap>) -> DbStats {
    let metadata = &reader.metadata;
    DbStats {
        database_type: metadata.database_type.clone(),
        build_epoch: metadata.build_epoch,
        node_count: metadata.node_count,
        record_size: metadata.record_size,
        ip_version: metadata.ip_version,
    }
}

fn open_optional(path: Option<&Path>, label: &str) -> Option<Handle> {
    let path = path?;
    match Reader::open_mmap(path) {
        Ok(reader) => {
            info!(path = %path.display(), "loaded {} MMDB", label);
            Some(Arc::new(reader))
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to open {} MMDB", label);
            None
        }
    }
}

/// Periodically re-open the databases so a freshly compiled file goes
/// live without a restart. Stops when the shutdown signal fires.
pub async fn reload_loop(
    reader: Arc<MmdbReader>,
    reputation: PathBuf,
    geoip: Option<PathBuf>,
    asn: Option<PathBuf>,
    interval: Duration,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await; // immediate first tick

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = reader.reload(
                    Some(&reputation),
                    geoip.as_deref(),
                    asn.as_deref(),
                ) {
                    warn!(error = %e, "MMDB reload failed, keeping current databases");
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mmdb::writer::{MmdbWriter, ReputationEntry, WriterConfig};
    use chrono::Utc;

    fn write_db(path: &Path, prefix: &str, score: u16) {
        let entry = ReputationEntry {
            prefix: prefix.parse().unwrap(),
            risk_score: score,
            risk_level: RiskLevel::from_score(score),
            threat_type: "tor".to_string(),
            confidence: 1.0,
            sources: vec!["tor_exit_nodes".to_string()],
            flags: ThreatFlags::from_threat_type("tor"),
            last_update: Utc::now(),
        };
        MmdbWriter::new(WriterConfig::default())
            .compile(&[entry], path)
            .unwrap();
    }

    #[test]
    fn test_not_loaded() {
        let reader = MmdbReader::empty();
        let err = reader
            .lookup_reputation("100.64.88.7".parse().unwrap())
            .unwrap_err();
        assert!(matches!(err, MmdbError::NotLoaded));
        assert!(!reader.is_loaded());
    }

    #[test]
    fn test_lookup_hit_and_miss() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rep.mmdb");
        write_db(&path, "100.64.88.0/24", 75);

        let reader = MmdbReader::open(Some(&path), None, None).unwrap();
        assert!(reader.is_loaded());

        let record = reader
            .lookup_reputation("100.64.88.7".parse().unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(record.risk_score, 75);
        assert!(record.is_tor);
        assert_eq!(record.sources, vec!["tor_exit_nodes"]);

        let miss = reader
            .lookup_reputation("100.64.99.7".parse().unwrap())
            .unwrap();
        assert!(miss.is_none());
    }

    #[test]
    fn test_lookup_all_defaults_on_miss() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rep.mmdb");
        write_db(&path, "100.64.88.0/24", 75);

        let reader = MmdbReader::open(Some(&path), None, None).unwrap();
        let result = reader.lookup_all("100.64.99.7".parse().unwrap()).unwrap();
        assert_eq!(result.risk_score, 0);
        assert_eq!(result.risk_level, RiskLevel::Clean);
        assert!(!result.flags.any());
        assert!(result.geo.is_none());
        assert!(result.asn.is_none());
    }

    #[test]
    fn test_reload_swaps_answers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rep.mmdb");
        write_db(&path, "100.64.88.0/24", 75);

        let reader = MmdbReader::open(Some(&path), None, None).unwrap();
        let before = reader
            .lookup_reputation("100.64.88.7".parse().unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(before.risk_score, 75);

        // Compile a replacement and hot-swap it in.
        write_db(&path, "100.64.88.0/24", 90);
        reader.reload(Some(&path), None, None).unwrap();

        let after = reader
            .lookup_reputation("100.64.88.7".parse().unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(after.risk_score, 90);
    }

    #[test]
    fn test_reload_failure_keeps_current() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rep.mmdb");
        write_db(&path, "100.64.88.0/24", 75);

        let reader = MmdbReader::open(Some(&path), None, None).unwrap();
        let missing = dir.path().join("does-not-exist.mmdb");
        assert!(reader.reload(Some(&missing), None, None).is_err());

        // Old database still answers.
        let record = reader
            .lookup_reputation("100.64.88.7".parse().unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(record.risk_score, 75);
    }

    #[test]
    fn test_close_releases() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rep.mmdb");
        write_db(&path, "100.64.88.0/24", 75);

        let reader = MmdbReader::open(Some(&path), None, None).unwrap();
        reader.close();
        assert!(!reader.is_loaded());
        assert!(matches!(
            reader.lookup_reputation("100.64.88.7".parse().unwrap()),
            Err(MmdbError::NotLoaded)
        ));
    }

    #[test]
    fn test_stats() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rep.mmdb");
        write_db(&path, "100.64.88.0/24", 75);

        let reader = MmdbReader::open(Some(&path), None, None).unwrap();
        let stats = reader.stats();
        let rep = stats.reputation.unwrap();
        assert_eq!(rep.record_size, 28);
        assert!(rep.node_count > 0);
        assert!(rep.build_epoch > 0);
        assert!(stats.geoip.is_none());
        assert!(stats.asn.is_none());
    }

    #[tokio::test]
    async fn test_reload_loop_picks_up_new_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rep.mmdb");
        write_db(&path, "100.64.88.0/24", 75);

        let reader = Arc::new(MmdbReader::open(Some(&path), None, None).unwrap());
        let (tx, rx) = tokio::sync::watch::channel(false);
        let handle = tokio::spawn(reload_loop(
            reader.clone(),
            path.clone(),
            None,
            None,
            Duration::from_millis(50),
            rx,
        ));

        write_db(&path, "100.64.88.0/24", 90);

        let addr: IpAddr = "100.64.88.7".parse().unwrap();
        let mut swapped = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if reader.lookup_reputation(addr).unwrap().unwrap().risk_score == 90 {
                swapped = true;
                break;
            }
        }
        assert!(swapped, "reload loop never picked up the new database");

        tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[test]
    fn test_concurrent_lookups_during_reload() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rep.mmdb");
        write_db(&path, "100.64.88.0/24", 75);

        let reader = Arc::new(MmdbReader::open(Some(&path), None, None).unwrap());
        let stop = Arc::new(AtomicBool::new(false));

        let mut workers = Vec::new();
        for _ in 0..4 {
            let reader = reader.clone();
            let stop = stop.clone();
            workers.push(std::thread::spawn(move || {
                let addr: IpAddr = "100.64.88.7".parse().unwrap();
                while !stop.load(Ordering::Relaxed) {
                    // Every answer must be consistent with one snapshot:
                    // score 75 or 90, never an error or a torn record.
                    let record = reader.lookup_reputation(addr).unwrap().unwrap();
                    assert!(record.risk_score == 75 || record.risk_score == 90);
                }
            }));
        }

        for score in [90, 75, 90, 75, 90] {
            write_db(&path, "100.64.88.0/24", score);
            reader.reload(Some(&path), None, None).unwrap();
        }

        stop.store(true, Ordering::Relaxed);
        for worker in workers {
            worker.join().unwrap();
        }
    }
}
