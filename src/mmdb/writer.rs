//! MaxMind DB serializer
//!
//! Builds the bitwise search tree and data section of the MaxMind DB
//! format (version 2.0) and writes them atomically. IPv4 space lives
//! under ::/96 of the IPv6 tree, which is where `maxminddb` expects to
//! find it.
//!
//! Insert semantics preserve longest-prefix-match regardless of insertion
//! order: an exact-prefix re-insert replaces the record, a finer prefix
//! splits the covering record downward, and a coarser prefix fills only
//! the empty gaps beneath it.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use ipnetwork::IpNetwork;
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::Path;
use tracing::{debug, info};

use crate::iputil;
use crate::models::{RiskLevel, ThreatFlags};

const DATA_SECTION_SEPARATOR: usize = 16;
const METADATA_MARKER: &[u8] = b"\xab\xcd\xefMaxMind.com";

/// Writer configuration.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    pub database_type: String,
    pub description: String,
    /// Record size in bits: 24, 28, or 32.
    pub record_size: u16,
    /// Whether reserved (non-global) networks may be inserted.
    pub include_reserved: bool,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            database_type: "iprisk-reputation".to_string(),
            description: "IP reputation database".to_string(),
            record_size: 28,
            include_reserved: false,
        }
    }
}

/// One merged reputation record to write.
#[derive(Debug, Clone)]
pub struct ReputationEntry {
    pub prefix: IpNetwork,
    pub risk_score: u16,
    pub risk_level: RiskLevel,
    pub threat_type: String,
    /// Maximum observed confidence in [0.0, 1.0].
    pub confidence: f64,
    /// Distinct sources in first-appearance order.
    pub sources: Vec<String>,
    pub flags: ThreatFlags,
    pub last_update: DateTime<Utc>,
}

/// Outcome of one compile.
#[derive(Debug, Clone, Default)]
pub struct CompileStats {
    pub inserted: usize,
    pub skipped: usize,
    pub node_count: u32,
    pub data_bytes: usize,
}

/// Serializes reputation entries into an MMDB file.
pub struct MmdbWriter {
    config: WriterConfig,
}

impl MmdbWriter {
    pub fn new(config: WriterConfig) -> Self {
        Self { config }
    }

    /// Compile entries and write them to `output_path` via a temp file
    /// and atomic rename, so readers never observe a partial database.
    pub fn compile(&self, entries: &[ReputationEntry], output_path: &Path) -> Result<CompileStats> {
        let (bytes, stats) = self.compile_to_bytes(entries)?;

        if let Some(parent) = output_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
        }

        let tmp_path = output_path.with_extension("mmdb.tmp");
        let mut file = fs::File::create(&tmp_path)
            .with_context(|| format!("failed to create {}", tmp_path.display()))?;

        if let Err(e) = file.write_all(&bytes).and_then(|_| file.sync_all()) {
            let _ = fs::remove_file(&tmp_path);
            return Err(e).context("failed to write MMDB");
        }
        drop(file);

        if let Err(e) = fs::rename(&tmp_path, output_path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(e).with_context(|| {
                format!("failed to rename {} over {}", tmp_path.display(), output_path.display())
            });
        }

        info!(
            path = %output_path.display(),
            inserted = stats.inserted,
            skipped = stats.skipped,
            nodes = stats.node_count,
            "MMDB compilation complete"
        );

        Ok(stats)
    }

    /// Serialize entries into an in-memory MMDB image.
    pub fn compile_to_bytes(&self, entries: &[ReputationEntry]) -> Result<(Vec<u8>, CompileStats)> {
        if !matches!(self.config.record_size, 24 | 28 | 32) {
            bail!("unsupported record size: {}", self.config.record_size);
        }

        let mut tree = SearchTree::new();
        let mut records: Vec<Vec<u8>> = Vec::new();
        let mut dedup: HashMap<Vec<u8>, u32> = HashMap::new();
        let mut stats = CompileStats::default();

        for entry in entries {
            if !self.config.include_reserved && is_reserved(&entry.prefix) {
                debug!(prefix = %entry.prefix, "skipping reserved network");
                stats.skipped += 1;
                continue;
            }

            let mut encoded = Vec::new();
            encode_value(&mut encoded, &entry_to_value(entry));

            let data_index = match dedup.get(&encoded) {
                Some(&idx) => idx,
                None => {
                    let idx = records.len() as u32;
                    records.push(encoded.clone());
                    dedup.insert(encoded, idx);
                    idx
                }
            };

            let (bytes, depth) = prefix_bits(&entry.prefix);
            tree.insert(bytes, depth, data_index);
            stats.inserted += 1;
        }

        let node_count = tree.nodes.len() as u32;
        stats.node_count = node_count;

        // Offsets of each record within the data section.
        let mut offsets = Vec::with_capacity(records.len());
        let mut data_section = Vec::new();
        for record in &records {
            offsets.push(data_section.len() as u32);
            data_section.extend_from_slice(record);
        }
        stats.data_bytes = data_section.len();

        let max_value = match self.config.record_size {
            24 => 0x00ff_ffff,
            28 => 0x0fff_ffff,
            _ => u32::MAX,
        };

        let mut out = Vec::new();
        for node in &tree.nodes {
            let left = record_value(node[0], node_count, &offsets);
            let right = record_value(node[1], node_count, &offsets);
            if left > max_value || right > max_value {
                bail!(
                    "record value overflows {}-bit records; use a larger record size",
                    self.config.record_size
                );
            }
            write_node(&mut out, left, right, self.config.record_size);
        }

        out.extend_from_slice(&[0u8; DATA_SECTION_SEPARATOR]);
        out.extend_from_slice(&data_section);
        out.extend_from_slice(METADATA_MARKER);
        encode_value(&mut out, &self.metadata(node_count));

        Ok((out, stats))
    }

    fn metadata(&self, node_count: u32) -> DataValue {
        DataValue::Map(vec![
            ("binary_format_major_version".into(), DataValue::U16(2)),
            ("binary_format_minor_version".into(), DataValue::U16(0)),
            (
                "build_epoch".into(),
                DataValue::U64(Utc::now().timestamp().max(0) as u64),
            ),
            (
                "database_type".into(),
                DataValue::Str(self.config.database_type.clone()),
            ),
            (
                "description".into(),
                DataValue::Map(vec![(
                    "en".into(),
                    DataValue::Str(self.config.description.clone()),
                )]),
            ),
            ("ip_version".into(), DataValue::U16(6)),
            (
                "languages".into(),
                DataValue::Array(vec![DataValue::Str("en".into())]),
            ),
            ("node_count".into(), DataValue::U32(node_count)),
            ("record_size".into(), DataValue::U16(self.config.record_size)),
        ])
    }
}

impl Default for MmdbWriter {
    fn default() -> Self {
        Self::new(WriterConfig::default())
    }
}

/// Map a merged reputation entry to its MMDB record. Field names are a
/// stable external contract.
fn entry_to_value(entry: &ReputationEntry) -> DataValue {
    let confidence = (entry.confidence * 100.0).round().clamp(0.0, 100.0) as u16;
    let sources = entry
        .sources
        .iter()
        .map(|s| DataValue::Str(s.clone()))
        .collect();

    DataValue::Map(vec![
        ("risk_score".into(), DataValue::U16(entry.risk_score)),
        (
            "risk_level".into(),
            DataValue::Str(entry.risk_level.as_str().to_string()),
        ),
        (
            "threat_type".into(),
            DataValue::Str(entry.threat_type.clone()),
        ),
        ("confidence".into(), DataValue::U16(confidence)),
        ("sources".into(), DataValue::Array(sources)),
        (
            "last_update".into(),
            DataValue::U64(entry.last_update.timestamp().max(0) as u64),
        ),
        ("is_tor".into(), DataValue::Bool(entry.flags.is_tor)),
        ("is_vpn".into(), DataValue::Bool(entry.flags.is_vpn)),
        ("is_proxy".into(), DataValue::Bool(entry.flags.is_proxy)),
        (
            "is_datacenter".into(),
            DataValue::Bool(entry.flags.is_datacenter),
        ),
        ("is_botnet".into(), DataValue::Bool(entry.flags.is_botnet)),
        ("is_malware".into(), DataValue::Bool(entry.flags.is_malware)),
        ("is_spam".into(), DataValue::Bool(entry.flags.is_spam)),
        (
            "is_attacker".into(),
            DataValue::Bool(entry.flags.is_attacker),
        ),
    ])
}

fn is_reserved(prefix: &IpNetwork) -> bool {
    !iputil::is_valid_for_lookup(prefix.network())
}

/// Expand a prefix to its position in the IPv6 search tree: IPv4
/// prefixes sit under ::/96.
fn prefix_bits(prefix: &IpNetwork) -> ([u8; 16], u8) {
    match prefix {
        IpNetwork::V4(n) => {
            let mut bytes = [0u8; 16];
            bytes[12..16].copy_from_slice(&n.network().octets());
            (bytes, 96 + n.prefix())
        }
        IpNetwork::V6(n) => (n.network().octets(), n.prefix()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Record {
    Empty,
    Node(u32),
    Data(u32),
}

fn record_value(record: Record, node_count: u32, offsets: &[u32]) -> u32 {
    match record {
        Record::Empty => node_count,
        Record::Node(index) => index,
        Record::Data(data_index) => {
            node_count + DATA_SECTION_SEPARATOR as u32 + offsets[data_index as usize]
        }
    }
}

struct SearchTree {
    nodes: Vec<[Record; 2]>,
}

impl SearchTree {
    fn new() -> Self {
        Self {
            nodes: vec![[Record::Empty; 2]],
        }
    }

    fn new_node(&mut self, records: [Record; 2]) -> u32 {
        let index = self.nodes.len() as u32;
        self.nodes.push(records);
        index
    }

    /// Insert `data` at the given prefix depth.
    fn insert(&mut self, bytes: [u8; 16], depth: u8, data: u32) {
        if depth == 0 {
            self.fill(0, data);
            return;
        }

        let mut node = 0usize;
        for i in 0..depth - 1 {
            let bit = bit_at(&bytes, i);
            node = match self.nodes[node][bit] {
                Record::Node(child) => child as usize,
                Record::Empty => {
                    let child = self.new_node([Record::Empty; 2]);
                    self.nodes[node][bit] = Record::Node(child);
                    child as usize
                }
                // A covering record: push it one level down both branches
                // so finer inserts below keep longest-prefix semantics.
                Record::Data(existing) => {
                    let child = self.new_node([Record::Data(existing); 2]);
                    self.nodes[node][bit] = Record::Node(child);
                    child as usize
                }
            };
        }

        let bit = bit_at(&bytes, depth - 1);
        match self.nodes[node][bit] {
            // Finer entries already exist beneath this prefix; cover only
            // the gaps so they keep winning on longest match.
            Record::Node(child) => self.fill(child, data),
            _ => self.nodes[node][bit] = Record::Data(data),
        }
    }

    /// Set `data` on every empty record under a subtree.
    fn fill(&mut self, node: u32, data: u32) {
        for slot in 0..2 {
            match self.nodes[node as usize][slot] {
                Record::Empty => self.nodes[node as usize][slot] = Record::Data(data),
                Record::Node(child) => self.fill(child, data),
                Record::Data(_) => {}
            }
        }
    }
}

fn bit_at(bytes: &[u8; 16], index: u8) -> usize {
    let byte = bytes[(index / 8) as usize];
    ((byte >> (7 - index % 8)) & 1) as usize
}

fn write_node(out: &mut Vec<u8>, left: u32, right: u32, record_size: u16) {
    match record_size {
        24 => {
            out.extend_from_slice(&left.to_be_bytes()[1..4]);
            out.extend_from_slice(&right.to_be_bytes()[1..4]);
        }
        28 => {
            out.extend_from_slice(&left.to_be_bytes()[1..4]);
            out.push((((left >> 24) as u8 & 0x0f) << 4) | ((right >> 24) as u8 & 0x0f));
            out.extend_from_slice(&right.to_be_bytes()[1..4]);
        }
        _ => {
            out.extend_from_slice(&left.to_be_bytes());
            out.extend_from_slice(&right.to_be_bytes());
        }
    }
}

// ==================== Data section encoding ====================

/// MMDB data types used by this database.
#[derive(Debug, Clone)]
enum DataValue {
    Str(String),
    U16(u16),
    U32(u32),
    U64(u64),
    Bool(bool),
    Array(Vec<DataValue>),
    Map(Vec<(String, DataValue)>),
}

const TYPE_STRING: u8 = 2;
const TYPE_UINT16: u8 = 5;
const TYPE_UINT32: u8 = 6;
const TYPE_MAP: u8 = 7;
const TYPE_UINT64: u8 = 9;
const TYPE_ARRAY: u8 = 11;
const TYPE_BOOL: u8 = 14;

fn encode_value(out: &mut Vec<u8>, value: &DataValue) {
    match value {
        DataValue::Str(s) => {
            write_control(out, TYPE_STRING, s.len());
            out.extend_from_slice(s.as_bytes());
        }
        DataValue::U16(n) => {
            let bytes = minimal_be(u64::from(*n));
            write_control(out, TYPE_UINT16, bytes.len());
            out.extend_from_slice(&bytes);
        }
        DataValue::U32(n) => {
            let bytes = minimal_be(u64::from(*n));
            write_control(out, TYPE_UINT32, bytes.len());
            out.extend_from_slice(&bytes);
        }
        DataValue::U64(n) => {
            let bytes = minimal_be(*n);
            write_control(out, TYPE_UINT64, bytes.len());
            out.extend_from_slice(&bytes);
        }
        DataValue::Bool(b) => {
            // Booleans store their value in the size field.
            write_control(out, TYPE_BOOL, usize::from(*b));
        }
        DataValue::Array(items) => {
            write_control(out, TYPE_ARRAY, items.len());
            for item in items {
                encode_value(out, item);
            }
        }
        DataValue::Map(pairs) => {
            write_control(out, TYPE_MAP, pairs.len());
            for (key, val) in pairs {
                write_control(out, TYPE_STRING, key.len());
                out.extend_from_slice(key.as_bytes());
                encode_value(out, val);
            }
        }
    }
}

/// Control byte(s): three type bits (0 selects the extended type byte)
/// and the five-bit size marker with its extension bytes.
fn write_control(out: &mut Vec<u8>, type_num: u8, size: usize) {
    let (type_bits, extended) = if type_num <= 7 {
        (type_num, None)
    } else {
        (0, Some(type_num - 7))
    };

    let (marker, size_bytes): (u8, Vec<u8>) = if size < 29 {
        (size as u8, Vec::new())
    } else if size < 29 + 256 {
        (29, vec![(size - 29) as u8])
    } else if size < 285 + 65536 {
        let n = (size - 285) as u16;
        (30, n.to_be_bytes().to_vec())
    } else {
        let n = (size - 65821) as u32;
        (31, n.to_be_bytes()[1..4].to_vec())
    };

    out.push((type_bits << 5) | marker);
    if let Some(ext) = extended {
        out.push(ext);
    }
    out.extend_from_slice(&size_bytes);
}

/// Big-endian representation with leading zero bytes stripped; zero
/// encodes as zero bytes.
fn minimal_be(n: u64) -> Vec<u8> {
    let bytes = n.to_be_bytes();
    let first = bytes.iter().position(|&b| b != 0).unwrap_or(8);
    bytes[first..].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::net::IpAddr;

    #[derive(Debug, Deserialize)]
    struct TestRecord {
        risk_score: u16,
        risk_level: String,
        threat_type: String,
        confidence: u16,
        sources: Vec<String>,
        last_update: u64,
        is_tor: bool,
        is_botnet: bool,
        is_proxy: bool,
    }

    fn entry(prefix: &str, threat_type: &str, score: u16) -> ReputationEntry {
        ReputationEntry {
            prefix: prefix.parse().unwrap(),
            risk_score: score,
            risk_level: RiskLevel::from_score(score),
            threat_type: threat_type.to_string(),
            confidence: 0.9,
            sources: vec![format!("{}_feed", threat_type)],
            flags: ThreatFlags::from_threat_type(threat_type),
            last_update: Utc::now(),
        }
    }

    fn reader_for(entries: &[ReputationEntry]) -> maxminddb::Reader<Vec<u8>> {
        let writer = MmdbWriter::default();
        let (bytes, _) = writer.compile_to_bytes(entries).unwrap();
        maxminddb::Reader::from_source(bytes).unwrap()
    }

    fn lookup(reader: &maxminddb::Reader<Vec<u8>>, ip: &str) -> Option<TestRecord> {
        let addr: IpAddr = ip.parse().unwrap();
        match reader.lookup::<TestRecord>(addr) {
            Ok(record) => Some(record),
            Err(maxminddb::MaxMindDBError::AddressNotFoundError(_)) => None,
            Err(e) => panic!("lookup failed: {}", e),
        }
    }

    #[test]
    fn test_minimal_be() {
        assert!(minimal_be(0).is_empty());
        assert_eq!(minimal_be(1), vec![1]);
        assert_eq!(minimal_be(256), vec![1, 0]);
        assert_eq!(minimal_be(u64::MAX).len(), 8);
    }

    #[test]
    fn test_control_byte_sizes() {
        let mut buf = Vec::new();
        write_control(&mut buf, TYPE_STRING, 5);
        assert_eq!(buf, vec![(2 << 5) | 5]);

        buf.clear();
        write_control(&mut buf, TYPE_STRING, 29);
        assert_eq!(buf, vec![(2 << 5) | 29, 0]);

        buf.clear();
        write_control(&mut buf, TYPE_BOOL, 1);
        assert_eq!(buf, vec![1, 7]);
    }

    #[test]
    fn test_single_entry_roundtrip() {
        let reader = reader_for(&[entry("100.64.88.0/24", "tor", 75)]);

        let record = lookup(&reader, "100.64.88.7").unwrap();
        assert_eq!(record.risk_score, 75);
        assert_eq!(record.risk_level, "high");
        assert_eq!(record.threat_type, "tor");
        assert_eq!(record.confidence, 90);
        assert_eq!(record.sources, vec!["tor_feed"]);
        assert!(record.is_tor);
        assert!(!record.is_botnet);
        assert!(record.last_update > 0);

        assert!(lookup(&reader, "100.64.89.7").is_none());
    }

    #[test]
    fn test_longest_prefix_match() {
        let coarse = entry("10.0.0.0/8", "proxy", 50);
        let fine = entry("10.1.2.0/24", "botnet_c2", 95);

        // Reserved exclusion off so the classic 10/8 scenario works.
        let config = WriterConfig {
            include_reserved: true,
            ..Default::default()
        };
        let writer = MmdbWriter::new(config);

        for entries in [
            vec![coarse.clone(), fine.clone()],
            vec![fine.clone(), coarse.clone()],
        ] {
            let (bytes, _) = writer.compile_to_bytes(&entries).unwrap();
            let reader = maxminddb::Reader::from_source(bytes).unwrap();

            let fine_hit = lookup(&reader, "10.1.2.7").unwrap();
            assert_eq!(fine_hit.risk_score, 95);
            assert!(fine_hit.is_botnet);

            let coarse_hit = lookup(&reader, "10.2.2.7").unwrap();
            assert_eq!(coarse_hit.risk_score, 50);
            assert!(coarse_hit.is_proxy);

            assert!(lookup(&reader, "11.0.0.1").is_none());
        }
    }

    #[test]
    fn test_exact_prefix_replaces() {
        let config = WriterConfig {
            include_reserved: true,
            ..Default::default()
        };
        let writer = MmdbWriter::new(config);

        let first = entry("10.0.0.0/16", "proxy", 40);
        let second = entry("10.0.0.0/16", "botnet_c2", 95);
        let (bytes, _) = writer.compile_to_bytes(&[first, second]).unwrap();
        let reader = maxminddb::Reader::from_source(bytes).unwrap();

        let record = lookup(&reader, "10.0.1.1").unwrap();
        assert_eq!(record.risk_score, 95);
    }

    #[test]
    fn test_ipv6_entries() {
        let reader = reader_for(&[entry("2001:db8:f00d::/48", "malware", 90)]);

        let record = lookup(&reader, "2001:db8:f00d::1").unwrap();
        assert_eq!(record.risk_score, 90);
        assert!(lookup(&reader, "2001:db8:beef::1").is_none());
    }

    #[test]
    fn test_reserved_networks_excluded() {
        let writer = MmdbWriter::default();
        let (_, stats) = writer
            .compile_to_bytes(&[
                entry("10.0.0.0/8", "proxy", 50),
                entry("192.168.0.0/16", "proxy", 50),
                entry("100.64.88.0/24", "proxy", 50),
            ])
            .unwrap();
        assert_eq!(stats.inserted, 1);
        assert_eq!(stats.skipped, 2);
    }

    #[test]
    fn test_identical_records_deduplicated() {
        let writer = MmdbWriter::default();
        let mut a = entry("100.64.88.0/24", "tor", 75);
        let mut b = entry("100.64.99.0/24", "tor", 75);
        // Same payload apart from the prefix.
        let stamp = Utc::now();
        a.last_update = stamp;
        b.last_update = stamp;

        let (_, stats) = writer.compile_to_bytes(&[a, b]).unwrap();
        assert_eq!(stats.inserted, 2);

        let writer = MmdbWriter::default();
        let mut c = entry("100.64.88.0/24", "tor", 75);
        c.last_update = stamp;
        let (solo_bytes, _) = writer.compile_to_bytes(&[c]).unwrap();
        // Dedup means the two-entry DB is not twice the data size; just
        // sanity-check both parse.
        assert!(maxminddb::Reader::from_source(solo_bytes).is_ok());
    }

    #[test]
    fn test_metadata() {
        let reader = reader_for(&[entry("100.64.88.0/24", "tor", 75)]);
        let metadata = &reader.metadata;
        assert_eq!(metadata.binary_format_major_version, 2);
        assert_eq!(metadata.record_size, 28);
        assert_eq!(metadata.ip_version, 6);
        assert_eq!(metadata.database_type, "iprisk-reputation");
        assert!(metadata.node_count > 0);
    }

    #[test]
    fn test_record_sizes() {
        for record_size in [24, 28, 32] {
            let config = WriterConfig {
                record_size,
                ..Default::default()
            };
            let writer = MmdbWriter::new(config);
            let (bytes, _) = writer
                .compile_to_bytes(&[entry("100.64.88.0/24", "tor", 75)])
                .unwrap();
            let reader = maxminddb::Reader::from_source(bytes).unwrap();
            assert_eq!(reader.metadata.record_size, u16::from(record_size));
            let record = lookup(&reader, "100.64.88.7").unwrap();
            assert_eq!(record.risk_score, 75);
        }
    }

    #[test]
    fn test_atomic_file_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reputation.mmdb");

        let writer = MmdbWriter::default();
        let stats = writer
            .compile(&[entry("100.64.88.0/24", "tor", 75)], &path)
            .unwrap();
        assert_eq!(stats.inserted, 1);
        assert!(path.exists());
        assert!(!dir.path().join("reputation.mmdb.tmp").exists());

        let reader = maxminddb::Reader::open_readfile(&path).unwrap();
        assert_eq!(reader.metadata.database_type, "iprisk-reputation");
    }

    #[test]
    fn test_compile_deterministic_lookups() {
        let entries = vec![
            entry("100.64.0.0/16", "proxy", 50),
            entry("100.64.5.0/24", "botnet_c2", 95),
            entry("2001:db8::/32", "spam", 60),
        ];
        let config = WriterConfig {
            include_reserved: true,
            ..Default::default()
        };

        let a = MmdbWriter::new(config.clone()).compile_to_bytes(&entries).unwrap().0;
        let b = MmdbWriter::new(config).compile_to_bytes(&entries).unwrap().0;

        let reader_a = maxminddb::Reader::from_source(a).unwrap();
        let reader_b = maxminddb::Reader::from_source(b).unwrap();

        for ip in ["100.64.5.9", "100.64.9.9", "2001:db8::42"] {
            let ra = lookup(&reader_a, ip).unwrap();
            let rb = lookup(&reader_b, ip).unwrap();
            assert_eq!(ra.risk_score, rb.risk_score, "{}", ip);
            assert_eq!(ra.threat_type, rb.threat_type, "{}", ip);
        }
    }
}
