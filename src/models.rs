//! Core data types shared across the pipeline.

use chrono::{DateTime, Utc};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// One source's claim that one prefix exhibits one threat type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observation {
    /// Canonical (masked) prefix the claim covers.
    pub prefix: IpNetwork,
    /// Stable short source identifier, e.g. `tor_exit_nodes`.
    pub source: String,
    pub threat_type: String,
    /// Source confidence in [0.0, 1.0].
    pub confidence: f64,
    /// Source weight in [0, 100].
    pub weight: i32,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// A single threat claim as fed to the scoring engine.
///
/// `last_seen` is optional so that claims of unknown age can still be
/// scored (they decay to a fixed midpoint).
#[derive(Debug, Clone)]
pub struct Threat {
    pub threat_type: String,
    pub source: String,
    pub confidence: f64,
    pub last_seen: Option<DateTime<Utc>>,
}

impl Observation {
    /// View an observation as a scoring-engine threat claim.
    pub fn as_threat(&self) -> Threat {
        Threat {
            threat_type: self.threat_type.clone(),
            source: self.source.clone(),
            confidence: self.confidence,
            last_seen: Some(self.last_seen),
        }
    }
}

/// One parsed line of feed text, stamped with the feed's metadata.
#[derive(Debug, Clone)]
pub struct FeedEntry {
    pub prefix: IpNetwork,
    pub source: String,
    pub threat_type: String,
    pub confidence: f64,
    pub weight: i32,
    pub fetched_at: DateTime<Utc>,
}

/// Coarse risk classification of a numeric score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Clean,
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    /// Deterministic bucketing of a score into a risk level.
    pub fn from_score(score: u16) -> Self {
        match score {
            85.. => RiskLevel::Critical,
            70..=84 => RiskLevel::High,
            50..=69 => RiskLevel::Medium,
            25..=49 => RiskLevel::Low,
            _ => RiskLevel::Clean,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Clean => "clean",
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        }
    }

    /// Advisory display color (hex).
    pub fn color(&self) -> &'static str {
        match self {
            RiskLevel::Critical => "#dc3545",
            RiskLevel::High => "#fd7e14",
            RiskLevel::Medium => "#ffc107",
            RiskLevel::Low => "#17a2b8",
            RiskLevel::Clean => "#28a745",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RiskLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "clean" => Ok(RiskLevel::Clean),
            "low" => Ok(RiskLevel::Low),
            "medium" => Ok(RiskLevel::Medium),
            "high" => Ok(RiskLevel::High),
            "critical" => Ok(RiskLevel::Critical),
            other => Err(format!("unknown risk level: {}", other)),
        }
    }
}

/// Boolean threat flags derived from threat types.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreatFlags {
    pub is_tor: bool,
    pub is_vpn: bool,
    pub is_proxy: bool,
    pub is_datacenter: bool,
    pub is_botnet: bool,
    pub is_malware: bool,
    pub is_spam: bool,
    pub is_attacker: bool,
}

impl ThreatFlags {
    /// Map a threat type to its flag. Types without a dedicated flag
    /// (e.g. `hijacked`, `suspicious`) contribute to the score only.
    pub fn from_threat_type(threat_type: &str) -> Self {
        let mut flags = Self::default();
        match threat_type {
            "tor" => flags.is_tor = true,
            "vpn" => flags.is_vpn = true,
            "proxy" => flags.is_proxy = true,
            "datacenter" => flags.is_datacenter = true,
            "botnet_c2" => flags.is_botnet = true,
            "malware" => flags.is_malware = true,
            "spam" => flags.is_spam = true,
            "attack" => flags.is_attacker = true,
            _ => {}
        }
        flags
    }

    /// Bitwise-OR merge of another flag set into this one.
    pub fn merge(&mut self, other: ThreatFlags) {
        self.is_tor |= other.is_tor;
        self.is_vpn |= other.is_vpn;
        self.is_proxy |= other.is_proxy;
        self.is_datacenter |= other.is_datacenter;
        self.is_botnet |= other.is_botnet;
        self.is_malware |= other.is_malware;
        self.is_spam |= other.is_spam;
        self.is_attacker |= other.is_attacker;
    }

    pub fn any(&self) -> bool {
        self.is_tor
            || self.is_vpn
            || self.is_proxy
            || self.is_datacenter
            || self.is_botnet
            || self.is_malware
            || self.is_spam
            || self.is_attacker
    }
}

/// ASN reference data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsnInfo {
    pub asn: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub org: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country_code: Option<String>,
    /// One of `datacenter`, `hosting`, `isp`, `business`, `education`,
    /// `government`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub asn_type: Option<String>,
    #[serde(default)]
    pub risk_modifier: i32,
}

/// Geolocation data.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeoInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
}

/// Aggregated threat information for display.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ThreatSummary {
    pub total_threats: usize,
    pub threat_types: HashMap<String, usize>,
    /// Distinct sources in first-appearance order.
    pub sources: Vec<String>,
    pub max_confidence: f64,
}

/// The answer to "is this IP dangerous, and how dangerous?".
#[derive(Debug, Clone, Serialize)]
pub struct IpCheckResult {
    pub ip: String,
    pub risk_score: u16,
    pub risk_level: RiskLevel,
    #[serde(flatten)]
    pub flags: ThreatFlags,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threat_type: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<String>,
    pub confidence: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_update: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub geo: Option<GeoInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub asn: Option<AsnInfo>,
}

impl IpCheckResult {
    /// A well-formed clean result for an IP with no reputation data.
    pub fn clean(ip: IpAddr) -> Self {
        Self {
            ip: ip.to_string(),
            risk_score: 0,
            risk_level: RiskLevel::Clean,
            flags: ThreatFlags::default(),
            threat_type: None,
            sources: Vec::new(),
            confidence: 0,
            last_update: None,
            geo: None,
            asn: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_risk_level_thresholds() {
        let cases = [
            (0, RiskLevel::Clean),
            (24, RiskLevel::Clean),
            (25, RiskLevel::Low),
            (49, RiskLevel::Low),
            (50, RiskLevel::Medium),
            (69, RiskLevel::Medium),
            (70, RiskLevel::High),
            (84, RiskLevel::High),
            (85, RiskLevel::Critical),
            (100, RiskLevel::Critical),
        ];
        for (score, want) in cases {
            assert_eq!(RiskLevel::from_score(score), want, "score {}", score);
        }
    }

    #[test]
    fn test_risk_level_monotonic() {
        let mut prev = RiskLevel::from_score(0);
        for score in 1..=100u16 {
            let level = RiskLevel::from_score(score);
            assert!(level as u8 >= prev as u8, "not monotonic at {}", score);
            prev = level;
        }
    }

    #[test]
    fn test_risk_level_roundtrip() {
        for level in [
            RiskLevel::Clean,
            RiskLevel::Low,
            RiskLevel::Medium,
            RiskLevel::High,
            RiskLevel::Critical,
        ] {
            assert_eq!(level.as_str().parse::<RiskLevel>().unwrap(), level);
        }
    }

    #[test]
    fn test_flags_from_threat_type() {
        assert!(ThreatFlags::from_threat_type("tor").is_tor);
        assert!(ThreatFlags::from_threat_type("botnet_c2").is_botnet);
        assert!(ThreatFlags::from_threat_type("attack").is_attacker);
        assert!(!ThreatFlags::from_threat_type("hijacked").any());
        assert!(!ThreatFlags::from_threat_type("unknown_type").any());
    }

    #[test]
    fn test_flags_merge() {
        let mut flags = ThreatFlags::from_threat_type("tor");
        flags.merge(ThreatFlags::from_threat_type("proxy"));
        assert!(flags.is_tor);
        assert!(flags.is_proxy);
        assert!(!flags.is_vpn);
    }

    #[test]
    fn test_clean_result() {
        let result = IpCheckResult::clean("11.0.0.1".parse().unwrap());
        assert_eq!(result.risk_score, 0);
        assert_eq!(result.risk_level, RiskLevel::Clean);
        assert!(!result.flags.any());
    }
}
