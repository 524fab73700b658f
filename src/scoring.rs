//! Risk scoring engine
//!
//! Pure function from threat observations to a bounded score:
//! `S = clamp(Σ(W × C × D(t)) × M + bonuses, 0, 100)` where W is the
//! configured weight of the threat type, C the source confidence, D(t)
//! exponential time decay, and M the corroboration multipliers.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::models::{RiskLevel, Threat, ThreatSummary};

const DEFAULT_THREAT_WEIGHT: i32 = 50;
const DEFAULT_CONFIDENCE: f64 = 0.5;
const DECAY_FLOOR: f64 = 0.1;
const UNKNOWN_AGE_DECAY: f64 = 0.5;

/// Tunable scoring parameters, loaded from the `scoring` config section.
/// The map-valued fields come last so the TOML form serializes cleanly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringConfig {
    /// Exponential decay rate per day.
    #[serde(default = "default_decay_lambda")]
    pub decay_lambda: f64,

    /// Observations older than this decay to the floor.
    #[serde(default = "default_max_age_days")]
    pub max_age_days: i64,

    #[serde(default = "default_min_score")]
    pub min_score: u16,

    #[serde(default = "default_max_score")]
    pub max_score: u16,

    /// Score at or above which an IP is considered risky by callers.
    #[serde(default = "default_risk_threshold")]
    pub risk_threshold: u16,

    /// Applied when two or more distinct threat types corroborate.
    #[serde(default = "default_multi_threat_multiplier")]
    pub multi_threat_multiplier: f64,

    /// Applied when the ASN type is datacenter or hosting.
    #[serde(default = "default_datacenter_multiplier")]
    pub datacenter_multiplier: f64,

    #[serde(default = "default_high_confidence_threshold")]
    pub high_confidence_threshold: f64,

    /// Flat additive applied once when any observation clears the
    /// high-confidence threshold.
    #[serde(default = "default_high_confidence_bonus")]
    pub high_confidence_bonus: i32,

    /// Base weight per threat type; unknown types fall back to 50.
    #[serde(default = "default_weights")]
    pub weights: HashMap<String, i32>,

    /// Signed risk modifier per ASN type.
    #[serde(default = "default_asn_bonuses")]
    pub asn_bonuses: HashMap<String, i32>,
}

fn default_weights() -> HashMap<String, i32> {
    [
        ("tor", 70),
        ("vpn", 45),
        ("proxy", 50),
        ("datacenter", 40),
        ("botnet_c2", 95),
        ("malware", 90),
        ("spam", 60),
        ("hijacked", 95),
        ("attack", 75),
        ("suspicious", 55),
        ("malicious", 85),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}

fn default_asn_bonuses() -> HashMap<String, i32> {
    [
        ("datacenter", 15),
        ("hosting", 15),
        ("isp", 0),
        ("business", -10),
        ("education", -20),
        ("government", -25),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}

fn default_decay_lambda() -> f64 {
    0.01 // ~70 day half-life
}

fn default_max_age_days() -> i64 {
    180
}

fn default_min_score() -> u16 {
    0
}

fn default_max_score() -> u16 {
    100
}

fn default_risk_threshold() -> u16 {
    50
}

fn default_multi_threat_multiplier() -> f64 {
    1.1
}

fn default_datacenter_multiplier() -> f64 {
    1.15
}

fn default_high_confidence_threshold() -> f64 {
    0.9
}

fn default_high_confidence_bonus() -> i32 {
    5
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            weights: default_weights(),
            asn_bonuses: default_asn_bonuses(),
            decay_lambda: default_decay_lambda(),
            max_age_days: default_max_age_days(),
            min_score: default_min_score(),
            max_score: default_max_score(),
            risk_threshold: default_risk_threshold(),
            multi_threat_multiplier: default_multi_threat_multiplier(),
            datacenter_multiplier: default_datacenter_multiplier(),
            high_confidence_threshold: default_high_confidence_threshold(),
            high_confidence_bonus: default_high_confidence_bonus(),
        }
    }
}

/// ASN context as the scorer sees it.
#[derive(Debug, Clone)]
pub struct AsnContext {
    pub asn_type: String,
}

/// Detailed scoring result with the multipliers that fired.
#[derive(Debug, Clone, Serialize)]
pub struct ScoringResult {
    pub score: u16,
    pub risk_level: RiskLevel,
    pub color: String,
    pub summary: ThreatSummary,
    pub decay_applied: bool,
    pub multipliers: Vec<String>,
}

/// Calculates risk scores for IPs. Deterministic; no I/O.
#[derive(Debug, Clone)]
pub struct Scorer {
    config: ScoringConfig,
}

impl Scorer {
    pub fn new(config: ScoringConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ScoringConfig {
        &self.config
    }

    /// Compute the risk score for a set of threat observations on one IP
    /// or prefix, with optional ASN context, relative to `now`.
    pub fn score(&self, threats: &[Threat], asn: Option<&AsnContext>, now: DateTime<Utc>) -> u16 {
        if threats.is_empty() {
            return self.config.min_score;
        }

        let mut total = 0.0f64;
        let mut threat_types: Vec<&str> = Vec::new();

        for threat in threats {
            total += self.contribution(threat, now);
            if !threat_types.contains(&threat.threat_type.as_str()) {
                threat_types.push(&threat.threat_type);
            }
        }

        if threat_types.len() > 1 {
            total *= self.config.multi_threat_multiplier;
        }

        if let Some(asn) = asn {
            total += f64::from(self.asn_modifier(&asn.asn_type));
            if asn.asn_type == "datacenter" || asn.asn_type == "hosting" {
                total *= self.config.datacenter_multiplier;
            }
        }

        if threats
            .iter()
            .any(|t| t.confidence >= self.config.high_confidence_threshold)
        {
            total += f64::from(self.config.high_confidence_bonus);
        }

        let rounded = total.round();
        let clamped = rounded
            .max(f64::from(self.config.min_score))
            .min(f64::from(self.config.max_score));
        clamped as u16
    }

    /// `weight × confidence × decay` contribution of one threat claim.
    /// Also drives the compiler's primary-threat-type selection.
    pub fn contribution(&self, threat: &Threat, now: DateTime<Utc>) -> f64 {
        let weight = self.threat_weight(&threat.threat_type);
        let confidence = if threat.confidence > 0.0 {
            threat.confidence
        } else {
            DEFAULT_CONFIDENCE
        };
        f64::from(weight) * confidence * self.decay(threat.last_seen, now)
    }

    /// Time decay factor `D(t)`: 1.0 inside 24 hours, exponential decay
    /// after that, floored at 0.1, with fixed values for unknown or
    /// over-aged observations.
    pub fn decay(&self, last_seen: Option<DateTime<Utc>>, now: DateTime<Utc>) -> f64 {
        let last_seen = match last_seen {
            Some(t) => t,
            None => return UNKNOWN_AGE_DECAY,
        };

        let age = now - last_seen;

        if age > Duration::days(self.config.max_age_days) {
            return DECAY_FLOOR;
        }
        if age <= Duration::hours(24) {
            return 1.0;
        }

        let days = age.num_seconds() as f64 / 86_400.0;
        (-self.config.decay_lambda * days).exp().max(DECAY_FLOOR)
    }

    pub fn classify(&self, score: u16) -> RiskLevel {
        RiskLevel::from_score(score)
    }

    /// Hex display color for a score.
    pub fn score_color(&self, score: u16) -> &'static str {
        RiskLevel::from_score(score).color()
    }

    fn threat_weight(&self, threat_type: &str) -> i32 {
        self.config
            .weights
            .get(threat_type)
            .copied()
            .unwrap_or(DEFAULT_THREAT_WEIGHT)
    }

    fn asn_modifier(&self, asn_type: &str) -> i32 {
        self.config.asn_bonuses.get(asn_type).copied().unwrap_or(0)
    }

    /// Aggregate counts, distinct sources, and maximum confidence.
    pub fn threat_summary(&self, threats: &[Threat]) -> ThreatSummary {
        let mut summary = ThreatSummary {
            total_threats: threats.len(),
            ..Default::default()
        };

        for threat in threats {
            *summary
                .threat_types
                .entry(threat.threat_type.clone())
                .or_insert(0) += 1;
            if !summary.sources.contains(&threat.source) {
                summary.sources.push(threat.source.clone());
            }
            if threat.confidence > summary.max_confidence {
                summary.max_confidence = threat.confidence;
            }
        }

        summary
    }

    /// Full scoring result including which multipliers fired.
    pub fn detailed_score(
        &self,
        threats: &[Threat],
        asn: Option<&AsnContext>,
        now: DateTime<Utc>,
    ) -> ScoringResult {
        let score = self.score(threats, asn, now);

        let mut multipliers = Vec::new();
        let mut decay_applied = false;
        let mut distinct: Vec<&str> = Vec::new();

        for threat in threats {
            if !distinct.contains(&threat.threat_type.as_str()) {
                distinct.push(&threat.threat_type);
            }
            if let Some(last_seen) = threat.last_seen {
                if now - last_seen > Duration::hours(24) {
                    decay_applied = true;
                }
            }
        }

        if distinct.len() > 1 {
            multipliers.push("multi_threat".to_string());
        }
        if let Some(asn) = asn {
            if asn.asn_type == "datacenter" || asn.asn_type == "hosting" {
                multipliers.push("datacenter".to_string());
            }
        }

        ScoringResult {
            score,
            risk_level: self.classify(score),
            color: self.score_color(score).to_string(),
            summary: self.threat_summary(threats),
            decay_applied,
            multipliers,
        }
    }
}

impl Default for Scorer {
    fn default() -> Self {
        Self::new(ScoringConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn threat(threat_type: &str, confidence: f64, last_seen: Option<DateTime<Utc>>) -> Threat {
        Threat {
            threat_type: threat_type.to_string(),
            source: format!("{}_feed", threat_type),
            confidence,
            last_seen,
        }
    }

    #[test]
    fn test_no_threats_scores_zero() {
        let scorer = Scorer::default();
        assert_eq!(scorer.score(&[], None, Utc::now()), 0);
    }

    #[test]
    fn test_single_tor_fresh() {
        let scorer = Scorer::default();
        let now = Utc::now();
        let score = scorer.score(&[threat("tor", 1.0, Some(now))], None, now);
        assert!((60..=80).contains(&score), "score {}", score);
    }

    #[test]
    fn test_botnet_c2_high_confidence() {
        let scorer = Scorer::default();
        let now = Utc::now();
        let score = scorer.score(&[threat("botnet_c2", 1.0, Some(now))], None, now);
        assert!((90..=100).contains(&score), "score {}", score);
        assert_eq!(scorer.classify(score), RiskLevel::Critical);
    }

    #[test]
    fn test_multi_threat_multiplier() {
        let scorer = Scorer::default();
        let now = Utc::now();
        let threats = [threat("tor", 1.0, Some(now)), threat("proxy", 0.8, Some(now))];
        let score = scorer.score(&threats, None, now);
        assert!((80..=100).contains(&score), "score {}", score);

        let detailed = scorer.detailed_score(&threats, None, now);
        assert!(detailed.multipliers.contains(&"multi_threat".to_string()));
        assert!(!detailed.decay_applied);
    }

    #[test]
    fn test_datacenter_asn_bonus() {
        let scorer = Scorer::default();
        let now = Utc::now();
        let asn = AsnContext {
            asn_type: "datacenter".to_string(),
        };
        let threats = [threat("proxy", 0.8, Some(now))];
        let score = scorer.score(&threats, Some(&asn), now);
        assert!((50..=90).contains(&score), "score {}", score);

        let detailed = scorer.detailed_score(&threats, Some(&asn), now);
        assert!(detailed.multipliers.contains(&"datacenter".to_string()));
    }

    #[test]
    fn test_decay_at_30_days() {
        let scorer = Scorer::default();
        let now = Utc::now();
        let last_seen = now - Duration::days(30);

        let decay = scorer.decay(Some(last_seen), now);
        assert!((decay - 0.74).abs() < 0.01, "decay {}", decay);

        // vpn weight 45 × 1.0 × ~0.74 ≈ 33
        let score = scorer.score(&[threat("vpn", 1.0, Some(last_seen))], None, now);
        assert_eq!(scorer.classify(score), RiskLevel::Low, "score {}", score);
    }

    #[test]
    fn test_decay_boundaries() {
        let scorer = Scorer::default();
        let now = Utc::now();

        assert_eq!(scorer.decay(None, now), 0.5);
        assert_eq!(scorer.decay(Some(now - Duration::hours(24)), now), 1.0);
        assert!(scorer.decay(Some(now - Duration::hours(25)), now) < 1.0);
        assert_eq!(
            scorer.decay(Some(now - Duration::days(180) - Duration::seconds(1)), now),
            0.1
        );

        // Interpolated values stay within [0.1, 1.0].
        for days in [2, 10, 60, 120, 179] {
            let decay = scorer.decay(Some(now - Duration::days(days)), now);
            assert!((0.1..=1.0).contains(&decay), "day {} decay {}", days, decay);
        }
    }

    #[test]
    fn test_unknown_threat_type_default_weight() {
        let scorer = Scorer::default();
        let now = Utc::now();
        let score = scorer.score(&[threat("zero_day_exotic", 1.0, Some(now))], None, now);
        // weight 50 × 1.0 × 1.0 + high-confidence bonus 5
        assert_eq!(score, 55);
    }

    #[test]
    fn test_high_confidence_bonus_applied_once() {
        let scorer = Scorer::default();
        let now = Utc::now();
        let one = scorer.score(&[threat("spam", 0.95, Some(now))], None, now);
        let two = scorer.score(
            &[threat("spam", 0.95, Some(now)), threat("spam", 0.92, Some(now))],
            None,
            now,
        );
        // Second high-confidence claim adds its contribution but not a
        // second bonus: 60×0.95 + 5 = 62 vs 60×0.95 + 60×0.92 + 5 = 117→100.
        assert_eq!(one, 62);
        assert_eq!(two, 100);
    }

    #[test]
    fn test_score_bounds_property() {
        let scorer = Scorer::default();
        let now = Utc::now();
        let cases: Vec<Vec<Threat>> = vec![
            vec![],
            vec![threat("botnet_c2", 1.0, Some(now)); 10],
            vec![threat("vpn", 0.0, None)],
            vec![threat("malicious", 1.0, Some(now - Duration::days(500)))],
        ];
        for threats in cases {
            let score = scorer.score(&threats, None, now);
            assert!(score <= 100);
        }

        // Negative ASN modifiers cannot push below zero.
        let asn = AsnContext {
            asn_type: "government".to_string(),
        };
        let score = scorer.score(
            &[threat("vpn", 0.1, Some(now - Duration::days(179)))],
            Some(&asn),
            now,
        );
        assert!(score <= 100);
    }

    #[test]
    fn test_threat_summary() {
        let scorer = Scorer::default();
        let now = Utc::now();
        let threats = [
            Threat {
                threat_type: "tor".into(),
                source: "tor_exit".into(),
                confidence: 1.0,
                last_seen: Some(now),
            },
            Threat {
                threat_type: "proxy".into(),
                source: "proxy_list".into(),
                confidence: 0.8,
                last_seen: Some(now),
            },
            Threat {
                threat_type: "tor".into(),
                source: "tor_exit".into(),
                confidence: 0.9,
                last_seen: Some(now),
            },
        ];

        let summary = scorer.threat_summary(&threats);
        assert_eq!(summary.total_threats, 3);
        assert_eq!(summary.threat_types["tor"], 2);
        assert_eq!(summary.threat_types["proxy"], 1);
        assert_eq!(summary.sources, vec!["tor_exit", "proxy_list"]);
        assert!((summary.max_confidence - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_zero_confidence_defaults_to_half() {
        let scorer = Scorer::default();
        let now = Utc::now();
        // tor weight 70 × 0.5 default confidence × 1.0 = 35
        let score = scorer.score(&[threat("tor", 0.0, Some(now))], None, now);
        assert_eq!(score, 35);
    }

    #[test]
    fn test_config_overrides() {
        let mut config = ScoringConfig::default();
        config.weights.insert("tor".to_string(), 10);
        let scorer = Scorer::new(config);
        let now = Utc::now();
        let score = scorer.score(&[threat("tor", 1.0, Some(now))], None, now);
        assert_eq!(score, 15); // 10 × 1.0 + high-confidence bonus 5
    }
}
