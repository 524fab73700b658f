//! Feed text parsing
//!
//! Turns one line of raw feed text into zero or one canonical prefix. The
//! set of feed formats is closed, so parsing is a single match on a format
//! tag rather than a trait hierarchy.

use chrono::{DateTime, Utc};
use ipnetwork::IpNetwork;
use std::fmt;
use std::str::FromStr;
use tracing::debug;

use crate::iputil;
use crate::models::FeedEntry;

/// How a feed's lines are laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedFormat {
    /// Entire line is an address or CIDR prefix.
    Plain,
    /// `IP:PORT`; the port is discarded.
    IpPort,
    /// `CIDR ; commentary` (Spamhaus DROP style).
    CidrComments,
    /// FireHOL netset: plain IP token with trailing commentary tolerated.
    Netset,
}

impl FeedFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedFormat::Plain => "plain",
            FeedFormat::IpPort => "ip_port",
            FeedFormat::CidrComments => "cidr_comments",
            FeedFormat::Netset => "netset",
        }
    }
}

impl fmt::Display for FeedFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FeedFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plain" => Ok(FeedFormat::Plain),
            "ip_port" => Ok(FeedFormat::IpPort),
            "cidr_comments" => Ok(FeedFormat::CidrComments),
            "netset" => Ok(FeedFormat::Netset),
            other => Err(format!("unknown feed format: {}", other)),
        }
    }
}

/// Metadata stamped onto every entry parsed from one source body.
#[derive(Debug, Clone)]
pub struct FeedMeta {
    pub source: String,
    pub threat_type: String,
    pub confidence: f64,
    pub weight: i32,
    pub fetched_at: DateTime<Utc>,
}

/// Result of parsing one feed body.
#[derive(Debug, Default)]
pub struct ParsedFeed {
    pub entries: Vec<FeedEntry>,
    /// Lines that looked like data but failed to parse.
    pub invalid: usize,
}

/// Parse a single feed line into a canonical prefix.
///
/// Returns `None` for empty lines, comments, and tokens that fail IP
/// validation; malformed input never fails a batch.
pub fn parse_line(line: &str, format: FeedFormat, comment_prefix: Option<&str>) -> Option<IpNetwork> {
    let line = line.trim();

    if line.is_empty() || is_comment(line, comment_prefix) {
        return None;
    }

    let token = match format {
        FeedFormat::Plain => line,
        FeedFormat::IpPort => line.rsplit_once(':').map(|(ip, _)| ip).unwrap_or(line),
        FeedFormat::CidrComments => line.split(';').next().unwrap_or(line).trim(),
        FeedFormat::Netset => line.split_whitespace().next().unwrap_or(line),
    };

    iputil::parse_ip_or_prefix(token).ok()
}

fn is_comment(line: &str, comment_prefix: Option<&str>) -> bool {
    if line.starts_with('#') || line.starts_with(';') || line.starts_with("//") {
        return true;
    }
    match comment_prefix {
        Some(prefix) if !prefix.is_empty() => line.starts_with(prefix),
        _ => false,
    }
}

/// Parse a whole feed body line-by-line, stamping each entry with the
/// feed's metadata.
pub fn parse_content(
    body: &str,
    format: FeedFormat,
    comment_prefix: Option<&str>,
    meta: &FeedMeta,
) -> ParsedFeed {
    let mut parsed = ParsedFeed::default();

    for line in body.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || is_comment(trimmed, comment_prefix) {
            continue;
        }

        match parse_line(trimmed, format, comment_prefix) {
            Some(prefix) => parsed.entries.push(FeedEntry {
                prefix,
                source: meta.source.clone(),
                threat_type: meta.threat_type.clone(),
                confidence: meta.confidence,
                weight: meta.weight,
                fetched_at: meta.fetched_at,
            }),
            None => parsed.invalid += 1,
        }
    }

    if parsed.invalid > 0 {
        debug!(
            source = %meta.source,
            invalid = parsed.invalid,
            "skipped unparseable feed lines"
        );
    }

    parsed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> FeedMeta {
        FeedMeta {
            source: "test_feed".to_string(),
            threat_type: "proxy".to_string(),
            confidence: 0.8,
            weight: 50,
            fetched_at: Utc::now(),
        }
    }

    #[test]
    fn test_format_from_str() {
        assert_eq!("plain".parse::<FeedFormat>().unwrap(), FeedFormat::Plain);
        assert_eq!("ip_port".parse::<FeedFormat>().unwrap(), FeedFormat::IpPort);
        assert!("xml".parse::<FeedFormat>().is_err());
    }

    #[test]
    fn test_plain_line() {
        let net = parse_line("1.2.3.4", FeedFormat::Plain, None).unwrap();
        assert_eq!(net.to_string(), "1.2.3.4/32");

        let net = parse_line("10.0.0.0/8", FeedFormat::Plain, None).unwrap();
        assert_eq!(net.to_string(), "10.0.0.0/8");
    }

    #[test]
    fn test_ip_port_line() {
        let net = parse_line("1.2.3.4:8080", FeedFormat::IpPort, None).unwrap();
        assert_eq!(net.to_string(), "1.2.3.4/32");
    }

    #[test]
    fn test_cidr_comments_line() {
        let net = parse_line("5.6.7.0/24 ; SBL123456", FeedFormat::CidrComments, None).unwrap();
        assert_eq!(net.to_string(), "5.6.7.0/24");
    }

    #[test]
    fn test_netset_line() {
        let net = parse_line("192.0.2.0/24  added 2024", FeedFormat::Netset, None).unwrap();
        assert_eq!(net.to_string(), "192.0.2.0/24");
    }

    #[test]
    fn test_comments_and_blanks_skipped() {
        for line in ["", "   ", "# comment", "; comment", "// comment"] {
            assert!(parse_line(line, FeedFormat::Plain, None).is_none(), "{:?}", line);
        }
        assert!(parse_line("-- custom", FeedFormat::Plain, Some("--")).is_none());
    }

    #[test]
    fn test_invalid_token_skipped() {
        assert!(parse_line("not an ip", FeedFormat::Plain, None).is_none());
        assert!(parse_line("999.999.0.1", FeedFormat::Plain, None).is_none());
    }

    #[test]
    fn test_v4_mapped_v6_unmapped() {
        let net = parse_line("::ffff:1.2.3.4", FeedFormat::Plain, None).unwrap();
        assert_eq!(net.to_string(), "1.2.3.4/32");
    }

    #[test]
    fn test_parse_content() {
        let body = "# header\n1.2.3.4\n5.6.7.0/24\nbogus line\n\n; trailer\n";
        let parsed = parse_content(body, FeedFormat::Plain, None, &meta());
        assert_eq!(parsed.entries.len(), 2);
        assert_eq!(parsed.invalid, 1);
        assert_eq!(parsed.entries[0].source, "test_feed");
        assert_eq!(parsed.entries[0].threat_type, "proxy");
    }

    #[test]
    fn test_parse_content_deterministic() {
        let body = "1.2.3.4\n5.6.7.0/24\n8.8.8.8:443\n";
        let m = meta();
        let a = parse_content(body, FeedFormat::Plain, None, &m);
        let b = parse_content(body, FeedFormat::Plain, None, &m);
        let prefixes_a: Vec<String> = a.entries.iter().map(|e| e.prefix.to_string()).collect();
        let prefixes_b: Vec<String> = b.entries.iter().map(|e| e.prefix.to_string()).collect();
        assert_eq!(prefixes_a, prefixes_b);
    }
}
