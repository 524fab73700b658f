//! IP address and prefix handling
//!
//! Every component normalizes addresses through this module: feed tokens,
//! store range endpoints, and lookup inputs all pass through the same
//! parsing and masking rules.

use anyhow::{anyhow, Result};
use ipnetwork::{IpNetwork, Ipv4Network, Ipv6Network};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Parse an IP address string.
///
/// Accepts bracketed IPv6 (`[::1]:8080`) and dotted-quad with a trailing
/// port (`192.168.1.1:8080`). IPv4-mapped IPv6 is unmapped to IPv4.
pub fn parse_ip(s: &str) -> Result<IpAddr> {
    let mut s = s.trim();

    if let Some(rest) = s.strip_prefix('[') {
        if let Some(idx) = rest.find(']') {
            s = &rest[..idx];
        }
    } else if s.contains('.') && s.contains(':') {
        // IPv4 with port like 192.168.1.1:8080
        if let Some(idx) = s.rfind(':') {
            s = &s[..idx];
        }
    }

    let addr: IpAddr = s
        .parse()
        .map_err(|_| anyhow!("invalid IP address: {}", s))?;

    Ok(normalize_ip(addr))
}

/// Parse a CIDR prefix string. A bare address is widened to /32 or /128.
/// The result is always masked to its network address.
pub fn parse_prefix(s: &str) -> Result<IpNetwork> {
    let s = s.trim();

    if !s.contains('/') {
        let addr = parse_ip(s)?;
        return Ok(host_prefix(addr));
    }

    let net: IpNetwork = s
        .parse()
        .map_err(|_| anyhow!("invalid CIDR prefix: {}", s))?;

    mask(net)
}

/// Parse a string that is either a single address or a CIDR prefix.
/// Single addresses are lifted to host prefixes at this boundary.
pub fn parse_ip_or_prefix(s: &str) -> Result<IpNetwork> {
    let s = s.trim();
    if s.contains('/') {
        parse_prefix(s)
    } else {
        Ok(host_prefix(parse_ip(s)?))
    }
}

/// Parse an `IP:PORT` string.
pub fn parse_ip_port(s: &str) -> Result<(IpAddr, u16)> {
    let s = s.trim();

    let (ip_part, port_part) = s
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("invalid IP:PORT format: {}", s))?;

    let addr = parse_ip(ip_part)?;
    let port: u16 = port_part
        .parse()
        .map_err(|_| anyhow!("invalid port number: {}", port_part))?;

    Ok((addr, port))
}

/// Lift an address to its host prefix (/32 or /128).
pub fn host_prefix(addr: IpAddr) -> IpNetwork {
    match addr {
        IpAddr::V4(v4) => IpNetwork::V4(Ipv4Network::new(v4, 32).expect("/32 is valid")),
        IpAddr::V6(v6) => IpNetwork::V6(Ipv6Network::new(v6, 128).expect("/128 is valid")),
    }
}

/// Unmap IPv4-mapped IPv6 (`::ffff:a.b.c.d`) to plain IPv4.
pub fn normalize_ip(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => addr,
        },
        v4 => v4,
    }
}

/// Mask a network to its canonical form (network address at the given length).
pub fn mask(net: IpNetwork) -> Result<IpNetwork> {
    let masked = match net {
        IpNetwork::V4(n) => IpNetwork::V4(
            Ipv4Network::new(n.network(), n.prefix())
                .map_err(|e| anyhow!("invalid IPv4 prefix: {}", e))?,
        ),
        IpNetwork::V6(n) => IpNetwork::V6(
            Ipv6Network::new(n.network(), n.prefix())
                .map_err(|e| anyhow!("invalid IPv6 prefix: {}", e))?,
        ),
    };
    Ok(masked)
}

/// Canonical string key for a prefix, used to group observations.
pub fn prefix_key(net: &IpNetwork) -> String {
    format!("{}/{}", net.network(), net.prefix())
}

/// Whether an address may be queried for reputation. Loopback, private,
/// link-local, multicast, and unspecified addresses fail validation.
pub fn is_valid_for_lookup(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => {
            !(v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_multicast()
                || v4.is_unspecified()
                || v4.is_broadcast())
        }
        IpAddr::V6(v6) => {
            !(v6.is_loopback()
                || v6.is_multicast()
                || v6.is_unspecified()
                || is_unique_local(v6)
                || is_unicast_link_local(v6))
        }
    }
}

fn is_unique_local(v6: Ipv6Addr) -> bool {
    (v6.segments()[0] & 0xfe00) == 0xfc00
}

fn is_unicast_link_local(v6: Ipv6Addr) -> bool {
    (v6.segments()[0] & 0xffc0) == 0xfe80
}

/// Inclusive `[start, end]` endpoints of a prefix, for range queries.
pub fn range_from_prefix(net: &IpNetwork) -> (IpAddr, IpAddr) {
    match net {
        IpNetwork::V4(n) => {
            let start = u32::from(n.network());
            let prefix = u32::from(n.prefix());
            let end = if prefix >= 32 {
                start
            } else {
                start | (u32::MAX >> prefix)
            };
            (
                IpAddr::V4(Ipv4Addr::from(start)),
                IpAddr::V4(Ipv4Addr::from(end)),
            )
        }
        IpNetwork::V6(n) => {
            let start = u128::from(n.network());
            let prefix = u32::from(n.prefix());
            let end = if prefix >= 128 {
                start
            } else {
                start | (u128::MAX >> prefix)
            };
            (
                IpAddr::V6(Ipv6Addr::from(start)),
                IpAddr::V6(Ipv6Addr::from(end)),
            )
        }
    }
}

/// Inclusive range of a single address.
pub fn range_from_addr(addr: IpAddr) -> (IpAddr, IpAddr) {
    (addr, addr)
}

/// Number of addresses covered by a prefix, saturating for wide IPv6 nets.
pub fn prefix_size(net: &IpNetwork) -> u128 {
    match net {
        IpNetwork::V4(n) => 1u128 << (32 - u32::from(n.prefix())),
        IpNetwork::V6(n) => {
            let host_bits = 128 - u32::from(n.prefix());
            if host_bits >= 128 {
                u128::MAX
            } else {
                1u128 << host_bits
            }
        }
    }
}
