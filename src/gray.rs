//! Gray (canary) release rules and cohort membership.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::error::{Error, Result};

/// Who gets to see a gray release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GrayRule {
    /// A stable share of callers, bucketed by caller id.
    Percentage { percentage: u32 },
    /// Exact ids, or prefixes written as `prefix*`.
    ClientId { client_ids: Vec<String> },
    /// Exact addresses, CIDR blocks, or dotted wildcards like `10.0.3.*`.
    IpRange { ip_ranges: Vec<String> },
}

impl GrayRule {
    /// Reject rule shapes that could never be evaluated sensibly.
    pub fn validate(&self) -> Result<()> {
        match self {
            GrayRule::Percentage { percentage } => {
                if *percentage > 100 {
                    return Err(Error::Validation(format!(
                        "percentage must be within 0..=100, got {}",
                        percentage
                    )));
                }
            }
            GrayRule::ClientId { client_ids } => {
                if client_ids.iter().all(|id| id.trim().is_empty()) {
                    return Err(Error::Validation("client_ids must not be empty".into()));
                }
            }
            GrayRule::IpRange { ip_ranges } => {
                if ip_ranges.is_empty() {
                    return Err(Error::Validation("ip_ranges must not be empty".into()));
                }
                for pattern in ip_ranges {
                    validate_ip_pattern(pattern)?;
                }
            }
        }
        Ok(())
    }

    /// Whether the caller falls inside the cohort. `salt` scopes percentage
    /// bucketing to one release so different canaries draw different cohorts.
    pub fn matches(&self, salt: u64, caller_id: &str, caller_ip: Option<&str>) -> bool {
        match self {
            GrayRule::Percentage { percentage } => in_percentage(salt, caller_id, *percentage),
            GrayRule::ClientId { client_ids } => match_client_id(caller_id, client_ids),
            GrayRule::IpRange { ip_ranges } => caller_ip
                .is_some_and(|ip| ip_ranges.iter().any(|pattern| ip_matches(pattern, ip))),
        }
    }
}

/// Stable 0..100 bucket for a caller under a given salt.
pub fn bucket(salt: u64, caller_id: &str) -> u64 {
    let input = format!("{}.{}", salt, caller_id);

    let mut hasher = Sha1::new();
    hasher.update(input.as_bytes());
    let hash = hasher.finalize();
    let hex = format!("{:x}", hash);

    let substr = &hex[..15];
    let value = u64::from_str_radix(substr, 16).unwrap_or(0);
    value % 100
}

/// `p = 0` admits nobody and `p >= 100` admits everybody. Anonymous callers
/// only get in at 100%.
pub fn in_percentage(salt: u64, caller_id: &str, percentage: u32) -> bool {
    if percentage >= 100 {
        return true;
    }
    if percentage == 0 || caller_id.is_empty() {
        return false;
    }
    bucket(salt, caller_id) < u64::from(percentage)
}

pub fn match_client_id(caller_id: &str, allowed: &[String]) -> bool {
    if caller_id.is_empty() {
        return false;
    }
    allowed.iter().any(|entry| match entry.strip_suffix('*') {
        Some(prefix) => caller_id.starts_with(prefix),
        None => entry == caller_id,
    })
}

/// Match an address against an exact address, a CIDR block, or a dotted
/// IPv4 pattern with `*` octets.
pub fn ip_matches(pattern: &str, ip: &str) -> bool {
    let pattern = pattern.trim();
    let ip = ip.trim();
    if pattern == ip {
        return true;
    }

    let Ok(addr) = ip.parse::<IpAddr>() else {
        return false;
    };

    if let Some((net, prefix)) = pattern.split_once('/') {
        return match (net.parse::<IpAddr>(), prefix.parse::<u8>()) {
            (Ok(net), Ok(prefix)) => cidr_contains(net, prefix, addr),
            _ => false,
        };
    }

    if pattern.contains('*') {
        let pattern_parts: Vec<&str> = pattern.split('.').collect();
        let ip_parts: Vec<&str> = ip.split('.').collect();
        return pattern_parts.len() == ip_parts.len()
            && pattern_parts
                .iter()
                .zip(&ip_parts)
                .all(|(p, i)| *p == "*" || p == i);
    }

    match pattern.parse::<IpAddr>() {
        Ok(exact) => exact == addr,
        Err(_) => false,
    }
}

fn cidr_contains(net: IpAddr, prefix: u8, addr: IpAddr) -> bool {
    match (net, addr) {
        (IpAddr::V4(net), IpAddr::V4(addr)) => {
            if prefix > 32 {
                return false;
            }
            let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
            (u32::from(net) & mask) == (u32::from(addr) & mask)
        }
        (IpAddr::V6(net), IpAddr::V6(addr)) => {
            if prefix > 128 {
                return false;
            }
            let mask = if prefix == 0 { 0 } else { u128::MAX << (128 - prefix) };
            (u128::from(net) & mask) == (u128::from(addr) & mask)
        }
        _ => false,
    }
}

pub fn validate_ip_pattern(pattern: &str) -> Result<()> {
    let pattern = pattern.trim();
    let invalid = || Error::Validation(format!("invalid IP pattern: {}", pattern));

    if let Some((net, prefix)) = pattern.split_once('/') {
        let net: IpAddr = net.parse().map_err(|_| invalid())?;
        let prefix: u8 = prefix.parse().map_err(|_| invalid())?;
        let max = if net.is_ipv4() { 32 } else { 128 };
        return if prefix <= max { Ok(()) } else { Err(invalid()) };
    }

    if pattern.contains('*') {
        let parts: Vec<&str> = pattern.split('.').collect();
        let ok = parts.len() == 4
            && parts
                .iter()
                .all(|p| *p == "*" || p.parse::<u8>().is_ok());
        return if ok { Ok(()) } else { Err(invalid()) };
    }

    pattern.parse::<IpAddr>().map(|_| ()).map_err(|_| invalid())
}
