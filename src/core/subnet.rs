//! IP classification and subnet list membership.
//!
//! List entries are plain IPs (treated as /32 or /128) or CIDRs; matching is
//! purely lexical on address families, no DNS.

use std::net::IpAddr;

use ipnet::IpNet;

use crate::logger::log;

/// Address family of a textual IP, or invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpClass {
    V4,
    V6,
    Invalid,
}

/// Classify a textual IP address.
pub fn classify(ip: &str) -> IpClass {
    match ip.parse::<IpAddr>() {
        Ok(IpAddr::V4(_)) => IpClass::V4,
        Ok(IpAddr::V6(_)) => IpClass::V6,
        Err(_) => IpClass::Invalid,
    }
}

/// Check whether `ip` is covered by any entry in `subnets`.
///
/// Entries without a '/' get the host prefix for their family. Malformed
/// entries are skipped with a warning and never fail the whole check.
/// Returns true on the first match.
pub fn subnets_contain(subnets: &[String], ip: IpAddr) -> bool {
    for entry in subnets {
        let entry = entry.trim();
        let candidate = if entry.contains('/') {
            entry.to_string()
        } else {
            match classify(entry) {
                IpClass::V4 => format!("{}/32", entry),
                IpClass::V6 => format!("{}/128", entry),
                IpClass::Invalid => {
                    log::warn!(entry = entry, "Skipping invalid IP in subnet list");
                    continue;
                }
            }
        };
        let net: IpNet = match candidate.parse() {
            Ok(net) => net,
            Err(e) => {
                log::warn!(entry = entry, error = %e, "Skipping invalid CIDR in subnet list");
                continue;
            }
        };
        if net.contains(&ip) {
            return true;
        }
    }
    false
}
