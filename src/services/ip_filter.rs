//! Server-wide address filter applied before routing.
//!
//! A client is admitted when it passes the allow list (only consulted when
//! `block_by_default` is set) and is not on the block list. Entries are
//! single addresses or CIDR networks.

use ipnet::IpNet;
use std::net::IpAddr;
use thiserror::Error;

#[derive(Clone, Debug, Default)]
pub struct IpFilterOptions {
    pub allowed: Vec<String>,
    pub blocked: Vec<String>,
    pub block_by_default: bool,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid address or network `{0}`")]
pub struct InvalidIpEntry(pub String);

/// An address or CIDR network entry. Single addresses become host networks.
pub fn parse_ip_entry(entry: &str) -> Result<IpNet, InvalidIpEntry> {
    let entry = entry.trim();
    let parsed = if entry.contains('/') {
        entry.parse::<IpNet>().ok()
    } else {
        entry.parse::<IpAddr>().ok().map(IpNet::from)
    };
    parsed.ok_or_else(|| InvalidIpEntry(entry.to_string()))
}

fn parse_entries(entries: &[String]) -> Result<Vec<IpNet>, InvalidIpEntry> {
    entries
        .iter()
        .filter(|e| !e.trim().is_empty())
        .map(|e| parse_ip_entry(e))
        .collect()
}

#[derive(Clone, Debug)]
pub struct IpFilter {
    allowed: Vec<IpNet>,
    blocked: Vec<IpNet>,
    block_by_default: bool,
}

impl IpFilter {
    pub fn new(options: &IpFilterOptions) -> Result<Self, InvalidIpEntry> {
        Ok(Self {
            allowed: parse_entries(&options.allowed)?,
            blocked: parse_entries(&options.blocked)?,
            block_by_default: options.block_by_default,
        })
    }

    pub fn allows(&self, ip: IpAddr) -> bool {
        let ip = ip.to_canonical();
        let admitted = !self.block_by_default || self.allowed.iter().any(|net| net.contains(&ip));
        admitted && !self.blocked.iter().any(|net| net.contains(&ip))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn filter(allowed: &[&str], blocked: &[&str], block_by_default: bool) -> IpFilter {
        IpFilter::new(&IpFilterOptions {
            allowed: allowed.iter().map(|s| s.to_string()).collect(),
            blocked: blocked.iter().map(|s| s.to_string()).collect(),
            block_by_default,
        })
        .unwrap()
    }

    #[test]
    fn open_filter_admits_everyone_not_blocked() {
        let f = filter(&[], &["10.0.0.6"], false);
        assert!(f.allows(ip("10.0.0.5")));
        assert!(!f.allows(ip("10.0.0.6")));
    }

    #[test]
    fn allowlist_with_block_by_default() {
        let f = filter(&["10.0.0.5", "192.168.0.0/24"], &[], true);
        assert!(f.allows(ip("10.0.0.5")));
        assert!(f.allows(ip("192.168.0.200")));
        assert!(!f.allows(ip("10.0.0.6")));
        assert!(!f.allows(ip("::1")));
    }

    #[test]
    fn block_list_wins_over_allow_list() {
        let f = filter(&["10.0.0.0/8"], &["10.0.0.6"], true);
        assert!(f.allows(ip("10.0.0.5")));
        assert!(!f.allows(ip("10.0.0.6")));
    }

    #[test]
    fn mapped_ipv4_addresses_match_ipv4_entries() {
        let f = filter(&["10.0.0.5"], &[], true);
        assert!(f.allows(ip("::ffff:10.0.0.5")));
    }

    #[test]
    fn malformed_entries_are_rejected() {
        let err = IpFilter::new(&IpFilterOptions {
            allowed: vec!["10.0.0.300".into()],
            ..Default::default()
        })
        .unwrap_err();
        assert_eq!(err, InvalidIpEntry("10.0.0.300".into()));
        assert!(parse_ip_entry("10.0.0.0/33").is_err());
        assert_eq!(parse_ip_entry(" ::1 ").unwrap().prefix_len(), 128);
    }
}
