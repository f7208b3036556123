//! Access policy and usage counter attached to one uploaded resource.

use chrono::{DateTime, Utc};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeSet,
    net::{IpAddr, SocketAddr},
};
use subtle::ConstantTimeEq;

/// Access gates a resource can require. Serialized as `IP`, `METADATA`, `API`.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum AuthType {
    /// Remote address must be in `allowed_ips` / `allowed_nets`.
    Ip,
    /// Request must carry the basic credentials stored on the record.
    Metadata,
    /// Request credentials must be accepted by the delegated API authenticator.
    Api,
}

/// Per-resource policy record.
///
/// Everything except `downloads` is fixed at upload time.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Metadata {
    /// MIME type declared by the uploader.
    pub content_type: String,

    /// Number of successful downloads so far.
    #[serde(default)]
    pub downloads: u64,

    /// Download quota, `0` means unlimited.
    #[serde(default)]
    pub max_downloads: u64,

    /// Expiry instant, `None` means the resource never expires.
    #[serde(default)]
    pub max_date: Option<DateTime<Utc>>,

    /// Secret required to delete the resource.
    pub deletion_token: String,

    /// Gates every request for this resource must pass.
    #[serde(default)]
    pub auth_types: BTreeSet<AuthType>,

    #[serde(default)]
    pub user: String,

    #[serde(default)]
    pub password: String,

    #[serde(default)]
    pub allowed_ips: Vec<IpAddr>,

    #[serde(default)]
    pub allowed_nets: Vec<IpNet>,
}

impl Metadata {
    /// Unrestricted record with no quota and no expiry.
    pub fn new(content_type: impl Into<String>, deletion_token: impl Into<String>) -> Self {
        Self {
            content_type: content_type.into(),
            downloads: 0,
            max_downloads: 0,
            max_date: None,
            deletion_token: deletion_token.into(),
            auth_types: BTreeSet::new(),
            user: String::new(),
            password: String::new(),
            allowed_ips: Vec::new(),
            allowed_nets: Vec::new(),
        }
    }

    pub fn auth_required(&self) -> bool {
        !self.auth_types.is_empty()
    }

    pub fn ip_filter_enabled(&self) -> bool {
        self.auth_types.contains(&AuthType::Ip)
    }

    pub fn api_auth_enabled(&self) -> bool {
        self.auth_types.contains(&AuthType::Api)
    }

    pub fn credentials_required(&self) -> bool {
        self.auth_types.contains(&AuthType::Metadata)
    }

    /// Evaluate the per-resource allowlist against a remote address string.
    ///
    /// Accepts `ip:port`, `[ipv6]:port` or a bare address. Anything that does
    /// not parse is denied.
    pub fn allowed_ip(&self, remote: &str) -> bool {
        if !self.ip_filter_enabled() {
            return true;
        }

        match parse_remote_ip(remote) {
            Some(ip) => self.allows(ip),
            None => false,
        }
    }

    fn allows(&self, ip: IpAddr) -> bool {
        let ip = ip.to_canonical();
        self.allowed_ips.iter().any(|allowed| *allowed == ip)
            || self.allowed_nets.iter().any(|net| net.contains(&ip))
    }

    /// Basic-credential gate. Only succeeds when the record actually requires
    /// credentials and both fields match exactly.
    pub fn authenticate(&self, user: &str, password: &str) -> bool {
        if !self.credentials_required() {
            return false;
        }
        let user_ok: bool = self.user.as_bytes().ct_eq(user.as_bytes()).into();
        let password_ok: bool = self.password.as_bytes().ct_eq(password.as_bytes()).into();
        user_ok && password_ok
    }

    pub fn deletion_token_matches(&self, candidate: &str) -> bool {
        self.deletion_token
            .as_bytes()
            .ct_eq(candidate.as_bytes())
            .into()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.max_date.is_some_and(|max_date| now > max_date)
    }

    pub fn quota_reached(&self) -> bool {
        self.max_downloads > 0 && self.downloads >= self.max_downloads
    }

    /// `None` when the quota is unlimited.
    pub fn remaining_downloads(&self) -> Option<u64> {
        (self.max_downloads > 0).then(|| self.max_downloads.saturating_sub(self.downloads))
    }

    /// Whole days left before expiry, `None` when the resource never expires.
    pub fn remaining_days(&self, now: DateTime<Utc>) -> Option<i64> {
        self.max_date
            .map(|max_date| (max_date - now).num_days().max(0))
    }

    /// Count one download. Returns `false` without mutating when the quota is
    /// already exhausted.
    pub fn record_download(&mut self) -> bool {
        if self.quota_reached() {
            return false;
        }
        self.downloads += 1;
        true
    }
}

/// Extract the host part of a remote address, stripping any port.
pub fn parse_remote_ip(remote: &str) -> Option<IpAddr> {
    let remote = remote.trim();
    if let Ok(addr) = remote.parse::<SocketAddr>() {
        return Some(addr.ip());
    }
    remote
        .trim_start_matches('[')
        .trim_end_matches(']')
        .parse::<IpAddr>()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn restricted_to(ips: &[&str], nets: &[&str]) -> Metadata {
        let mut meta = Metadata::new("text/plain", "del");
        meta.auth_types.insert(AuthType::Ip);
        meta.allowed_ips = ips.iter().map(|ip| ip.parse().unwrap()).collect();
        meta.allowed_nets = nets.iter().map(|net| net.parse().unwrap()).collect();
        meta
    }

    #[test]
    fn unrestricted_record_requires_nothing() {
        let meta = Metadata::new("text/plain", "del");
        assert!(!meta.auth_required());
        assert!(!meta.ip_filter_enabled());
        assert!(meta.allowed_ip("not an address"));
    }

    #[test]
    fn allowlist_matches_single_addresses() {
        let meta = restricted_to(&["10.0.0.5"], &[]);
        assert!(meta.allowed_ip("10.0.0.5:41234"));
        assert!(meta.allowed_ip("10.0.0.5"));
        assert!(!meta.allowed_ip("10.0.0.6:41234"));
        assert!(meta.allowed_ip("[::ffff:10.0.0.5]:41234"));
    }

    #[test]
    fn allowlist_matches_networks() {
        let meta = restricted_to(&[], &["192.168.1.0/24", "fd00::/8"]);
        assert!(meta.allowed_ip("192.168.1.77:80"));
        assert!(meta.allowed_ip("[fd00::1]:443"));
        assert!(!meta.allowed_ip("192.168.2.1:80"));
    }

    #[test]
    fn malformed_remote_address_is_denied() {
        let meta = restricted_to(&["10.0.0.5"], &["0.0.0.0/0"]);
        assert!(!meta.allowed_ip("garbage"));
        assert!(!meta.allowed_ip("10.0.0.5:notaport"));
        assert!(!meta.allowed_ip(""));
    }

    #[test]
    fn credentials_must_match_exactly() {
        let mut meta = Metadata::new("text/plain", "del");
        meta.auth_types.insert(AuthType::Metadata);
        meta.user = "alice".into();
        meta.password = "secret".into();

        assert!(meta.authenticate("alice", "secret"));
        assert!(!meta.authenticate("alice", "wrong"));
        assert!(!meta.authenticate("bob", "secret"));
        assert!(!meta.authenticate("alice", "secret "));
    }

    #[test]
    fn credentials_rejected_when_gate_not_configured() {
        let meta = Metadata::new("text/plain", "del");
        assert!(!meta.authenticate("", ""));
    }

    #[test]
    fn empty_credentials_match_only_empty_fields() {
        let mut meta = Metadata::new("text/plain", "del");
        meta.auth_types.insert(AuthType::Metadata);
        assert!(meta.authenticate("", ""));
        assert!(!meta.authenticate("alice", ""));
    }

    #[test]
    fn expiry_and_quota() {
        let now = Utc::now();
        let mut meta = Metadata::new("text/plain", "del");
        assert!(!meta.is_expired(now));
        assert_eq!(meta.remaining_days(now), None);

        meta.max_date = Some(now - Duration::seconds(1));
        assert!(meta.is_expired(now));

        meta.max_date = Some(now + Duration::days(3) + Duration::hours(1));
        assert_eq!(meta.remaining_days(now), Some(3));

        meta.max_downloads = 2;
        assert_eq!(meta.remaining_downloads(), Some(2));
        assert!(meta.record_download());
        assert!(meta.record_download());
        assert!(meta.quota_reached());
        assert!(!meta.record_download());
        assert_eq!(meta.downloads, 2);
        assert_eq!(meta.remaining_downloads(), Some(0));
    }

    #[test]
    fn deletion_token_comparison_is_exact() {
        let meta = Metadata::new("text/plain", "abc123");
        assert!(meta.deletion_token_matches("abc123"));
        assert!(!meta.deletion_token_matches("abc12"));
        assert!(!meta.deletion_token_matches("ABC123"));
    }

    #[test]
    fn serialized_record_keeps_every_field() {
        let mut meta = restricted_to(&["10.0.0.5", "::1"], &["10.1.0.0/16"]);
        meta.auth_types.insert(AuthType::Metadata);
        meta.auth_types.insert(AuthType::Api);
        meta.user = "alice".into();
        meta.password = "secret".into();
        meta.downloads = 3;
        meta.max_downloads = 9;
        meta.max_date = Some(Utc::now());

        let json = serde_json::to_string(&meta).unwrap();
        assert!(json.contains("\"IP\""));
        assert!(json.contains("\"METADATA\""));
        let decoded: Metadata = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, meta);
    }
}
