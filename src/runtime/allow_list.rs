//! Peer address allow-list.

use std::collections::HashSet;
use std::net::IpAddr;
use tracing::warn;

/// Hosts permitted to connect. Fixed after startup.
///
/// An unset list accepts every peer. A set list only admits the addresses it
/// contains, even if none of its entries parsed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllowList {
    hosts: Option<HashSet<IpAddr>>,
}

impl AllowList {
    /// Accept every peer.
    pub fn allow_all() -> Self {
        Self { hosts: None }
    }

    /// Parse a semicolon-separated host list such as `"10.0.0.1;10.0.0.2"`.
    ///
    /// A blank string yields an unrestricted list. Entries that are not IP
    /// addresses are logged and skipped.
    pub fn parse(spec: &str) -> Self {
        if spec.trim().is_empty() {
            return Self::allow_all();
        }

        let mut hosts = HashSet::new();
        for entry in spec.split(';').map(str::trim).filter(|e| !e.is_empty()) {
            match entry.parse::<IpAddr>() {
                Ok(ip) => {
                    hosts.insert(ip.to_canonical());
                }
                Err(_) => warn!(entry, "Ignoring allow-list entry that is not an IP address"),
            }
        }
        Self { hosts: Some(hosts) }
    }

    /// IPv4-mapped IPv6 peers match their IPv4 entry.
    pub fn permits(&self, ip: IpAddr) -> bool {
        match &self.hosts {
            None => true,
            Some(hosts) => hosts.contains(&ip.to_canonical()),
        }
    }

    pub fn is_restricted(&self) -> bool {
        self.hosts.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unset_accepts_all() {
        let list = AllowList::parse("");
        assert!(!list.is_restricted());
        assert!(list.permits("10.0.0.2".parse().unwrap()));
        assert!(AllowList::parse("   ").permits("::1".parse().unwrap()));
    }

    #[test]
    fn test_only_listed_hosts_permitted() {
        let list = AllowList::parse("10.0.0.1");
        assert!(list.permits("10.0.0.1".parse().unwrap()));
        assert!(!list.permits("10.0.0.2".parse().unwrap()));
    }

    #[test]
    fn test_semicolon_separated_entries() {
        let list = AllowList::parse("10.0.0.1; 192.168.1.5;;fe80::1");
        assert!(list.permits("192.168.1.5".parse().unwrap()));
        assert!(list.permits("fe80::1".parse().unwrap()));
        assert!(!list.permits("127.0.0.1".parse().unwrap()));
    }

    #[test]
    fn test_invalid_entries_still_restrict() {
        let list = AllowList::parse("not-an-ip");
        assert!(list.is_restricted());
        assert!(!list.permits("127.0.0.1".parse().unwrap()));
    }

    #[test]
    fn test_ipv4_mapped_peer() {
        let list = AllowList::parse("127.0.0.1");
        assert!(list.permits("::ffff:127.0.0.1".parse().unwrap()));
    }
}
