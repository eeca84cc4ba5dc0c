//! IP access control with CIDR support
//!
//! Evaluates a source address against an allow/deny policy. Entries may be
//! single IPv4/IPv6 addresses or CIDR ranges. IPv6-mapped IPv4 addresses
//! (`::ffff:a.b.c.d`) are normalized to their IPv4 form before comparison.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::str::FromStr;
use thiserror::Error;

/// Policy mode.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FilterMode {
    /// Every address passes
    #[default]
    All,
    /// Pass iff the address matches an allow entry
    Allowlist,
    /// Reject iff the address matches a deny entry
    Denylist,
}

/// Outcome of a policy check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    Denied(String),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed)
    }
}

/// IP filter errors
#[derive(Debug, Clone, Error, PartialEq)]
pub enum IpFilterError {
    #[error("invalid IP address: {0}")]
    InvalidIpAddress(String),

    #[error("invalid CIDR notation: {0}")]
    InvalidCidr(String),
}

/// Represents an IP network (CIDR)
#[derive(Debug, Clone, PartialEq)]
struct IpNetwork {
    addr: IpAddr,
    prefix_len: u8,
}

impl IpNetwork {
    /// Parse a CIDR string like "192.168.0.0/16" or a single IP like "192.168.1.1"
    fn parse(s: &str) -> Result<Self, IpFilterError> {
        if let Some((ip_str, prefix_str)) = s.split_once('/') {
            let addr = IpAddr::from_str(ip_str)
                .map_err(|_| IpFilterError::InvalidIpAddress(s.to_string()))?;
            let prefix_len = prefix_str
                .parse::<u8>()
                .map_err(|_| IpFilterError::InvalidCidr(s.to_string()))?;

            let max_prefix = match addr {
                IpAddr::V4(_) => 32,
                IpAddr::V6(_) => 128,
            };
            if prefix_len > max_prefix {
                return Err(IpFilterError::InvalidCidr(s.to_string()));
            }

            Ok(Self { addr, prefix_len })
        } else {
            // Single address, treated as /32 or /128
            let addr =
                IpAddr::from_str(s).map_err(|_| IpFilterError::InvalidIpAddress(s.to_string()))?;
            let prefix_len = match addr {
                IpAddr::V4(_) => 32,
                IpAddr::V6(_) => 128,
            };
            Ok(Self { addr, prefix_len })
        }
    }

    /// Bitwise prefix comparison against a (pre-normalized) address.
    fn contains(&self, ip: &IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(net_ip), IpAddr::V4(test_ip)) => {
                if self.prefix_len == 0 {
                    return true;
                }
                let net_bits = u32::from(net_ip);
                let test_bits = u32::from(*test_ip);
                let mask = !0u32 << (32 - self.prefix_len);
                (net_bits & mask) == (test_bits & mask)
            }
            (IpAddr::V6(net_ip), IpAddr::V6(test_ip)) => {
                if self.prefix_len == 0 {
                    return true;
                }
                let net_bits = u128::from(net_ip);
                let test_bits = u128::from(*test_ip);
                let mask = !0u128 << (128 - self.prefix_len);
                (net_bits & mask) == (test_bits & mask)
            }
            _ => false,
        }
    }
}

/// Collapse IPv6-mapped IPv4 addresses to their IPv4 form.
pub fn normalize_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
        IpAddr::V4(_) => ip,
    }
}

/// Access policy combining a mode with allow and deny rule sets.
#[derive(Debug, Clone, Default)]
pub struct IpAccessPolicy {
    mode: FilterMode,
    allow_entries: Vec<String>,
    deny_entries: Vec<String>,
    allow: Vec<IpNetwork>,
    deny: Vec<IpNetwork>,
}

impl IpAccessPolicy {
    /// Pass-everything policy.
    pub fn allow_all() -> Self {
        Self::default()
    }

    /// Build a policy from its configured mode and rule lists.
    ///
    /// Both lists are parsed eagerly so an invalid entry fails construction
    /// instead of silently never matching.
    pub fn new(
        mode: FilterMode,
        allow_entries: Vec<String>,
        deny_entries: Vec<String>,
    ) -> Result<Self, IpFilterError> {
        let allow = allow_entries
            .iter()
            .map(|e| IpNetwork::parse(e))
            .collect::<Result<Vec<_>, _>>()?;
        let deny = deny_entries
            .iter()
            .map(|e| IpNetwork::parse(e))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            mode,
            allow_entries,
            deny_entries,
            allow,
            deny,
        })
    }

    /// Evaluate an address against the policy.
    pub fn check(&self, ip: IpAddr) -> Decision {
        let ip = normalize_ip(ip);
        match self.mode {
            FilterMode::All => Decision::Allowed,
            FilterMode::Allowlist => {
                if self.allow.iter().any(|net| net.contains(&ip)) {
                    Decision::Allowed
                } else {
                    Decision::Denied(format!("{} is not in the allow list", ip))
                }
            }
            FilterMode::Denylist => {
                if self.deny.iter().any(|net| net.contains(&ip)) {
                    Decision::Denied(format!("{} is in the deny list", ip))
                } else {
                    Decision::Allowed
                }
            }
        }
    }

    /// Evaluate a textual address. An unparseable address cannot match an
    /// allow entry, so allowlist mode fails closed; denylist mode passes it
    /// because it matches no deny entry either.
    pub fn check_str(&self, ip: &str) -> Decision {
        match IpAddr::from_str(ip) {
            Ok(addr) => self.check(addr),
            Err(_) if self.mode == FilterMode::Allowlist => {
                Decision::Denied(format!("unparseable client address: {}", ip))
            }
            Err(_) => Decision::Allowed,
        }
    }

    pub fn mode(&self) -> FilterMode {
        self.mode
    }

    pub fn allow_entries(&self) -> &[String] {
        &self.allow_entries
    }

    pub fn deny_entries(&self) -> &[String] {
        &self.deny_entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn ip(s: &str) -> IpAddr {
        IpAddr::from_str(s).unwrap()
    }

    #[test]
    fn test_all_mode_passes_everything() {
        let policy = IpAccessPolicy::allow_all();
        assert!(policy.check(ip("192.168.1.100")).is_allowed());
        assert!(policy.check(ip("::1")).is_allowed());
        assert!(policy.check_str("unknown").is_allowed());
    }

    #[test]
    fn test_allowlist_single_ip() {
        let policy = IpAccessPolicy::new(
            FilterMode::Allowlist,
            vec!["192.168.1.100".to_string()],
            vec![],
        )
        .unwrap();

        assert!(policy.check(ip("192.168.1.100")).is_allowed());
        assert!(!policy.check(ip("192.168.1.101")).is_allowed());
        assert!(!policy.check(ip("10.0.0.1")).is_allowed());
    }

    #[test]
    fn test_allowlist_cidr() {
        let policy = IpAccessPolicy::new(
            FilterMode::Allowlist,
            vec!["10.0.0.0/8".to_string(), "192.168.1.0/24".to_string()],
            vec![],
        )
        .unwrap();

        assert!(policy.check(ip("10.255.255.255")).is_allowed());
        assert!(policy.check(ip("192.168.1.7")).is_allowed());
        assert!(!policy.check(ip("192.168.2.7")).is_allowed());
        assert!(!policy.check(ip("11.0.0.1")).is_allowed());
    }

    #[test]
    fn test_denylist_cidr() {
        let policy = IpAccessPolicy::new(
            FilterMode::Denylist,
            vec![],
            vec!["203.0.113.0/24".to_string()],
        )
        .unwrap();

        match policy.check(ip("203.0.113.7")) {
            Decision::Denied(reason) => assert!(reason.contains("deny list")),
            Decision::Allowed => panic!("expected denial"),
        }
        assert!(policy.check(ip("203.0.114.7")).is_allowed());
    }

    #[test]
    fn test_ipv6_mapped_ipv4_normalization() {
        let policy = IpAccessPolicy::new(
            FilterMode::Allowlist,
            vec!["10.0.0.0/8".to_string()],
            vec![],
        )
        .unwrap();

        // ::ffff:10.0.0.1 matches an IPv4 CIDR entry after normalization
        assert!(policy.check(ip("::ffff:10.0.0.1")).is_allowed());
        assert!(!policy.check(ip("::ffff:11.0.0.1")).is_allowed());

        let deny = IpAccessPolicy::new(
            FilterMode::Denylist,
            vec![],
            vec!["203.0.113.0/24".to_string()],
        )
        .unwrap();
        assert!(!deny.check(ip("::ffff:203.0.113.9")).is_allowed());
    }

    #[test]
    fn test_plain_ipv6_not_collapsed() {
        let v6 = Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1);
        assert_eq!(normalize_ip(IpAddr::V6(v6)), IpAddr::V6(v6));
        assert_eq!(
            normalize_ip(ip("::ffff:1.2.3.4")),
            IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4))
        );
    }

    #[test]
    fn test_ipv6_cidr() {
        let policy = IpAccessPolicy::new(
            FilterMode::Allowlist,
            vec!["2001:db8::/32".to_string()],
            vec![],
        )
        .unwrap();

        assert!(policy.check(ip("2001:db8::1")).is_allowed());
        assert!(policy
            .check(ip("2001:db8:ffff:ffff::1"))
            .is_allowed());
        assert!(!policy.check(ip("2001:db9::1")).is_allowed());
    }

    #[test]
    fn test_zero_prefix_matches_family() {
        let policy = IpAccessPolicy::new(
            FilterMode::Allowlist,
            vec!["0.0.0.0/0".to_string()],
            vec![],
        )
        .unwrap();

        assert!(policy.check(ip("8.8.8.8")).is_allowed());
        // IPv6 is a different family
        assert!(!policy.check(ip("2001:db8::1")).is_allowed());
    }

    #[test]
    fn test_invalid_entries_fail_construction() {
        assert!(matches!(
            IpAccessPolicy::new(FilterMode::Allowlist, vec!["not-an-ip".to_string()], vec![]),
            Err(IpFilterError::InvalidIpAddress(_))
        ));
        assert!(matches!(
            IpAccessPolicy::new(
                FilterMode::Allowlist,
                vec!["192.168.1.0/33".to_string()],
                vec![]
            ),
            Err(IpFilterError::InvalidCidr(_))
        ));
        assert!(matches!(
            IpAccessPolicy::new(
                FilterMode::Denylist,
                vec![],
                vec!["10.0.0.0/abc".to_string()]
            ),
            Err(IpFilterError::InvalidCidr(_))
        ));
    }

    #[test]
    fn test_unparseable_client_address() {
        let allow =
            IpAccessPolicy::new(FilterMode::Allowlist, vec!["10.0.0.1".to_string()], vec![])
                .unwrap();
        assert!(!allow.check_str("unknown").is_allowed());

        let deny =
            IpAccessPolicy::new(FilterMode::Denylist, vec![], vec!["10.0.0.1".to_string()])
                .unwrap();
        assert!(deny.check_str("unknown").is_allowed());
    }
}
