//! Subdomain and public-port selection
//!
//! Pure selection logic; the registry calls into it inside its critical
//! section so that picking a name or port and publishing it are one atomic
//! step from the point of view of concurrent sessions.

use crate::config::PortRange;
use rand::Rng;
use thiserror::Error;

/// Allocation errors, reported to the agent via `tunnel_response`.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum AllocError {
    #[error("subdomain '{0}' is in use")]
    SubdomainInUse(String),

    #[error("invalid subdomain '{0}'")]
    InvalidSubdomain(String),

    #[error("port {0} is in use")]
    PortInUse(u16),

    #[error("port {port} is outside the configured range {min}-{max}")]
    PortOutOfRange { port: u16, min: u16, max: u16 },

    #[error("no ports available in the configured range")]
    NoPortsAvailable,
}

const ADJECTIVES: &[&str] = &[
    "amber", "bold", "brave", "calm", "clever", "crisp", "eager", "fancy", "fuzzy", "gentle",
    "happy", "jolly", "keen", "lively", "lucky", "mellow", "nimble", "proud", "quiet", "rapid",
    "shiny", "swift", "tidy", "witty",
];

const NOUNS: &[&str] = &[
    "badger", "beacon", "canyon", "comet", "falcon", "garden", "harbor", "island", "lantern",
    "meadow", "nebula", "otter", "panda", "pebble", "pine", "raven", "river", "sparrow", "summit",
    "thicket", "tiger", "valley", "walrus", "willow",
];

/// Generate a memorable `<adj>-<noun>-<0..999>` name.
pub fn generate_subdomain() -> String {
    let mut rng = rand::thread_rng();
    format!(
        "{}-{}-{}",
        ADJECTIVES[rng.gen_range(0..ADJECTIVES.len())],
        NOUNS[rng.gen_range(0..NOUNS.len())],
        rng.gen_range(0..1000u32)
    )
}

/// Validate an agent-requested subdomain as a single lowercase DNS label.
pub fn validate_subdomain(name: &str) -> Result<(), AllocError> {
    let valid_len = !name.is_empty() && name.len() <= 63;
    let valid_chars = name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    let valid_edges = !name.starts_with('-') && !name.ends_with('-');

    if valid_len && valid_chars && valid_edges {
        Ok(())
    } else {
        Err(AllocError::InvalidSubdomain(name.to_string()))
    }
}

/// Pick a public port for a TCP tunnel.
///
/// Preference order:
/// 1. the agent's `remote_port`, which must be free and inside the range
///    (an out-of-range request is rejected rather than silently remapped);
/// 2. the tunnel's `local_port` when it falls inside the range and is free,
///    which keeps `psql -p 15432`-style dev workflows obvious;
/// 3. the first free port scanning up from `min`.
pub fn select_port(
    range: PortRange,
    is_used: impl Fn(u16) -> bool,
    remote_port: Option<u16>,
    local_port: u16,
) -> Result<u16, AllocError> {
    if let Some(requested) = remote_port {
        if !range.contains(requested) {
            return Err(AllocError::PortOutOfRange {
                port: requested,
                min: range.min,
                max: range.max,
            });
        }
        if is_used(requested) {
            return Err(AllocError::PortInUse(requested));
        }
        return Ok(requested);
    }

    if range.contains(local_port) && !is_used(local_port) {
        return Ok(local_port);
    }

    (range.min..=range.max)
        .find(|port| !is_used(*port))
        .ok_or(AllocError::NoPortsAvailable)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn range() -> PortRange {
        PortRange {
            min: 10_000,
            max: 10_005,
        }
    }

    #[test]
    fn test_generated_names_have_three_tokens() {
        for _ in 0..100 {
            let name = generate_subdomain();
            let parts: Vec<&str> = name.split('-').collect();
            assert_eq!(parts.len(), 3, "unexpected name {}", name);
            assert!(ADJECTIVES.contains(&parts[0]));
            assert!(NOUNS.contains(&parts[1]));
            assert!(parts[2].parse::<u32>().unwrap() < 1000);
            validate_subdomain(&name).unwrap();
        }
    }

    #[test]
    fn test_validate_subdomain() {
        assert!(validate_subdomain("web").is_ok());
        assert!(validate_subdomain("my-app-2").is_ok());
        assert!(validate_subdomain("").is_err());
        assert!(validate_subdomain("-web").is_err());
        assert!(validate_subdomain("web-").is_err());
        assert!(validate_subdomain("Web").is_err());
        assert!(validate_subdomain("a.b").is_err());
        assert!(validate_subdomain(&"x".repeat(64)).is_err());
    }

    #[test]
    fn test_requested_port_honored() {
        let used: HashSet<u16> = HashSet::new();
        let port = select_port(range(), |p| used.contains(&p), Some(10_003), 3000).unwrap();
        assert_eq!(port, 10_003);
    }

    #[test]
    fn test_requested_port_busy() {
        let used: HashSet<u16> = [10_003].into_iter().collect();
        let err = select_port(range(), |p| used.contains(&p), Some(10_003), 3000).unwrap_err();
        assert_eq!(err, AllocError::PortInUse(10_003));
    }

    #[test]
    fn test_requested_port_out_of_range_rejected() {
        let err = select_port(range(), |_| false, Some(9_999), 3000).unwrap_err();
        assert!(matches!(err, AllocError::PortOutOfRange { port: 9_999, .. }));
    }

    #[test]
    fn test_range_bounds_are_allocatable() {
        assert_eq!(
            select_port(range(), |_| false, Some(10_000), 3000).unwrap(),
            10_000
        );
        assert_eq!(
            select_port(range(), |_| false, Some(10_005), 3000).unwrap(),
            10_005
        );
    }

    #[test]
    fn test_local_port_heuristic() {
        let used: HashSet<u16> = HashSet::new();
        let port = select_port(range(), |p| used.contains(&p), None, 10_002).unwrap();
        assert_eq!(port, 10_002);

        // Busy local port falls through to the scan
        let used: HashSet<u16> = [10_002].into_iter().collect();
        let port = select_port(range(), |p| used.contains(&p), None, 10_002).unwrap();
        assert_eq!(port, 10_000);
    }

    #[test]
    fn test_local_port_outside_range_scans_from_min() {
        let port = select_port(range(), |_| false, None, 5432).unwrap();
        assert_eq!(port, 10_000);
    }

    #[test]
    fn test_pool_exhaustion() {
        let err = select_port(range(), |_| true, None, 3000).unwrap_err();
        assert_eq!(err, AllocError::NoPortsAvailable);
    }
}
