use crate::error::{GatewayError, Result};
use std::net::IpAddr;
use std::str::FromStr;

/// An IP address or CIDR range
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IpRange {
    Single(IpAddr),
    Cidr { network: IpAddr, prefix_len: u8 },
}

impl IpRange {
    /// Parse an IP or CIDR string into an IpRange
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Some((network_str, prefix_str)) = s.split_once('/') {
            let network = IpAddr::from_str(network_str).map_err(|e| {
                GatewayError::Config(format!("Invalid IP address in CIDR '{}': {}", s, e))
            })?;

            let prefix_len = prefix_str.parse::<u8>().map_err(|e| {
                GatewayError::Config(format!("Invalid prefix length in CIDR '{}': {}", s, e))
            })?;

            let max_prefix = match network {
                IpAddr::V4(_) => 32,
                IpAddr::V6(_) => 128,
            };
            if prefix_len > max_prefix {
                return Err(GatewayError::Config(format!(
                    "Invalid prefix length {} in '{}': must be 0-{}",
                    prefix_len, s, max_prefix
                )));
            }

            Ok(IpRange::Cidr {
                network,
                prefix_len,
            })
        } else {
            let ip = IpAddr::from_str(s)
                .map_err(|e| GatewayError::Config(format!("Invalid IP address '{}': {}", s, e)))?;
            Ok(IpRange::Single(ip))
        }
    }

    /// Check if an IP address matches this range
    pub fn contains(&self, ip: &IpAddr) -> bool {
        match self {
            IpRange::Single(range_ip) => ip == range_ip,
            IpRange::Cidr {
                network,
                prefix_len,
            } => match (network, ip) {
                (IpAddr::V4(net), IpAddr::V4(addr)) => {
                    let mask = if *prefix_len == 0 {
                        0
                    } else {
                        !0u32 << (32 - prefix_len)
                    };
                    (u32::from(*net) & mask) == (u32::from(*addr) & mask)
                }
                (IpAddr::V6(net), IpAddr::V6(addr)) => {
                    let mask = if *prefix_len == 0 {
                        0
                    } else {
                        !0u128 << (128 - prefix_len)
                    };
                    (u128::from(*net) & mask) == (u128::from(*addr) & mask)
                }
                _ => false,
            },
        }
    }
}

/// Addresses that skip threat screening entirely.
///
/// Loopback addresses are always on the list.
#[derive(Debug, Clone, Default)]
pub struct IpAllowList {
    ranges: Vec<IpRange>,
}

impl IpAllowList {
    pub fn new(entries: &[String]) -> Result<Self> {
        let ranges = entries
            .iter()
            .filter(|entry| !entry.trim().is_empty())
            .map(|entry| IpRange::parse(entry))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { ranges })
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        is_loopback(ip) || self.contains_configured(ip)
    }

    /// Match against the configured ranges only, without implicit loopback.
    /// Used for addresses read from request headers.
    pub fn contains_configured(&self, ip: &IpAddr) -> bool {
        !is_loopback(ip) && self.ranges.iter().any(|range| range.contains(ip))
    }
}

fn is_loopback(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback(),
        IpAddr::V6(v6) => v6.is_loopback() || v6.to_ipv4_mapped().is_some_and(|v4| v4.is_loopback()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        IpAddr::from_str(s).unwrap()
    }

    #[test]
    fn test_single_ip() {
        let list = IpAllowList::new(&["192.168.1.1".to_string()]).unwrap();
        assert!(list.contains(&ip("192.168.1.1")));
        assert!(!list.contains(&ip("192.168.1.2")));
    }

    #[test]
    fn test_configured_ranges_exclude_loopback() {
        let list = IpAllowList::new(&["127.0.0.0/8".to_string(), "10.1.0.0/16".to_string()]).unwrap();
        assert!(list.contains(&ip("127.0.0.1")));
        assert!(!list.contains_configured(&ip("127.0.0.1")));
        assert!(!list.contains_configured(&ip("::1")));
        assert!(list.contains_configured(&ip("10.1.4.4")));
    }

    #[test]
    fn test_cidr_range() {
        let list = IpAllowList::new(&["10.20.0.0/16".to_string()]).unwrap();
        assert!(list.contains(&ip("10.20.1.1")));
        assert!(list.contains(&ip("10.20.255.255")));
        assert!(!list.contains(&ip("10.21.0.1")));
    }

    #[test]
    fn test_loopback_always_allowed() {
        let list = IpAllowList::default();
        assert!(list.contains(&ip("127.0.0.1")));
        assert!(list.contains(&ip("::1")));
        assert!(list.contains(&ip("::ffff:127.0.0.1")));
        assert!(!list.contains(&ip("203.0.113.5")));
    }

    #[test]
    fn test_ipv6_cidr() {
        let list = IpAllowList::new(&["2001:db8::/32".to_string()]).unwrap();
        assert!(list.contains(&ip("2001:db8::1")));
        assert!(!list.contains(&ip("2001:db9::1")));
    }

    #[test]
    fn test_invalid_entries() {
        assert!(IpAllowList::new(&["invalid-ip".to_string()]).is_err());
        assert!(IpAllowList::new(&["192.168.1.0/33".to_string()]).is_err());
    }
}
