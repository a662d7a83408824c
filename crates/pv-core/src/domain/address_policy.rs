//! Address-family acceptance for discovery traffic and address-list parsing.
//!
//! Two settings decide which address families the discovery service answers:
//! the general automatic-address mode and the beacon-specific one.  The
//! beacon setting can only add a family, never remove one:
//!
//! ```text
//!                    beacon mode
//! general mode | NO     '',4,YES   6     46
//! -------------+---------------------------
//!     NO       | 4      4          46    46
//!     YES      | 4      4          46    46
//!     4        | 4      4          46    46
//!     6        | 6      46         6     46
//!     46       | 46     46         46    46
//! ```

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// A parsed automatic-address setting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FamilyMode {
    /// Setting absent or empty.
    #[default]
    Unset,
    No,
    Yes,
    V4,
    V6,
    Both,
}

impl FamilyMode {
    /// Parses a setting value.  Unrecognised values behave like an unset one.
    pub fn parse(value: &str) -> FamilyMode {
        match value.trim() {
            "NO" | "no" | "No" => FamilyMode::No,
            "YES" | "yes" | "Yes" => FamilyMode::Yes,
            "4" => FamilyMode::V4,
            "6" => FamilyMode::V6,
            "46" => FamilyMode::Both,
            "" => FamilyMode::Unset,
            other => {
                debug!("address family mode '{other}' not recognised, treated as unset");
                FamilyMode::Unset
            }
        }
    }
}

/// Which families the discovery service accepts datagrams from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FamilyPolicy {
    pub accept_v4: bool,
    pub accept_v6: bool,
}

impl FamilyPolicy {
    /// Combines the general and beacon-specific modes.
    pub fn from_modes(general: FamilyMode, beacon: FamilyMode) -> FamilyPolicy {
        let (mut accept_v4, mut accept_v6) = match general {
            FamilyMode::V6 => (false, true),
            FamilyMode::Both => (true, true),
            FamilyMode::Unset | FamilyMode::No | FamilyMode::Yes | FamilyMode::V4 => (true, false),
        };
        match beacon {
            FamilyMode::No => {}
            FamilyMode::V6 => accept_v6 = true,
            FamilyMode::Both => {
                accept_v4 = true;
                accept_v6 = true;
            }
            FamilyMode::Unset | FamilyMode::Yes | FamilyMode::V4 => accept_v4 = true,
        }
        FamilyPolicy {
            accept_v4,
            accept_v6,
        }
    }

    /// Whether a datagram from `source` is answered.  A v4-mapped IPv6
    /// source is judged as IPv4.
    pub fn accepts(&self, source: &SocketAddr) -> bool {
        match source.ip() {
            IpAddr::V4(_) => self.accept_v4,
            IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
                Some(_) => self.accept_v4,
                None => self.accept_v6,
            },
        }
    }

    /// Short form used in reports, e.g. `"46"`.
    pub fn label(&self) -> &'static str {
        match (self.accept_v4, self.accept_v6) {
            (true, true) => "46",
            (true, false) => "4",
            (false, true) => "6",
            (false, false) => "none",
        }
    }
}

// ── Ignore list ───────────────────────────────────────────────────────────────

/// Sources whose discovery datagrams are dropped unread.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IgnoreList {
    entries: Vec<SocketAddr>,
}

impl IgnoreList {
    pub fn new(entries: Vec<SocketAddr>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[SocketAddr] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether `source` matches an entry: same host and, unless the entry's
    /// port is 0, the same port.
    pub fn is_ignored(&self, source: &SocketAddr) -> bool {
        let host = canonical_ip(source.ip());
        self.entries.iter().any(|entry| {
            canonical_ip(entry.ip()) == host && (entry.port() == 0 || entry.port() == source.port())
        })
    }
}

fn canonical_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(IpAddr::V6(v6)),
        v4 => v4,
    }
}

// ── Address lists ─────────────────────────────────────────────────────────────

/// An entry of an address list that is not an IP literal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid address list entry '{0}'")]
pub struct AddressParseError(pub String);

/// Parses a whitespace-separated list of `host`, `host:port`, bare IPv6 or
/// `[v6]:port` entries.  Entries without a port get `default_port`.
///
/// # Errors
///
/// Returns [`AddressParseError`] naming the first entry that is not an IP
/// literal.
///
/// # Examples
///
/// ```rust
/// use pv_core::domain::address_policy::parse_address_list;
///
/// let list = parse_address_list("10.0.0.255 10.1.0.1:6000 ::1", 5065).unwrap();
/// assert_eq!(list[0].port(), 5065);
/// assert_eq!(list[1].port(), 6000);
/// assert!(list[2].is_ipv6());
/// ```
pub fn parse_address_list(list: &str, default_port: u16) -> Result<Vec<SocketAddr>, AddressParseError> {
    list.split_whitespace()
        .map(|entry| parse_address(entry, default_port))
        .collect()
}

fn parse_address(entry: &str, default_port: u16) -> Result<SocketAddr, AddressParseError> {
    if let Ok(addr) = entry.parse::<SocketAddr>() {
        return Ok(addr);
    }
    if let Ok(ip) = entry.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, default_port));
    }
    Err(AddressParseError(entry.to_string()))
}

/// The IPv4 limited-broadcast destination on `port`.
pub fn limited_broadcast(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), port)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(general: &str, beacon: &str) -> &'static str {
        FamilyPolicy::from_modes(FamilyMode::parse(general), FamilyMode::parse(beacon)).label()
    }

    #[test]
    fn test_combination_table_is_preserved() {
        let beacon_columns = ["NO", "", "4", "YES", "6", "46"];
        let rows: [(&str, [&str; 6]); 5] = [
            ("NO", ["4", "4", "4", "4", "46", "46"]),
            ("YES", ["4", "4", "4", "4", "46", "46"]),
            ("4", ["4", "4", "4", "4", "46", "46"]),
            ("6", ["6", "46", "46", "46", "6", "46"]),
            ("46", ["46", "46", "46", "46", "46", "46"]),
        ];
        for (general, expected) in rows {
            for (beacon, want) in beacon_columns.iter().zip(expected) {
                assert_eq!(
                    policy(general, beacon),
                    want,
                    "general={general} beacon={beacon}"
                );
            }
        }
    }

    #[test]
    fn test_beacon_mode_never_removes_a_family() {
        assert!(FamilyPolicy::from_modes(FamilyMode::Both, FamilyMode::No).accept_v4);
        assert!(FamilyPolicy::from_modes(FamilyMode::V6, FamilyMode::No).accept_v6);
    }

    #[test]
    fn test_v4_mapped_source_follows_ipv4_rule() {
        // Arrange
        let v6_only = FamilyPolicy {
            accept_v4: false,
            accept_v6: true,
        };
        let mapped: SocketAddr = "[::ffff:10.0.0.1]:5064".parse().unwrap();
        let native: SocketAddr = "[fe80::1]:5064".parse().unwrap();
        let v4: SocketAddr = "10.0.0.1:5064".parse().unwrap();

        // Act / Assert
        assert!(!v6_only.accepts(&mapped));
        assert!(!v6_only.accepts(&v4));
        assert!(v6_only.accepts(&native));
    }

    #[test]
    fn test_ignore_list_matches_host_and_port() {
        // Arrange
        let list = IgnoreList::new(vec![
            "10.0.0.9:6000".parse().unwrap(),
            "10.0.0.7:0".parse().unwrap(),
        ]);

        // Act / Assert
        assert!(list.is_ignored(&"10.0.0.9:6000".parse().unwrap()));
        assert!(!list.is_ignored(&"10.0.0.9:6001".parse().unwrap()));
        assert!(list.is_ignored(&"10.0.0.7:1234".parse().unwrap()));
        assert!(list.is_ignored(&"[::ffff:10.0.0.7]:1234".parse().unwrap()));
        assert!(!list.is_ignored(&"10.0.0.8:6000".parse().unwrap()));
    }

    #[test]
    fn test_address_list_rejects_hostnames() {
        assert_eq!(
            parse_address_list("10.0.0.1 ioc.example", 5065),
            Err(AddressParseError("ioc.example".into()))
        );
    }

    #[test]
    fn test_empty_address_list_is_empty() {
        assert!(parse_address_list("   ", 5065).unwrap().is_empty());
    }
}
