//! TOML configuration for the server, with EPICS-style environment overrides.
//!
//! ```toml
//! [server]
//! port = 5064
//! log_level = "info"
//!
//! [network]
//! auto_addr_mode = "YES"
//! ignore_addresses = ["10.0.0.99"]
//!
//! [[network.interfaces]]
//! address = "10.0.0.5"
//! broadcast = "10.0.0.255"
//!
//! [beacon]
//! port = 5065
//! period_secs = 15.0
//! addresses = ["10.0.1.255"]
//!
//! [limits]
//! max_array_bytes = 16384
//! ```
//!
//! Every field has a default, so an absent file or an empty section works.
//!
//! # Environment overrides (for beginners)
//!
//! Control-system sites configure servers through environment variables such
//! as `EPICS_CA_SERVER_PORT`.  [`ServerConfig::apply_env`] lays them over the
//! file.  When both a server-specific (`EPICS_CAS_*`) and a general
//! (`EPICS_CA_*`) variable exist, the server-specific one wins.  The lookup
//! function is injected so tests never touch the process environment.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use pv_core::domain::address_policy::{limited_broadcast, parse_address_list, AddressParseError};
use pv_core::protocol::{DEFAULT_BEACON_PORT, DEFAULT_SERVER_PORT, MAX_TCP};
use pv_core::{FamilyMode, FamilyPolicy, IgnoreList};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::application::context::{ContextSettings, DEFAULT_BACKLOG_LIMIT};
use crate::application::registry::RegistryLimits;

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error(transparent)]
    Address(#[from] AddressParseError),

    /// An environment variable holds a value of the wrong kind.
    #[error("invalid value '{value}' for {name}")]
    InvalidValue { name: &'static str, value: String },
}

// ── Config schema types ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub network: NetworkSection,
    #[serde(default)]
    pub beacon: BeaconSection,
    #[serde(default)]
    pub limits: LimitsSection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerSection {
    /// TCP and UDP port clients search and connect on.
    #[serde(default = "default_server_port")]
    pub port: u16,
    /// `tracing` filter used when `RUST_LOG` is not set.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Outbound bytes queued on a session before updates are coalesced.
    #[serde(default = "default_backlog_limit")]
    pub backlog_limit: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NetworkSection {
    /// General automatic-address mode: `NO`, `YES`, `4`, `6` or `46`.
    #[serde(default)]
    pub auto_addr_mode: String,
    /// Interfaces to serve; empty means every IPv4 interface.
    #[serde(default)]
    pub interfaces: Vec<InterfaceConfig>,
    /// Discovery sources to ignore; an entry without port ignores the host.
    #[serde(default)]
    pub ignore_addresses: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InterfaceConfig {
    pub address: String,
    /// Broadcast address of the interface's subnet, served by an extra
    /// UDP socket.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broadcast: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BeaconSection {
    #[serde(default = "default_beacon_port")]
    pub port: u16,
    /// Steady-state beacon period in seconds.
    #[serde(default = "default_beacon_period")]
    pub period_secs: f64,
    /// Explicit beacon destinations.
    #[serde(default)]
    pub addresses: Vec<String>,
    /// Beacon-specific automatic-address mode; also widens the families
    /// discovery answers.
    #[serde(default)]
    pub auto_addr_mode: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LimitsSection {
    /// Largest array payload served; never below 16384.
    #[serde(default = "default_max_array_bytes")]
    pub max_array_bytes: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_channels: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_events: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_put_notify: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_buffers: Option<usize>,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_server_port() -> u16 {
    DEFAULT_SERVER_PORT
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_backlog_limit() -> usize {
    DEFAULT_BACKLOG_LIMIT
}
fn default_beacon_port() -> u16 {
    DEFAULT_BEACON_PORT
}
fn default_beacon_period() -> f64 {
    15.0
}
fn default_max_array_bytes() -> usize {
    MAX_TCP
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: default_server_port(),
            log_level: default_log_level(),
            backlog_limit: default_backlog_limit(),
        }
    }
}

impl Default for BeaconSection {
    fn default() -> Self {
        Self {
            port: default_beacon_port(),
            period_secs: default_beacon_period(),
            addresses: Vec::new(),
            auto_addr_mode: String::new(),
        }
    }
}

impl Default for LimitsSection {
    fn default() -> Self {
        Self {
            max_array_bytes: default_max_array_bytes(),
            max_channels: None,
            max_events: None,
            max_put_notify: None,
            max_buffers: None,
        }
    }
}

// ── Loading ───────────────────────────────────────────────────────────────────

/// Loads the config at `path`, returning the defaults if the file does not
/// exist.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config(path: &Path) -> Result<ServerConfig, ConfigError> {
    let mut cfg = match std::fs::read_to_string(path) {
        Ok(content) => toml::from_str::<ServerConfig>(&content)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => ServerConfig::default(),
        Err(e) => {
            return Err(ConfigError::Io {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };
    cfg.normalise();
    Ok(cfg)
}

/// Reads `primary`, falling back to `fallback`.  Empty values count as unset.
fn lookup_either(
    lookup: &impl Fn(&str) -> Option<String>,
    primary: &str,
    fallback: Option<&str>,
) -> Option<String> {
    let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
    get(primary).or_else(|| fallback.and_then(get))
}

fn parse_value<T: std::str::FromStr>(name: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue { name, value })
}

fn split_list(value: &str) -> Vec<String> {
    value.split_whitespace().map(str::to_string).collect()
}

impl ServerConfig {
    /// Overlays the EPICS environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] for a port or size that does not
    /// parse.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(v) = lookup_either(&lookup, "EPICS_CAS_SERVER_PORT", Some("EPICS_CA_SERVER_PORT")) {
            self.server.port = parse_value("EPICS_CAS_SERVER_PORT", v)?;
        }
        if let Some(v) = lookup_either(&lookup, "EPICS_CAS_BEACON_PORT", Some("EPICS_CA_REPEATER_PORT")) {
            self.beacon.port = parse_value("EPICS_CAS_BEACON_PORT", v)?;
        }
        if let Some(v) = lookup_either(&lookup, "EPICS_CAS_BEACON_PERIOD", Some("EPICS_CA_BEACON_PERIOD")) {
            match v.trim().parse::<f64>() {
                Ok(secs) if secs > 0.0 && secs.is_finite() => self.beacon.period_secs = secs,
                _ => warn!(
                    "beacon period '{v}' is not a positive number, using {} s",
                    self.beacon.period_secs
                ),
            }
        }
        if let Some(v) = lookup_either(&lookup, "EPICS_CA_AUTO_ADDR_LIST", None) {
            self.network.auto_addr_mode = v.trim().to_string();
        }
        if let Some(v) = lookup_either(&lookup, "EPICS_CAS_AUTO_BEACON_ADDR_LIST", None) {
            self.beacon.auto_addr_mode = v.trim().to_string();
        }
        if let Some(v) = lookup_either(&lookup, "EPICS_CAS_INTF_ADDR_LIST", None) {
            self.network.interfaces = split_list(&v)
                .into_iter()
                .map(|address| InterfaceConfig {
                    address,
                    broadcast: None,
                })
                .collect();
        }
        if let Some(v) = lookup_either(&lookup, "EPICS_CAS_BEACON_ADDR_LIST", Some("EPICS_CA_ADDR_LIST")) {
            self.beacon.addresses = split_list(&v);
        }
        if let Some(v) = lookup_either(&lookup, "EPICS_CAS_IGNORE_ADDR_LIST", None) {
            self.network.ignore_addresses = split_list(&v);
        }
        if let Some(v) = lookup_either(&lookup, "EPICS_CA_MAX_ARRAY_BYTES", None) {
            self.limits.max_array_bytes = parse_value("EPICS_CA_MAX_ARRAY_BYTES", v)?;
        }
        self.normalise();
        Ok(())
    }

    /// Raises values below their floor.
    pub fn normalise(&mut self) {
        if self.limits.max_array_bytes < MAX_TCP {
            warn!(
                "max array bytes {} raised to the minimum of {MAX_TCP}",
                self.limits.max_array_bytes
            );
            self.limits.max_array_bytes = MAX_TCP;
        }
        if !(self.beacon.period_secs > 0.0 && self.beacon.period_secs.is_finite()) {
            warn!("beacon period {} s invalid, using 15 s", self.beacon.period_secs);
            self.beacon.period_secs = default_beacon_period();
        }
    }

    // ── Derived settings ──────────────────────────────────────────────────────

    pub fn family_policy(&self) -> FamilyPolicy {
        FamilyPolicy::from_modes(
            FamilyMode::parse(&self.network.auto_addr_mode),
            FamilyMode::parse(&self.beacon.auto_addr_mode),
        )
    }

    pub fn beacon_period(&self) -> Duration {
        Duration::from_secs_f64(self.beacon.period_secs)
    }

    /// Interfaces to serve, the IPv4 wildcard when none are configured.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Address`] for an entry that is not an IP literal.
    pub fn interfaces(&self) -> Result<Vec<InterfaceAddr>, ConfigError> {
        if self.network.interfaces.is_empty() {
            return Ok(vec![InterfaceAddr {
                ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                broadcast: None,
            }]);
        }
        self.network
            .interfaces
            .iter()
            .map(|intf| -> Result<InterfaceAddr, ConfigError> {
                let ip = intf
                    .address
                    .trim()
                    .parse::<IpAddr>()
                    .map_err(|_| AddressParseError(intf.address.clone()))?;
                let broadcast = intf
                    .broadcast
                    .as_deref()
                    .map(|b| b.trim().parse::<IpAddr>().map_err(|_| AddressParseError(b.to_string())))
                    .transpose()?;
                Ok(InterfaceAddr { ip, broadcast })
            })
            .collect()
    }

    /// Beacon destinations: the explicit list plus, unless automatic
    /// addressing is off, the interface broadcast addresses (or the limited
    /// broadcast address when none are known).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Address`] for a malformed entry.
    pub fn beacon_addresses(&self) -> Result<Vec<SocketAddr>, ConfigError> {
        let port = self.beacon.port;
        let mut out = parse_address_list(&self.beacon.addresses.join(" "), port)?;
        let mode = match FamilyMode::parse(&self.beacon.auto_addr_mode) {
            FamilyMode::Unset => FamilyMode::parse(&self.network.auto_addr_mode),
            mode => mode,
        };
        if mode != FamilyMode::No {
            let broadcasts: Vec<SocketAddr> = self
                .interfaces()?
                .iter()
                .filter_map(|intf| intf.broadcast)
                .map(|ip| SocketAddr::new(ip, port))
                .collect();
            if broadcasts.is_empty() {
                out.push(limited_broadcast(port));
            } else {
                out.extend(broadcasts);
            }
        }
        let mut unique = Vec::with_capacity(out.len());
        for addr in out {
            if !unique.contains(&addr) {
                unique.push(addr);
            }
        }
        Ok(unique)
    }

    /// # Errors
    ///
    /// Returns [`ConfigError::Address`] for a malformed entry.
    pub fn ignore_list(&self) -> Result<IgnoreList, ConfigError> {
        Ok(IgnoreList::new(parse_address_list(
            &self.network.ignore_addresses.join(" "),
            0,
        )?))
    }

    pub fn context_settings(&self) -> ContextSettings {
        ContextSettings {
            limits: RegistryLimits {
                max_channels: self.limits.max_channels,
                max_events: self.limits.max_events,
                max_put_notify: self.limits.max_put_notify,
                max_buffers: self.limits.max_buffers,
                max_array_bytes: self.limits.max_array_bytes,
            },
            backlog_limit: self.server.backlog_limit,
            ..ContextSettings::default()
        }
    }
}

/// One resolved interface entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceAddr {
    pub ip: IpAddr,
    pub broadcast: Option<IpAddr>,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
