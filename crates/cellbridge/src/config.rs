//! Bridge Configuration
//!
//! Provides the immutable tunnel configuration applied to the host
//! interface, the persisted tunnel profile, and the configuration file
//! that ties them together.

use crate::crypto::DEFAULT_MESSAGE_LIMIT;
use crate::packet::Direction;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Provider identifier used when no profile is configured
pub const DEFAULT_PROVIDER_ID: &str = "com.cellularbridge.PacketTunnelProvider";

/// Human readable profile name used when no profile is configured
pub const DEFAULT_DESCRIPTION: &str = "Cellular Bridge";

/// Server address shown for the tunnel; the bridge has no remote server
pub const DEFAULT_SERVER_ADDRESS: &str = "Cellular Bridge";

/// Smallest MTU any IPv4 host must accept
const MIN_MTU_V4: u16 = 576;

/// Smallest MTU allowed on an IPv6 link
const MIN_MTU_V6: u16 = 1280;

/// A routed prefix in CIDR notation (e.g. `0.0.0.0/0`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Route {
    /// Network address
    pub addr: IpAddr,
    /// Prefix length
    pub prefix: u8,
}

impl Route {
    /// The IPv4 default route (`0.0.0.0/0`)
    pub fn default_v4() -> Self {
        Self {
            addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            prefix: 0,
        }
    }

    /// The IPv6 default route (`::/0`)
    pub fn default_v6() -> Self {
        Self {
            addr: IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            prefix: 0,
        }
    }

    /// Is this an IPv4 route?
    pub fn is_ipv4(&self) -> bool {
        self.addr.is_ipv4()
    }
}

impl FromStr for Route {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ip, prefix) = s
            .split_once('/')
            .ok_or_else(|| ConfigError::InvalidRoute(s.to_string()))?;

        let addr: IpAddr = ip
            .parse()
            .map_err(|_| ConfigError::InvalidRoute(s.to_string()))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|_| ConfigError::InvalidRoute(s.to_string()))?;

        let max = if addr.is_ipv4() { 32 } else { 128 };
        if prefix > max {
            return Err(ConfigError::InvalidRoute(s.to_string()));
        }

        Ok(Self { addr, prefix })
    }
}

impl TryFrom<String> for Route {
    type Error = ConfigError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Route> for String {
    fn from(route: Route) -> Self {
        route.to_string()
    }
}

impl std::fmt::Display for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

/// IPv4 interface settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ipv4Settings {
    /// Local interface address
    pub address: Ipv4Addr,
    /// Prefix length of the local subnet
    pub prefix_len: u8,
    /// Routes sent through the tunnel
    #[serde(default = "default_v4_routes")]
    pub included_routes: Vec<Route>,
}

impl Ipv4Settings {
    /// Dotted subnet mask for hosts that want one (e.g. `255.255.255.0`)
    pub fn subnet_mask(&self) -> Ipv4Addr {
        let bits = match self.prefix_len {
            0 => 0,
            n if n >= 32 => u32::MAX,
            n => u32::MAX << (32 - n),
        };
        Ipv4Addr::from(bits)
    }
}

/// IPv6 interface settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ipv6Settings {
    /// Local interface address
    pub address: Ipv6Addr,
    /// Network prefix length
    pub prefix_len: u8,
    /// Routes sent through the tunnel
    #[serde(default = "default_v6_routes")]
    pub included_routes: Vec<Route>,
}

fn default_v4_routes() -> Vec<Route> {
    vec![Route::default_v4()]
}

fn default_v6_routes() -> Vec<Route> {
    vec![Route::default_v6()]
}

/// Settings applied to the host virtual interface when a session starts.
///
/// Created once and never mutated; a session owns its copy for its whole
/// lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelConfiguration {
    /// Remote end of the point-to-point tunnel
    pub remote_address: IpAddr,
    /// DNS servers pushed to the interface
    #[serde(default)]
    pub dns: Vec<IpAddr>,
    /// Interface MTU
    #[serde(default = "default_mtu")]
    pub mtu: u16,
    /// IPv4 settings
    pub ipv4: Ipv4Settings,
    /// IPv6 settings (optional)
    #[serde(default)]
    pub ipv6: Option<Ipv6Settings>,
}

fn default_mtu() -> u16 {
    1500
}

impl TunnelConfiguration {
    /// IPv4-only configuration with default routes
    pub fn ipv4(remote: Ipv4Addr, local: Ipv4Addr, prefix_len: u8) -> Self {
        Self {
            remote_address: IpAddr::V4(remote),
            ipv4: Ipv4Settings {
                address: local,
                prefix_len,
                included_routes: default_v4_routes(),
            },
            ipv6: None,
            dns: Vec::new(),
            mtu: default_mtu(),
        }
    }

    /// Replace the DNS server list
    pub fn with_dns(mut self, dns: Vec<IpAddr>) -> Self {
        self.dns = dns;
        self
    }

    /// Replace the MTU
    pub fn with_mtu(mut self, mtu: u16) -> Self {
        self.mtu = mtu;
        self
    }

    /// Add IPv6 settings with the default route
    pub fn with_ipv6(mut self, address: Ipv6Addr, prefix_len: u8) -> Self {
        self.ipv6 = Some(Ipv6Settings {
            address,
            prefix_len,
            included_routes: default_v6_routes(),
        });
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let min_mtu = if self.ipv6.is_some() { MIN_MTU_V6 } else { MIN_MTU_V4 };
        if self.mtu < min_mtu {
            return Err(ConfigError::InvalidMtu(self.mtu));
        }

        if self.ipv4.prefix_len > 32 {
            return Err(ConfigError::InvalidPrefix(self.ipv4.prefix_len));
        }
        if let Some(route) = self.ipv4.included_routes.iter().find(|r| !r.is_ipv4()) {
            return Err(ConfigError::InvalidRoute(route.to_string()));
        }

        if let Some(ref v6) = self.ipv6 {
            if v6.prefix_len > 128 {
                return Err(ConfigError::InvalidPrefix(v6.prefix_len));
            }
            if let Some(route) = v6.included_routes.iter().find(|r| r.is_ipv4()) {
                return Err(ConfigError::InvalidRoute(route.to_string()));
            }
        }

        if self.remote_address.is_unspecified() {
            return Err(ConfigError::InvalidAddress(self.remote_address.to_string()));
        }

        Ok(())
    }
}

impl Default for TunnelConfiguration {
    /// The bridge's stock interface: 192.168.1.2/24 (plus fd00::2/64)
    /// towards 192.168.1.1, Google DNS, MTU 1500.
    fn default() -> Self {
        Self::ipv4(Ipv4Addr::new(192, 168, 1, 1), Ipv4Addr::new(192, 168, 1, 2), 24)
            .with_ipv6(Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, 2), 64)
            .with_dns(vec![
                IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
                IpAddr::V4(Ipv4Addr::new(8, 8, 4, 4)),
            ])
    }
}

/// Tunnel profile registered with the host network-configuration store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelProfile {
    /// Provider identifier; profiles are looked up by this value
    pub identifier: String,
    /// Display name
    #[serde(default = "default_description")]
    pub description: String,
    /// Server address shown by the host
    #[serde(default = "default_server_address")]
    pub server_address: String,
    /// Is this profile enabled?
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_description() -> String {
    DEFAULT_DESCRIPTION.to_string()
}

fn default_server_address() -> String {
    DEFAULT_SERVER_ADDRESS.to_string()
}

fn default_true() -> bool {
    true
}

impl TunnelProfile {
    /// Create an enabled profile for a provider identifier
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            description: default_description(),
            server_address: default_server_address(),
            enabled: true,
        }
    }
}

impl Default for TunnelProfile {
    fn default() -> Self {
        Self::new(DEFAULT_PROVIDER_ID)
    }
}

/// Complete bridge configuration file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Which transform the packet loop applies
    #[serde(default)]
    pub direction: Direction,
    /// Where the symmetric key is kept
    #[serde(default = "default_key_file")]
    pub key_file: PathBuf,
    /// Where registered profiles are kept
    #[serde(default = "default_profile_file")]
    pub profile_file: PathBuf,
    /// Upper bound on waiting for the packet loop to stop (milliseconds)
    #[serde(default = "default_teardown_ms")]
    pub teardown_timeout_ms: u64,
    /// Packets sealed under one key before it must be rotated
    #[serde(default = "default_message_limit")]
    pub key_message_limit: u64,
    /// Profile registered with the host
    #[serde(default)]
    pub profile: TunnelProfile,
    /// Interface settings applied on every start
    #[serde(default)]
    pub tunnel: TunnelConfiguration,
}

fn default_key_file() -> PathBuf {
    PathBuf::from("cellbridge.key")
}

fn default_profile_file() -> PathBuf {
    PathBuf::from("profiles.json")
}

fn default_teardown_ms() -> u64 {
    5_000
}

fn default_message_limit() -> u64 {
    DEFAULT_MESSAGE_LIMIT
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            profile: TunnelProfile::default(),
            tunnel: TunnelConfiguration::default(),
            direction: Direction::default(),
            key_file: default_key_file(),
            profile_file: default_profile_file(),
            teardown_timeout_ms: default_teardown_ms(),
            key_message_limit: default_message_limit(),
        }
    }
}

impl BridgeConfig {
    /// Load from a `.toml` or `.json` file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;

        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        let config = match ext {
            "toml" => Self::from_toml(&content)?,
            "json" => Self::from_json(&content)?,
            _ => return Err(ConfigError::UnsupportedFormat),
        };

        config.validate()?;
        Ok(config)
    }

    /// Load from TOML string
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Load from JSON string
    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Export as TOML
    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }

    /// Teardown timeout as a duration
    pub fn teardown_timeout(&self) -> Duration {
        Duration::from_millis(self.teardown_timeout_ms)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.profile.identifier.trim().is_empty() {
            return Err(ConfigError::MissingIdentifier);
        }
        if self.key_message_limit == 0 {
            return Err(ConfigError::InvalidMessageLimit);
        }
        self.tunnel.validate()
    }
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid MTU: {0}")]
    InvalidMtu(u16),

    #[error("Invalid prefix length: {0}")]
    InvalidPrefix(u8),

    #[error("Invalid route: {0}")]
    InvalidRoute(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Profile identifier is empty")]
    MissingIdentifier,

    #[error("Key message limit must be at least 1")]
    InvalidMessageLimit,

    #[error("Unsupported config format (use .toml or .json)")]
    UnsupportedFormat,

    #[error("I/O error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),
}
