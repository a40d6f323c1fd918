//! Session configuration
//!
//! A [`SessionConfig`] is built up front, with builder methods or from YAML,
//! and moved into the [`Session`](crate::Session). Nothing can change it while
//! the session runs.
//!
//! ```rust
//! use cortex_stream::config::{PortSetting, SessionConfig};
//! use std::time::Duration;
//!
//! let config = SessionConfig::default()
//!     .host("10.1.1.20")
//!     .host_port(PortSetting::Fixed(1510))
//!     .min_timeout(Duration::from_millis(750))
//!     .client_communication(true);
//!
//! assert!(config.validate().is_ok());
//! ```
//!
//! The same configuration in YAML:
//!
//! ```yaml
//! addresses:
//!   host: 10.1.1.20
//! ports:
//!   host: 1510
//!   talk_to_host: any
//! min_timeout_ms: 750
//! client_communication: true
//! ```

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::logging::VerbosityLevel;
use crate::{CortexError, Result};

pub const DEFAULT_HOST_MULTICAST: Ipv4Addr = Ipv4Addr::new(225, 1, 1, 1);
pub const DEFAULT_CLIENTS_MULTICAST: Ipv4Addr = Ipv4Addr::new(225, 1, 1, 2);
pub const DEFAULT_HOST_PORT: u16 = 1510;
pub const DEFAULT_MULTICAST_PORT: u16 = 1001;
pub const DEFAULT_MIN_TIMEOUT: Duration = Duration::from_millis(500);
pub const DEFAULT_MAX_BODIES: usize = 100;
pub const DEFAULT_RELAY_IDENTITY: &str = "cortex-stream";

/// How one port is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "PortValue", into = "PortValue")]
pub enum PortSetting {
    /// This exact port, 1 through 65535.
    Fixed(u16),
    /// Let the OS pick a free port.
    Any,
    /// Keep the built-in default for this port.
    Unchanged,
}

impl PortSetting {
    /// The port to bind, with `0` meaning "any".
    pub fn resolve(self, default: u16) -> u16 {
        match self {
            PortSetting::Fixed(port) => port,
            PortSetting::Any => 0,
            PortSetting::Unchanged => default,
        }
    }

    fn validate(self, name: &str) -> Result<()> {
        if self == PortSetting::Fixed(0) {
            return Err(CortexError::api_misuse(format!(
                "port '{}' must be between 1 and 65535 (use Any for an OS-assigned port)",
                name
            )));
        }
        Ok(())
    }
}

impl fmt::Display for PortSetting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortSetting::Fixed(port) => write!(f, "{}", port),
            PortSetting::Any => f.write_str("any"),
            PortSetting::Unchanged => f.write_str("unchanged"),
        }
    }
}

/// YAML form of a port: a number or one of the words `any` / `unchanged`.
#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum PortValue {
    Number(u32),
    Word(String),
}

impl TryFrom<PortValue> for PortSetting {
    type Error = String;

    fn try_from(value: PortValue) -> std::result::Result<Self, Self::Error> {
        match value {
            PortValue::Number(n) => match u16::try_from(n) {
                Ok(port) if port > 0 => Ok(PortSetting::Fixed(port)),
                _ => Err(format!("port {} is outside 1..=65535", n)),
            },
            PortValue::Word(word) => match word.to_ascii_lowercase().as_str() {
                "any" => Ok(PortSetting::Any),
                "unchanged" => Ok(PortSetting::Unchanged),
                _ => Err(format!("unknown port setting '{}', expected a number, 'any' or 'unchanged'", word)),
            },
        }
    }
}

impl From<PortSetting> for PortValue {
    fn from(setting: PortSetting) -> Self {
        match setting {
            PortSetting::Fixed(port) => PortValue::Number(port as u32),
            other => PortValue::Word(other.to_string()),
        }
    }
}

/// The six ports a session uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Ports {
    /// Local port of the command socket.
    pub talk_to_host: PortSetting,
    /// Port the host answers commands on.
    pub host: PortSetting,
    /// Port the host multicasts frames to.
    pub host_multicast: PortSetting,
    /// Local port downstream clients send requests to.
    pub talk_to_clients_request: PortSetting,
    /// Local port relayed frames are sent from.
    pub talk_to_clients_multicast: PortSetting,
    /// Port relayed frames are multicast to.
    pub clients_multicast: PortSetting,
}

impl Default for Ports {
    fn default() -> Self {
        Self {
            talk_to_host: PortSetting::Any,
            host: PortSetting::Fixed(DEFAULT_HOST_PORT),
            host_multicast: PortSetting::Fixed(DEFAULT_MULTICAST_PORT),
            talk_to_clients_request: PortSetting::Any,
            talk_to_clients_multicast: PortSetting::Any,
            clients_multicast: PortSetting::Fixed(DEFAULT_MULTICAST_PORT),
        }
    }
}

impl Ports {
    pub fn talk_to_host_port(&self) -> u16 {
        self.talk_to_host.resolve(0)
    }

    pub fn host_port(&self) -> u16 {
        self.host.resolve(DEFAULT_HOST_PORT)
    }

    pub fn host_multicast_port(&self) -> u16 {
        self.host_multicast.resolve(DEFAULT_MULTICAST_PORT)
    }

    pub fn talk_to_clients_request_port(&self) -> u16 {
        self.talk_to_clients_request.resolve(0)
    }

    pub fn talk_to_clients_multicast_port(&self) -> u16 {
        self.talk_to_clients_multicast.resolve(0)
    }

    pub fn clients_multicast_port(&self) -> u16 {
        self.clients_multicast.resolve(DEFAULT_MULTICAST_PORT)
    }

    fn validate(&self) -> Result<()> {
        self.talk_to_host.validate("talk_to_host")?;
        self.host.validate("host")?;
        self.host_multicast.validate("host_multicast")?;
        self.talk_to_clients_request.validate("talk_to_clients_request")?;
        self.talk_to_clients_multicast.validate("talk_to_clients_multicast")?;
        self.clients_multicast.validate("clients_multicast")?;

        if self.host_port() == 0 || self.clients_multicast_port() == 0 {
            return Err(CortexError::api_misuse(
                "host and clients_multicast are remote ports and cannot be Any",
            ));
        }
        Ok(())
    }
}

/// Interfaces and peers.
///
/// NIC and host entries accept a dotted quad or a resolvable name. An absent or
/// empty entry means auto-select: any interface for NICs, broadcast discovery
/// for the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Addresses {
    pub talk_to_host_nic: Option<String>,
    pub talk_to_clients_nic: Option<String>,
    pub host: Option<String>,
    pub host_multicast: Ipv4Addr,
    pub clients_multicast: Ipv4Addr,
}

impl Default for Addresses {
    fn default() -> Self {
        Self {
            talk_to_host_nic: None,
            talk_to_clients_nic: None,
            host: None,
            host_multicast: DEFAULT_HOST_MULTICAST,
            clients_multicast: DEFAULT_CLIENTS_MULTICAST,
        }
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

impl Addresses {
    pub fn talk_to_host_nic(&self) -> Option<&str> {
        non_empty(&self.talk_to_host_nic)
    }

    pub fn talk_to_clients_nic(&self) -> Option<&str> {
        non_empty(&self.talk_to_clients_nic)
    }

    pub fn host(&self) -> Option<&str> {
        non_empty(&self.host)
    }

    fn validate(&self) -> Result<()> {
        for (name, addr) in [("host_multicast", self.host_multicast), ("clients_multicast", self.clients_multicast)] {
            if !addr.is_multicast() {
                return Err(CortexError::api_misuse(format!(
                    "{} address {} is not a multicast address (224.0.0.0/4)",
                    name, addr
                )));
            }
        }
        Ok(())
    }
}

/// Scheduling hint for a background activity.
///
/// `Default` leaves the platform's choice alone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadPriority {
    #[default]
    Default,
    Lowest,
    BelowNormal,
    Normal,
    AboveNormal,
    Highest,
}

/// Priority hints for the command wait, frame receiver and client listener.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreadPriorities {
    pub host: ThreadPriority,
    pub data: ThreadPriority,
    pub clients: ThreadPriority,
}

/// Everything a session needs before it starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub addresses: Addresses,
    pub ports: Ports,

    /// Floor applied to every request timeout.
    #[serde(rename = "min_timeout_ms", with = "duration_ms")]
    pub min_timeout: Duration,

    /// Threshold for [`LogCallbackLayer`](crate::logging::LogCallbackLayer)s
    /// built through the session.
    pub verbosity: VerbosityLevel,

    pub thread_priorities: ThreadPriorities,

    /// Run the client distribution server.
    pub client_communication: bool,

    /// Forward every host frame to downstream subscribers.
    pub relay_host_frames: bool,

    /// Soft limit on bodies per definition set; exceeding it only warns.
    pub max_bodies: usize,

    /// Program name this session reports to downstream clients.
    pub relay_identity: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            addresses: Addresses::default(),
            ports: Ports::default(),
            min_timeout: DEFAULT_MIN_TIMEOUT,
            verbosity: VerbosityLevel::default(),
            thread_priorities: ThreadPriorities::default(),
            client_communication: false,
            relay_host_frames: false,
            max_bodies: DEFAULT_MAX_BODIES,
            relay_identity: DEFAULT_RELAY_IDENTITY.to_string(),
        }
    }
}

impl SessionConfig {
    /// Parse a YAML document. Missing keys keep their defaults.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml_ng::from_str(yaml)
            .map_err(|e| CortexError::api_misuse(format!("session config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|e| {
            CortexError::general_with_source(format!("reading session config {}", path.display()), Box::new(e))
        })?;
        Self::from_yaml(&yaml)
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml_ng::to_string(self).map_err(|e| CortexError::general(format!("serializing session config: {}", e)))
    }

    /// Check every setting that can be checked without touching the network.
    pub fn validate(&self) -> Result<()> {
        self.addresses.validate()?;
        self.ports.validate()?;

        if self.min_timeout.is_zero() {
            return Err(CortexError::api_misuse("min_timeout must be greater than zero"));
        }
        if self.max_bodies == 0 {
            return Err(CortexError::api_misuse("max_bodies must be at least 1"));
        }
        if self.relay_host_frames && !self.client_communication {
            return Err(CortexError::api_misuse("relay_host_frames requires client_communication"));
        }
        Ok(())
    }

    /// Effective deadline for a request.
    pub fn effective_timeout(&self, requested: Duration) -> Duration {
        requested.max(self.min_timeout)
    }

    /// Host address or name; `None` selects the host by broadcast discovery.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.addresses.host = Some(host.into());
        self
    }

    pub fn talk_to_host_nic(mut self, nic: impl Into<String>) -> Self {
        self.addresses.talk_to_host_nic = Some(nic.into());
        self
    }

    pub fn talk_to_clients_nic(mut self, nic: impl Into<String>) -> Self {
        self.addresses.talk_to_clients_nic = Some(nic.into());
        self
    }

    pub fn host_multicast(mut self, group: Ipv4Addr) -> Self {
        self.addresses.host_multicast = group;
        self
    }

    pub fn clients_multicast(mut self, group: Ipv4Addr) -> Self {
        self.addresses.clients_multicast = group;
        self
    }

    pub fn ports(mut self, ports: Ports) -> Self {
        self.ports = ports;
        self
    }

    pub fn talk_to_host_port(mut self, port: PortSetting) -> Self {
        self.ports.talk_to_host = port;
        self
    }

    pub fn host_port(mut self, port: PortSetting) -> Self {
        self.ports.host = port;
        self
    }

    pub fn host_multicast_port(mut self, port: PortSetting) -> Self {
        self.ports.host_multicast = port;
        self
    }

    pub fn talk_to_clients_request_port(mut self, port: PortSetting) -> Self {
        self.ports.talk_to_clients_request = port;
        self
    }

    pub fn talk_to_clients_multicast_port(mut self, port: PortSetting) -> Self {
        self.ports.talk_to_clients_multicast = port;
        self
    }

    pub fn clients_multicast_port(mut self, port: PortSetting) -> Self {
        self.ports.clients_multicast = port;
        self
    }

    pub fn min_timeout(mut self, timeout: Duration) -> Self {
        self.min_timeout = timeout;
        self
    }

    pub fn verbosity(mut self, level: VerbosityLevel) -> Self {
        self.verbosity = level;
        self
    }

    pub fn thread_priorities(mut self, priorities: ThreadPriorities) -> Self {
        self.thread_priorities = priorities;
        self
    }

    pub fn client_communication(mut self, enabled: bool) -> Self {
        self.client_communication = enabled;
        self
    }

    /// Relay host frames downstream. Turns on client communication as well.
    pub fn relay_host_frames(mut self, enabled: bool) -> Self {
        self.relay_host_frames = enabled;
        if enabled {
            self.client_communication = true;
        }
        self
    }

    pub fn max_bodies(mut self, max: usize) -> Self {
        self.max_bodies = max;
        self
    }

    pub fn relay_identity(mut self, name: impl Into<String>) -> Self {
        self.relay_identity = name.into();
        self
    }
}

/// Resolve a dotted quad or host name to an IPv4 address.
pub async fn resolve_ipv4(name: &str) -> Result<Ipv4Addr> {
    if let Ok(addr) = name.parse::<Ipv4Addr>() {
        return Ok(addr);
    }

    let addrs = tokio::net::lookup_host((name, 0)).await.map_err(|e| {
        CortexError::network_error_with_source(format!("could not resolve '{}'", name), Box::new(e))
    })?;

    addrs
        .filter_map(|addr| match addr {
            SocketAddr::V4(v4) => Some(*v4.ip()),
            SocketAddr::V6(_) => None,
        })
        .next()
        .ok_or_else(|| CortexError::network_error(format!("'{}' has no IPv4 address", name)))
}

/// Resolve an optional NIC entry; `None` binds every interface.
pub async fn resolve_nic(name: Option<&str>) -> Result<Ipv4Addr> {
    match name {
        Some(name) => resolve_ipv4(name).await,
        None => Ok(Ipv4Addr::UNSPECIFIED),
    }
}

/// Resolved host endpoint for the command channel.
pub async fn resolve_host(config: &SessionConfig) -> Result<Option<SocketAddrV4>> {
    let port = config.ports.host_port();
    match config.addresses.host() {
        Some(name) => Ok(Some(SocketAddrV4::new(resolve_ipv4(name).await?, port))),
        None => Ok(None),
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
