//! Bypass configuration.
//!
//! A `BypassConfig` is built once from the command line and cloned into every
//! channel when the container connects. Channels never observe later changes.
//!
//! ## Example
//!
//! ```ignore
//! use netbypass::BypassConfig;
//!
//! let config = BypassConfig::new()
//!     .publish("8080:80".parse()?)?
//!     .ignore("10.0.0.0/8".parse()?);
//! ```
//!
//! ## Defaults
//!
//! | Field | Default |
//! |-------|---------|
//! | `forwarding` | empty |
//! | `ignore` | `127.0.0.0/8`, `::1/128` |
//! | `auto_ignore` | false |

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use ipnetwork::IpNetwork;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid port mapping {0:?}, expected HOST:CONTAINER")]
    PortMapping(String),

    #[error("invalid subnet {0:?}")]
    Subnet(String),

    #[error("container port {container} is already published on host port {host}")]
    DuplicateContainerPort { container: u16, host: u16 },

    #[error("host port {host} is already published for container port {container}")]
    DuplicateHostPort { host: u16, container: u16 },
}

/// One published port: the host listens on `host`, the container uses `container`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortMapping {
    pub host: u16,
    pub container: u16,
}

impl FromStr for PortMapping {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ConfigError::PortMapping(s.to_string());
        let (host, container) = s.split_once(':').ok_or_else(err)?;
        let host = host.trim().parse::<u16>().map_err(|_| err())?;
        let container = container.trim().parse::<u16>().map_err(|_| err())?;
        if host == 0 || container == 0 {
            return Err(err());
        }
        Ok(Self { host, container })
    }
}

impl fmt::Display for PortMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.container)
    }
}

/// Bidirectional host/container port table.
#[derive(Debug, Clone, Default)]
pub struct ForwardingPorts {
    by_container: HashMap<u16, u16>,
    by_host: HashMap<u16, u16>,
}

impl ForwardingPorts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, mapping: PortMapping) -> Result<(), ConfigError> {
        if let Some(&host) = self.by_container.get(&mapping.container) {
            if host != mapping.host {
                return Err(ConfigError::DuplicateContainerPort {
                    container: mapping.container,
                    host,
                });
            }
        }
        if let Some(&container) = self.by_host.get(&mapping.host) {
            if container != mapping.container {
                return Err(ConfigError::DuplicateHostPort {
                    host: mapping.host,
                    container,
                });
            }
        }
        self.by_container.insert(mapping.container, mapping.host);
        self.by_host.insert(mapping.host, mapping.container);
        Ok(())
    }

    /// Host port published for a container port.
    pub fn host_port(&self, container: u16) -> Option<u16> {
        self.by_container.get(&container).copied()
    }

    /// Container port behind a host port.
    pub fn container_port(&self, host: u16) -> Option<u16> {
        self.by_host.get(&host).copied()
    }

    pub fn len(&self) -> usize {
        self.by_container.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_container.is_empty()
    }
}

/// One `--ignore` argument: a CIDR, or `auto` to learn the sandbox's subnets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreSubnet {
    Auto,
    Subnet(IpNetwork),
}

impl FromStr for IgnoreSubnet {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim() == "auto" {
            return Ok(Self::Auto);
        }
        s.trim()
            .parse::<IpNetwork>()
            .map(Self::Subnet)
            .map_err(|_| ConfigError::Subnet(s.to_string()))
    }
}

/// Immutable per-channel configuration snapshot.
#[derive(Debug, Clone)]
pub struct BypassConfig {
    pub forwarding: ForwardingPorts,
    pub ignore: Vec<IpNetwork>,
    pub auto_ignore: bool,
}

impl Default for BypassConfig {
    fn default() -> Self {
        Self {
            forwarding: ForwardingPorts::new(),
            ignore: default_ignore(),
            auto_ignore: false,
        }
    }
}

impl BypassConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a port. Publishing the same pair twice is a no-op.
    pub fn publish(mut self, mapping: PortMapping) -> Result<Self, ConfigError> {
        self.forwarding.insert(mapping)?;
        Ok(self)
    }

    /// Add one `--ignore` entry.
    pub fn ignore(mut self, entry: IgnoreSubnet) -> Self {
        match entry {
            IgnoreSubnet::Auto => self.auto_ignore = true,
            IgnoreSubnet::Subnet(net) if !self.ignore.contains(&net) => self.ignore.push(net),
            IgnoreSubnet::Subnet(_) => {}
        }
        self
    }
}

fn default_ignore() -> Vec<IpNetwork> {
    ["127.0.0.0/8", "::1/128"]
        .iter()
        .filter_map(|s| s.parse().ok())
        .collect()
}
