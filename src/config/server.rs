//! Server configuration types
//!
//! [`Config`] mirrors the configuration file. [`ServerSettings`] is the
//! resolved, immutable form the server runs with.

use super::interface::{resolve_interface, InterfaceResolver};
use crate::error::ProxyError;
use crate::helper::{encode_port, page_size};
use crate::transport::DEFAULT_UDP_SESSION_TIMEOUT;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

/// Smallest buffer that holds the largest handshake and request messages
pub const MIN_BUFFER_SIZE: usize = 262;

/// Interface value meaning "all interfaces"
pub const ANY_INTERFACE: &str = "*";

fn default_interface() -> String {
    ANY_INTERFACE.to_string()
}

fn default_port() -> u32 {
    1080
}

fn default_max_connections() -> u32 {
    100
}

fn default_buffer_size() -> usize {
    page_size()
}

fn default_udp_session_timeout() -> u64 {
    DEFAULT_UDP_SESSION_TIMEOUT.as_secs()
}

/// Configuration file contents
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct Config {
    /// Interface name, literal IP or `*` to accept clients on
    #[serde(default = "default_interface")]
    pub listen_interface: String,

    /// Interface name, literal IP or `*` to open endpoints from
    #[serde(default = "default_interface")]
    pub endpoint_interface: String,

    /// Listen port for both TCP and UDP
    #[serde(default = "default_port")]
    pub port: u32,

    /// TCP listen backlog
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Protocol and relay buffer size in bytes
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// UDP session idle timeout in seconds, 0 disables eviction
    #[serde(default = "default_udp_session_timeout")]
    pub udp_session_timeout: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listen_interface: default_interface(),
            endpoint_interface: default_interface(),
            port: default_port(),
            max_connections: default_max_connections(),
            buffer_size: default_buffer_size(),
            udp_session_timeout: default_udp_session_timeout(),
        }
    }
}

impl Config {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        encode_port(self.port).map_err(|e| e.to_string())?;

        if self.max_connections == 0 {
            return Err("MaxConnections must be greater than 0".to_string());
        }
        if self.buffer_size < MIN_BUFFER_SIZE {
            return Err(format!(
                "BufferSize must be at least {} bytes, got {}",
                MIN_BUFFER_SIZE, self.buffer_size
            ));
        }
        if self.listen_interface.is_empty() || self.endpoint_interface.is_empty() {
            return Err("Interface names cannot be empty".to_string());
        }
        Ok(())
    }

    /// UDP idle timeout, `None` when sessions are never evicted
    pub fn udp_session_timeout(&self) -> Option<Duration> {
        match self.udp_session_timeout {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

/// Resolved settings the server runs with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    /// Address the listeners bind to
    pub listen_addr: IpAddr,
    /// Address endpoint transports bind to
    pub endpoint_addr: IpAddr,
    /// Listen port, 0 for an ephemeral one
    pub port: u16,
    /// TCP listen backlog
    pub backlog: u32,
    /// Protocol and relay buffer size
    pub buffer_size: usize,
    /// UDP session idle timeout
    pub udp_session_timeout: Option<Duration>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        let config = Config::default();
        ServerSettings {
            listen_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            endpoint_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: config.port as u16,
            backlog: config.max_connections,
            buffer_size: config.buffer_size,
            udp_session_timeout: config.udp_session_timeout(),
        }
    }
}

impl ServerSettings {
    /// Validate `config` and resolve its interfaces
    pub fn from_config(
        config: &Config,
        resolver: &dyn InterfaceResolver,
    ) -> Result<Self, ProxyError> {
        config.validate().map_err(ProxyError::Config)?;

        let port = u16::try_from(config.port)
            .map_err(|_| ProxyError::Config(format!("Invalid port: {}", config.port)))?;

        Ok(ServerSettings {
            listen_addr: resolve_interface(&config.listen_interface, resolver)?,
            endpoint_addr: resolve_interface(&config.endpoint_interface, resolver)?,
            port,
            backlog: config.max_connections,
            buffer_size: config.buffer_size,
            udp_session_timeout: config.udp_session_timeout(),
        })
    }
}

impl fmt::Display for ServerSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "listen={} endpoint={} port={} backlog={} buffer={}",
            self.listen_addr, self.endpoint_addr, self.port, self.backlog, self.buffer_size
        )?;
        match self.udp_session_timeout {
            Some(timeout) => write!(f, " udp_timeout={}s", timeout.as_secs()),
            None => write!(f, " udp_timeout=never"),
        }
    }
}
