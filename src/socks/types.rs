//! SOCKS5 type definitions
//!
//! Defines the core types used in SOCKS5 protocol handling.

use super::consts::*;
use crate::error::Socks5Error;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// SOCKS5 command types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocksCommand {
    /// TCP CONNECT - establish a connection to target
    Connect,
    /// TCP BIND - wait for incoming connection (not implemented)
    Bind,
    /// UDP ASSOCIATE - establish UDP relay (not implemented)
    UdpAssociate,
}

impl SocksCommand {
    /// Parse a command byte into SocksCommand
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            SOCKS5_CMD_TCP_CONNECT => Some(SocksCommand::Connect),
            SOCKS5_CMD_TCP_BIND => Some(SocksCommand::Bind),
            SOCKS5_CMD_UDP_ASSOCIATE => Some(SocksCommand::UdpAssociate),
            _ => None,
        }
    }

    /// Convert SocksCommand to byte
    pub fn to_byte(self) -> u8 {
        match self {
            SocksCommand::Connect => SOCKS5_CMD_TCP_CONNECT,
            SocksCommand::Bind => SOCKS5_CMD_TCP_BIND,
            SocksCommand::UdpAssociate => SOCKS5_CMD_UDP_ASSOCIATE,
        }
    }
}

impl fmt::Display for SocksCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocksCommand::Connect => write!(f, "CONNECT"),
            SocksCommand::Bind => write!(f, "BIND"),
            SocksCommand::UdpAssociate => write!(f, "UDP ASSOCIATE"),
        }
    }
}

/// Initial method-selection message sent by the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// Protocol version (must be 5)
    pub version: u8,
    /// Number of methods offered
    pub method_count: u8,
    /// Offered authentication methods
    pub methods: Vec<u8>,
}

impl Handshake {
    /// Parse a method-selection message
    pub fn parse(bytes: &[u8]) -> Result<Self, Socks5Error> {
        super::auth::parse_handshake(bytes)
    }
}

/// Destination carried by a request, keyed by address type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestAddr {
    /// ATYP 0x01
    Ipv4(Ipv4Addr),
    /// ATYP 0x03
    Domain(String),
    /// ATYP 0x04
    Ipv6(Ipv6Addr),
}

impl RequestAddr {
    /// Address type byte for SOCKS5 protocol
    pub fn addr_type(&self) -> u8 {
        match self {
            RequestAddr::Ipv4(_) => SOCKS5_ADDR_TYPE_IPV4,
            RequestAddr::Domain(_) => SOCKS5_ADDR_TYPE_DOMAIN,
            RequestAddr::Ipv6(_) => SOCKS5_ADDR_TYPE_IPV6,
        }
    }

    /// The IP address, if this is not a domain name
    pub fn ip(&self) -> Option<IpAddr> {
        match self {
            RequestAddr::Ipv4(ip) => Some(IpAddr::V4(*ip)),
            RequestAddr::Ipv6(ip) => Some(IpAddr::V6(*ip)),
            RequestAddr::Domain(_) => None,
        }
    }
}

impl fmt::Display for RequestAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestAddr::Ipv4(ip) => write!(f, "{}", ip),
            RequestAddr::Domain(name) => write!(f, "{}", name),
            RequestAddr::Ipv6(ip) => write!(f, "{}", ip),
        }
    }
}

/// A parsed SOCKS5 request
///
/// ```text
/// +----+-----+-------+------+----------+----------+
/// |VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
/// +----+-----+-------+------+----------+----------+
/// | 1  |  1  | X'00' |  1   | Variable |    2     |
/// +----+-----+-------+------+----------+----------+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Protocol version
    pub version: u8,
    /// Raw command byte
    pub command: u8,
    /// Reserved byte, kept as received
    pub reserved: u8,
    /// Destination address
    pub address: RequestAddr,
    /// Destination port
    pub port: u16,
}

impl Request {
    /// Parse a request message
    pub fn parse(bytes: &[u8]) -> Result<Self, Socks5Error> {
        super::command::parse_request(bytes)
    }

    /// Build a CONNECT request
    pub fn connect(address: RequestAddr, port: u16) -> Self {
        Request {
            version: SOCKS5_VERSION,
            command: SOCKS5_CMD_TCP_CONNECT,
            reserved: SOCKS5_RESERVED,
            address,
            port,
        }
    }

    /// Decoded command, `None` for bytes outside the command set
    pub fn command(&self) -> Option<SocksCommand> {
        SocksCommand::from_byte(self.command)
    }

    /// Address type byte
    pub fn address_type(&self) -> u8 {
        self.address.addr_type()
    }

    /// Textual address or domain name
    pub fn destination(&self) -> String {
        self.address.to_string()
    }

    /// Socket address when the destination is an IP
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.address.ip().map(|ip| SocketAddr::new(ip, self.port))
    }

    /// Serialize the request to bytes for SOCKS5 protocol
    ///
    /// Fails when a domain name does not fit its one-byte length prefix.
    pub fn to_bytes(&self) -> Result<Vec<u8>, Socks5Error> {
        let mut bytes = vec![self.version, self.command, self.reserved, self.address_type()];

        match &self.address {
            RequestAddr::Ipv4(ip) => bytes.extend_from_slice(&ip.octets()),
            RequestAddr::Ipv6(ip) => bytes.extend_from_slice(&ip.octets()),
            RequestAddr::Domain(name) => {
                let len = u8::try_from(name.len()).map_err(|_| {
                    Socks5Error::InvalidDomain(format!(
                        "{} bytes exceeds the {} byte limit",
                        name.len(),
                        MAX_DOMAIN_LEN
                    ))
                })?;
                bytes.push(len);
                bytes.extend_from_slice(name.as_bytes());
            }
        }
        bytes.extend_from_slice(&self.port.to_be_bytes());

        Ok(bytes)
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.address {
            RequestAddr::Ipv6(ip) => write!(f, "[{}]:{}", ip, self.port),
            other => write!(f, "{}:{}", other, self.port),
        }
    }
}
