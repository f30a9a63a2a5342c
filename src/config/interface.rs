//! Interface name resolution
//!
//! Configured interfaces are `*`, a literal IP, or the name of a local
//! interface, which resolves to its first IPv4 address.

use super::server::ANY_INTERFACE;
use crate::error::ProxyError;
use std::net::{IpAddr, Ipv4Addr};

/// Lookup of local interface addresses by name
pub trait InterfaceResolver {
    /// First IPv4 address of the named interface
    fn ipv4_address(&self, name: &str) -> Option<Ipv4Addr>;
}

/// Resolver backed by the host's interface table
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemInterfaces;

impl InterfaceResolver for SystemInterfaces {
    fn ipv4_address(&self, name: &str) -> Option<Ipv4Addr> {
        let interfaces = match if_addrs::get_if_addrs() {
            Ok(interfaces) => interfaces,
            Err(e) => {
                tracing::warn!("Failed to list network interfaces: {}", e);
                return None;
            }
        };

        interfaces
            .into_iter()
            .filter(|iface| iface.name == name)
            .find_map(|iface| match iface.ip() {
                IpAddr::V4(v4) => Some(v4),
                IpAddr::V6(_) => None,
            })
    }
}

/// Resolve a configured interface value to a bind address
pub fn resolve_interface(
    value: &str,
    resolver: &dyn InterfaceResolver,
) -> Result<IpAddr, ProxyError> {
    if value == ANY_INTERFACE {
        return Ok(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    }
    if let Ok(ip) = value.parse::<IpAddr>() {
        return Ok(ip);
    }

    resolver
        .ipv4_address(value)
        .map(IpAddr::V4)
        .ok_or_else(|| ProxyError::Interface(format!("Could not find interface `{}`", value)))
}
