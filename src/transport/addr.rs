//! Address handling for transports
//!
//! Canonical forms used as UDP session keys, family adaptation for sends and
//! connects, and first-address name resolution.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV6};

/// Canonical form of a remote address
///
/// IPv4 becomes IPv4-mapped IPv6; flow info and scope id are cleared so the
/// same peer always produces the same key whichever socket family saw it.
pub fn canonicalize(addr: SocketAddr) -> SocketAddr {
    let ip = match addr.ip() {
        IpAddr::V4(v4) => v4.to_ipv6_mapped(),
        IpAddr::V6(v6) => v6,
    };
    SocketAddr::V6(SocketAddrV6::new(ip, addr.port(), 0, 0))
}

/// Collapse an IPv4-mapped IPv6 address to plain IPv4
pub fn normalize(addr: SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V6(v6) => match v6.ip().to_ipv4_mapped() {
            Some(v4) => SocketAddr::new(IpAddr::V4(v4), v6.port()),
            None => addr,
        },
        v4 => v4,
    }
}

/// Adapt a destination to the family of the socket that sends to it
///
/// IPv6 sockets (dual-stack) take the canonical mapped form, IPv4 sockets
/// take the plain form. A native IPv6 address is left alone on an IPv4
/// socket; the send itself reports the mismatch.
pub fn fit_to_family(addr: SocketAddr, socket_is_v6: bool) -> SocketAddr {
    if socket_is_v6 {
        canonicalize(addr)
    } else {
        normalize(addr)
    }
}

/// Local address as reported to a peer
///
/// A dual-stack socket bound to `[::]` talks to IPv4 peers through mapped
/// addresses; for those peers it is reported as `0.0.0.0` on the same port.
pub fn local_as_seen_by(local: SocketAddr, peer: SocketAddr) -> SocketAddr {
    let unspecified_v6 = matches!(local.ip(), IpAddr::V6(ip) if ip.is_unspecified());

    if unspecified_v6 && normalize(peer).is_ipv4() {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), local.port())
    } else {
        local
    }
}

/// Local address to bind before connecting to `target`
///
/// An unspecified local address of the other family is swapped for the
/// unspecified address of the target's family, keeping the port.
pub fn local_for_target(local: SocketAddr, target: SocketAddr) -> SocketAddr {
    if local.ip().is_unspecified() && local.is_ipv4() != target.is_ipv4() {
        let ip = if target.is_ipv4() {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        } else {
            IpAddr::V6(Ipv6Addr::UNSPECIFIED)
        };
        SocketAddr::new(ip, local.port())
    } else {
        local
    }
}

/// Resolve a host name and keep only the first address
///
/// Every failure is reported as [`io::ErrorKind::HostUnreachable`] so the
/// client receives the host-unreachable reply.
pub async fn resolve_first(host: &str, port: u16) -> io::Result<SocketAddr> {
    let mut addrs = tokio::net::lookup_host((host, port)).await.map_err(|e| {
        io::Error::new(
            io::ErrorKind::HostUnreachable,
            format!("Failed to resolve {}: {}", host, e),
        )
    })?;

    addrs.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::HostUnreachable,
            format!("No addresses found for: {}", host),
        )
    })
}
