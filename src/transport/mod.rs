//! Transport module for Sockpump
//!
//! This module provides one stream-like interface over TCP sockets and
//! emulated UDP connections, so connections and the relay stay
//! transport-agnostic.

mod addr;
mod tcp;
mod udp;

pub use addr::{
    canonicalize, fit_to_family, local_as_seen_by, local_for_target, normalize, resolve_first,
};
pub use tcp::TcpTransport;
pub use udp::{UdpServer, UdpSession, UdpTransport, DEFAULT_UDP_SESSION_TIMEOUT};

use crate::helper::MAX_DATAGRAM_SIZE;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;

/// Socket options for configuring TCP streams
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketOpts {
    /// Enable TCP_NODELAY
    pub nodelay: bool,
    /// TCP keepalive timeout
    pub keepalive_secs: Option<u64>,
    /// TCP keepalive interval
    pub keepalive_interval: Option<u64>,
}

impl Default for SocketOpts {
    fn default() -> Self {
        SocketOpts {
            nodelay: true,
            keepalive_secs: Some(20),
            keepalive_interval: Some(8),
        }
    }
}

impl SocketOpts {
    /// Apply socket options to a TCP stream
    pub fn apply(&self, stream: &TcpStream) -> io::Result<()> {
        stream.set_nodelay(self.nodelay)?;

        if let (Some(timeout), Some(interval)) = (self.keepalive_secs, self.keepalive_interval) {
            let socket = socket2::SockRef::from(stream);
            let keepalive = socket2::TcpKeepalive::new()
                .with_time(Duration::from_secs(timeout))
                .with_interval(Duration::from_secs(interval));
            socket.set_tcp_keepalive(&keepalive)?;
        }

        Ok(())
    }
}

/// Kind of a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Stream socket
    Tcp,
    /// Datagram socket with emulated sessions
    Udp,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Tcp => write!(f, "tcp"),
            TransportKind::Udp => write!(f, "udp"),
        }
    }
}

/// A TCP or UDP transport
///
/// `send` and `receive` take `&self` so the two directions of a relay can
/// run concurrently on the same transport.
#[derive(Debug)]
pub enum Transport {
    /// TCP variant
    Tcp(TcpTransport),
    /// UDP variant
    Udp(UdpTransport),
}

impl From<TcpTransport> for Transport {
    fn from(transport: TcpTransport) -> Self {
        Transport::Tcp(transport)
    }
}

impl From<UdpTransport> for Transport {
    fn from(transport: UdpTransport) -> Self {
        Transport::Udp(transport)
    }
}

impl Transport {
    /// Transport kind
    pub fn kind(&self) -> TransportKind {
        match self {
            Transport::Tcp(_) => TransportKind::Tcp,
            Transport::Udp(_) => TransportKind::Udp,
        }
    }

    /// Fresh unbound transport of the same kind and options
    pub fn new_of_same_kind(&self) -> Transport {
        match self {
            Transport::Tcp(t) => TcpTransport::new()
                .with_socket_opts(t.socket_opts().clone())
                .into(),
            Transport::Udp(u) => UdpTransport::new()
                .with_idle_timeout(u.idle_timeout())
                .into(),
        }
    }

    /// Receive buffer size for this transport, at least `preferred`
    ///
    /// UDP buffers always hold a whole datagram, since one `receive` returns
    /// exactly one.
    pub fn receive_buffer_size(&self, preferred: usize) -> usize {
        match self {
            Transport::Tcp(_) => preferred,
            Transport::Udp(_) => preferred.max(MAX_DATAGRAM_SIZE),
        }
    }

    /// Bind to a local address
    ///
    /// TCP records the address for `listen` or `connect`; UDP binds at once
    /// and starts its receive loop.
    pub async fn bind(&mut self, local: SocketAddr) -> io::Result<()> {
        match self {
            Transport::Tcp(t) => t.bind(local),
            Transport::Udp(u) => u.bind(local).await,
        }
    }

    /// Start accepting inbound connections
    pub fn listen(&mut self, backlog: u32) -> io::Result<()> {
        match self {
            Transport::Tcp(t) => t.listen(backlog),
            Transport::Udp(u) => u.listen(),
        }
    }

    /// Wait for the next inbound connection
    pub async fn accept(&self) -> io::Result<Transport> {
        match self {
            Transport::Tcp(t) => Ok(t.accept().await?.into()),
            Transport::Udp(u) => Ok(u.accept().await?.into()),
        }
    }

    /// Connect to `target`, consuming this transport
    pub async fn connect(self, target: SocketAddr) -> io::Result<Transport> {
        match self {
            Transport::Tcp(t) => Ok(t.connect(target).await?.into()),
            Transport::Udp(u) => Ok(u.connect(target).await?.into()),
        }
    }

    /// Send bytes to the peer
    pub async fn send(&self, data: &[u8]) -> io::Result<usize> {
        match self {
            Transport::Tcp(t) => t.send(data).await,
            Transport::Udp(u) => u.send(data).await,
        }
    }

    /// Receive bytes from the peer; 0 means the peer is gone
    pub async fn receive(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Transport::Tcp(t) => t.receive(buf).await,
            Transport::Udp(u) => u.receive(buf).await,
        }
    }

    /// Close the connection
    ///
    /// Safe to call repeatedly. A UDP session stops receiving; a UDP server
    /// drops all its sessions.
    pub fn disconnect(&self) -> io::Result<()> {
        match self {
            Transport::Tcp(t) => t.disconnect(),
            Transport::Udp(u) => {
                u.disconnect();
                Ok(())
            }
        }
    }

    /// Local address
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match self {
            Transport::Tcp(t) => t.local_addr(),
            Transport::Udp(u) => u.local_addr(),
        }
    }

    /// Remote address of a connected transport
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        match self {
            Transport::Tcp(t) => t.peer_addr(),
            Transport::Udp(u) => u.peer_addr(),
        }
    }
}
