//! TCP transport implementation
//!
//! Thin pass-through to tokio TCP sockets. A transport starts unbound,
//! becomes a listener through `listen` or a stream through `accept` and
//! `connect`. Like UDP, a listener on the unspecified IPv4 address is
//! dual-stack when the host supports it.

use super::addr::local_for_target;
use super::SocketOpts;
use std::io;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tracing::{debug, warn};

#[derive(Debug)]
enum TcpState {
    Unbound { local: SocketAddr },
    Listener(TcpListener),
    Stream(TcpStream),
}

/// TCP transport
#[derive(Debug)]
pub struct TcpTransport {
    state: TcpState,
    /// Socket options to apply to accepted and connected streams
    socket_opts: SocketOpts,
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpTransport {
    /// Create an unbound transport with default socket options
    pub fn new() -> Self {
        TcpTransport {
            state: TcpState::Unbound {
                local: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            },
            socket_opts: SocketOpts::default(),
        }
    }

    /// Set socket options
    pub fn with_socket_opts(mut self, opts: SocketOpts) -> Self {
        self.socket_opts = opts;
        self
    }

    /// Socket options applied to new streams
    pub fn socket_opts(&self) -> &SocketOpts {
        &self.socket_opts
    }

    /// Record the local address used by `listen` or `connect`
    pub fn bind(&mut self, local: SocketAddr) -> io::Result<()> {
        match &mut self.state {
            TcpState::Unbound { local: current } => {
                *current = local;
                Ok(())
            }
            _ => Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "tcp transport is already in use",
            )),
        }
    }

    /// Bind the recorded address and start listening
    pub fn listen(&mut self, backlog: u32) -> io::Result<()> {
        let local = self.unbound_local()?;
        let backlog = i32::try_from(backlog).unwrap_or(i32::MAX);
        let listener = TcpListener::from_std(bind_listener(local, backlog)?)?;

        debug!("TCP listener bound to {}", listener.local_addr()?);
        self.state = TcpState::Listener(listener);
        Ok(())
    }

    /// Wait for the next inbound connection
    pub async fn accept(&self) -> io::Result<TcpTransport> {
        let listener = match &self.state {
            TcpState::Listener(listener) => listener,
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "tcp transport is not listening",
                ))
            }
        };

        let (stream, peer) = listener.accept().await?;
        debug!("Accepted TCP connection from {}", peer);
        Ok(self.wrap_stream(stream))
    }

    /// Open a stream to `target` from the recorded local address
    pub async fn connect(self, target: SocketAddr) -> io::Result<TcpTransport> {
        let local = local_for_target(self.unbound_local()?, target);

        let socket = if target.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.bind(local)?;
        let stream = socket.connect(target).await?;

        debug!("TCP connection established to {}", target);
        Ok(self.wrap_stream(stream))
    }

    /// Write all of `data`
    pub async fn send(&self, data: &[u8]) -> io::Result<usize> {
        let stream = self.stream()?;
        let mut written = 0;

        while written < data.len() {
            stream.writable().await?;
            match stream.try_write(&data[written..]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e),
            }
        }

        Ok(written)
    }

    /// Read whatever is available; 0 means the peer closed
    pub async fn receive(&self, buf: &mut [u8]) -> io::Result<usize> {
        let stream = self.stream()?;

        loop {
            stream.readable().await?;
            match stream.try_read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Shut down both directions of a stream
    ///
    /// A pending `receive` on either end wakes up with 0.
    pub fn disconnect(&self) -> io::Result<()> {
        if let TcpState::Stream(stream) = &self.state {
            match socket2::SockRef::from(stream).shutdown(Shutdown::Both) {
                Err(e) if e.kind() != io::ErrorKind::NotConnected => return Err(e),
                _ => {}
            }
        }
        Ok(())
    }

    /// Local address, the recorded one while unbound
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match &self.state {
            TcpState::Unbound { local } => Ok(*local),
            TcpState::Listener(listener) => listener.local_addr(),
            TcpState::Stream(stream) => stream.local_addr(),
        }
    }

    /// Remote address of a stream
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        match &self.state {
            TcpState::Stream(stream) => stream.peer_addr().ok(),
            _ => None,
        }
    }

    fn wrap_stream(&self, stream: TcpStream) -> TcpTransport {
        if let Err(e) = self.socket_opts.apply(&stream) {
            warn!("Failed to apply socket options: {}", e);
        }

        TcpTransport {
            state: TcpState::Stream(stream),
            socket_opts: self.socket_opts.clone(),
        }
    }

    fn unbound_local(&self) -> io::Result<SocketAddr> {
        match &self.state {
            TcpState::Unbound { local } => Ok(*local),
            _ => Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "tcp transport is already in use",
            )),
        }
    }

    fn stream(&self) -> io::Result<&TcpStream> {
        match &self.state {
            TcpState::Stream(stream) => Ok(stream),
            _ => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "tcp transport is not connected",
            )),
        }
    }
}

fn bind_listener(local: SocketAddr, backlog: i32) -> io::Result<std::net::TcpListener> {
    if local.ip() == IpAddr::V4(Ipv4Addr::UNSPECIFIED) {
        match bind_dual_stack(local.port(), backlog) {
            Ok(listener) => return Ok(listener),
            Err(e) => debug!("Dual-stack TCP listen failed, using IPv4 only: {}", e),
        }
    }

    let socket = Socket::new(Domain::for_address(local), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&local.into())?;
    socket.listen(backlog)?;
    Ok(socket.into())
}

fn bind_dual_stack(port: u16, backlog: i32) -> io::Result<std::net::TcpListener> {
    let socket = Socket::new(Domain::IPV6, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_only_v6(false)?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port).into())?;
    socket.listen(backlog)?;
    Ok(socket.into())
}
