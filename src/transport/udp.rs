//! UDP transport implementation
//!
//! Emulates connections over one connectionless socket. A bound UDP
//! transport becomes a [`UdpServer`]: it owns the socket and runs a
//! background loop that demultiplexes datagrams by source address into
//! [`UdpSession`]s. Sessions share the socket through a weak reference and
//! never close it; only the server does.

use super::addr::{canonicalize, fit_to_family, local_as_seen_by, normalize};
use crate::helper::MAX_DATAGRAM_SIZE;
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Default idle time after which a UDP session is evicted
pub const DEFAULT_UDP_SESSION_TIMEOUT: Duration = Duration::from_secs(120);

/// Lower bound for the eviction sweep period
const MIN_SWEEP_PERIOD: Duration = Duration::from_millis(10);

/// Map entry for one tracked remote endpoint
#[derive(Debug)]
struct SessionSlot {
    id: u64,
    inbound: mpsc::UnboundedSender<Bytes>,
    last_active: Arc<AtomicU64>,
}

/// State shared by a server and all of its sessions
#[derive(Debug)]
struct UdpShared {
    socket: UdpSocket,
    sessions: DashMap<SocketAddr, SessionSlot>,
    accepting: AtomicBool,
    next_id: AtomicU64,
    epoch: Instant,
    is_v6: bool,
    idle_timeout: Option<Duration>,
}

impl UdpShared {
    fn now_millis(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Create a session for `key` together with the slot that feeds it
    fn open_session(shared: &Arc<UdpShared>, key: SocketAddr) -> (SessionSlot, UdpSession) {
        let id = shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let last_active = Arc::new(AtomicU64::new(shared.now_millis()));

        let slot = SessionSlot {
            id,
            inbound: tx,
            last_active: last_active.clone(),
        };
        let session = UdpSession {
            id,
            key,
            remote: normalize(key),
            shared: Arc::downgrade(shared),
            inbound: Mutex::new(rx),
            last_active,
        };
        (slot, session)
    }

    /// Route one datagram to its session
    ///
    /// Returns a newly created session when the source was unknown and the
    /// server is accepting.
    fn dispatch(shared: &Arc<UdpShared>, datagram: &[u8], from: SocketAddr) -> Option<UdpSession> {
        let key = canonicalize(from);
        let now = shared.now_millis();

        match shared.sessions.entry(key) {
            Entry::Occupied(entry) => {
                let slot = entry.get();
                slot.last_active.store(now, Ordering::Relaxed);
                if slot.inbound.send(Bytes::copy_from_slice(datagram)).is_err() {
                    trace!("Session {} for {} is gone, dropping datagram", slot.id, from);
                }
                None
            }
            Entry::Vacant(vacant) => {
                if !shared.accepting.load(Ordering::Acquire) {
                    trace!("Dropping {} bytes from untracked source {}", datagram.len(), from);
                    return None;
                }

                let (slot, session) = UdpShared::open_session(shared, key);
                // The receiver is alive in `session`, so this cannot fail.
                let _ = slot.inbound.send(Bytes::copy_from_slice(datagram));
                vacant.insert(slot);

                debug!("New UDP session {} from {}", session.id, from);
                Some(session)
            }
        }
    }

    /// Remove sessions idle for longer than `timeout`
    fn evict_idle(&self, timeout: Duration) {
        let now = self.now_millis();
        let limit = timeout.as_millis() as u64;

        self.sessions.retain(|key, slot| {
            let idle = now.saturating_sub(slot.last_active.load(Ordering::Relaxed));
            if idle > limit {
                debug!("Evicting idle UDP session {} for {}", slot.id, normalize(*key));
                false
            } else {
                true
            }
        });
    }
}

/// Bound UDP socket with its session map and receive loop
#[derive(Debug)]
pub struct UdpServer {
    shared: Arc<UdpShared>,
    pending: Mutex<mpsc::UnboundedReceiver<UdpSession>>,
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl UdpServer {
    /// Bind `local` and start the receive loop
    ///
    /// An unspecified IPv4 address binds a dual-stack `[::]` socket when the
    /// host supports it.
    pub async fn bind(local: SocketAddr, idle_timeout: Option<Duration>) -> io::Result<UdpServer> {
        let socket = UdpSocket::from_std(bind_socket(local)?)?;
        let is_v6 = socket.local_addr()?.is_ipv6();

        let shared = Arc::new(UdpShared {
            socket,
            sessions: DashMap::new(),
            accepting: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            epoch: Instant::now(),
            is_v6,
            idle_timeout,
        });

        let (pending_tx, pending_rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        let task = tokio::spawn(receive_loop(shared.clone(), pending_tx, token.clone()));

        debug!("UDP server bound to {}", shared.socket.local_addr()?);

        Ok(UdpServer {
            shared,
            pending: Mutex::new(pending_rx),
            token,
            task,
        })
    }

    /// Offer sessions for new sources on the accept queue
    pub fn set_accepting(&self, accepting: bool) {
        self.shared.accepting.store(accepting, Ordering::Release);
    }

    /// Whether new sources become sessions
    pub fn is_accepting(&self) -> bool {
        self.shared.accepting.load(Ordering::Acquire)
    }

    /// Wait for the next session created by an unknown source
    pub async fn accept(&self) -> io::Result<UdpSession> {
        let mut pending = self.pending.lock().await;
        pending.recv().await.ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "udp server has stopped")
        })
    }

    /// Start tracking `remote` and return its session
    pub fn connect(&self, remote: SocketAddr) -> io::Result<UdpSession> {
        let key = canonicalize(remote);

        match self.shared.sessions.entry(key) {
            Entry::Occupied(_) => Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("udp session for {} already exists", remote),
            )),
            Entry::Vacant(vacant) => {
                let (slot, session) = UdpShared::open_session(&self.shared, key);
                vacant.insert(slot);
                debug!("UDP session {} opened to {}", session.id, remote);
                Ok(session)
            }
        }
    }

    /// Drop every session and stop the receive loop
    pub fn disconnect(&self) {
        self.shared.sessions.clear();
        self.token.cancel();
    }

    /// Number of tracked sessions
    pub fn session_count(&self) -> usize {
        self.shared.sessions.len()
    }

    /// Idle timeout applied to sessions, `None` when they are never evicted
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.shared.idle_timeout
    }

    /// Local address of the shared socket
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.shared.socket.local_addr()
    }
}

impl Drop for UdpServer {
    fn drop(&mut self) {
        self.token.cancel();
        self.task.abort();
    }
}

/// One remote endpoint tracked by a [`UdpServer`]
#[derive(Debug)]
pub struct UdpSession {
    id: u64,
    key: SocketAddr,
    remote: SocketAddr,
    shared: Weak<UdpShared>,
    inbound: Mutex<mpsc::UnboundedReceiver<Bytes>>,
    last_active: Arc<AtomicU64>,
}

impl UdpSession {
    /// Session id, unique within its server
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Remote endpoint, IPv4-mapped addresses shown as IPv4
    pub fn peer_addr(&self) -> SocketAddr {
        self.remote
    }

    /// Local address of the shared socket, as the remote sees it
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        let local = self.upgrade()?.socket.local_addr()?;
        Ok(local_as_seen_by(local, self.remote))
    }

    /// Send one datagram to the remote endpoint
    pub async fn send(&self, data: &[u8]) -> io::Result<usize> {
        let shared = self.upgrade()?;
        let target = fit_to_family(self.remote, shared.is_v6);

        let sent = shared.socket.send_to(data, target).await?;
        self.last_active.store(shared.now_millis(), Ordering::Relaxed);
        Ok(sent)
    }

    /// Receive one whole datagram into `buf`
    ///
    /// Returns 0 at end of stream: an empty datagram, or the session is no
    /// longer tracked and its queue is drained. Either way the session gives
    /// up its map entry, so the next datagram from the peer starts a new one.
    /// A datagram larger than `buf` is discarded with `InvalidData`.
    pub async fn receive(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut inbound = self.inbound.lock().await;

        match inbound.recv().await {
            Some(datagram) if datagram.len() > buf.len() => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "{} byte datagram does not fit a {} byte buffer",
                    datagram.len(),
                    buf.len()
                ),
            )),
            Some(datagram) if !datagram.is_empty() => {
                buf[..datagram.len()].copy_from_slice(&datagram);
                Ok(datagram.len())
            }
            _ => {
                self.release();
                Ok(0)
            }
        }
    }

    /// Remove this session's map entry if it is still the tracked one
    fn release(&self) {
        if let Some(shared) = self.shared.upgrade() {
            shared
                .sessions
                .remove_if(&self.key, |_, slot| slot.id == self.id);
        }
    }

    fn upgrade(&self) -> io::Result<Arc<UdpShared>> {
        self.shared.upgrade().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "udp server has been closed")
        })
    }
}

impl Drop for UdpSession {
    fn drop(&mut self) {
        self.release();
    }
}

#[derive(Debug)]
enum UdpState {
    Unbound {
        local: SocketAddr,
    },
    Server(UdpServer),
    Session {
        session: UdpSession,
        /// Private server created to dial out; released with the session
        origin: Option<UdpServer>,
    },
}

/// UDP transport: an unbound address, a server or a session
#[derive(Debug)]
pub struct UdpTransport {
    state: UdpState,
    idle_timeout: Option<Duration>,
}

impl Default for UdpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl UdpTransport {
    /// Create an unbound transport with the default idle timeout
    pub fn new() -> Self {
        UdpTransport {
            state: UdpState::Unbound {
                local: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            },
            idle_timeout: Some(DEFAULT_UDP_SESSION_TIMEOUT),
        }
    }

    /// Set the session idle timeout, `None` to never evict
    pub fn with_idle_timeout(mut self, idle_timeout: Option<Duration>) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Session idle timeout used by servers this transport creates
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout
    }

    /// Bind the socket and become a server
    pub async fn bind(&mut self, local: SocketAddr) -> io::Result<()> {
        match self.state {
            UdpState::Unbound { .. } => {
                self.state = UdpState::Server(UdpServer::bind(local, self.idle_timeout).await?);
                Ok(())
            }
            _ => Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "udp transport is already bound",
            )),
        }
    }

    /// Start offering sessions for new sources
    pub fn listen(&mut self) -> io::Result<()> {
        self.server()?.set_accepting(true);
        Ok(())
    }

    /// Wait for the next session
    pub async fn accept(&self) -> io::Result<UdpTransport> {
        let session = self.server()?.accept().await?;
        Ok(UdpTransport {
            state: UdpState::Session {
                session,
                origin: None,
            },
            idle_timeout: self.idle_timeout,
        })
    }

    /// Turn this transport into a session with `target`
    ///
    /// An unbound transport first binds a private server on its recorded
    /// address; the session keeps that server alive.
    pub async fn connect(self, target: SocketAddr) -> io::Result<UdpTransport> {
        let idle_timeout = self.idle_timeout;
        let origin = match self.state {
            UdpState::Unbound { local } => UdpServer::bind(local, idle_timeout).await?,
            UdpState::Server(server) => server,
            UdpState::Session { .. } => {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    "udp transport is already connected",
                ))
            }
        };

        let session = origin.connect(target)?;
        Ok(UdpTransport {
            state: UdpState::Session {
                session,
                origin: Some(origin),
            },
            idle_timeout,
        })
    }

    /// Send one datagram to the session's remote
    pub async fn send(&self, data: &[u8]) -> io::Result<usize> {
        self.session()?.send(data).await
    }

    /// Receive one whole datagram; 0 once the session has ended
    pub async fn receive(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.session()?.receive(buf).await
    }

    /// Tear down a server, or end a session's stream
    ///
    /// A session gives up its map entry: a pending `receive` drains what is
    /// queued and then returns 0. Sending still works until it is dropped.
    pub fn disconnect(&self) {
        match &self.state {
            UdpState::Server(server) => server.disconnect(),
            UdpState::Session { session, .. } => session.release(),
            UdpState::Unbound { .. } => {}
        }
    }

    /// Local address, the recorded one while unbound
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match &self.state {
            UdpState::Unbound { local } => Ok(*local),
            UdpState::Server(server) => server.local_addr(),
            UdpState::Session { session, .. } => session.local_addr(),
        }
    }

    /// Remote address of a session
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        match &self.state {
            UdpState::Session { session, .. } => Some(session.peer_addr()),
            _ => None,
        }
    }

    fn server(&self) -> io::Result<&UdpServer> {
        match &self.state {
            UdpState::Server(server) => Ok(server),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "udp transport is not a bound server",
            )),
        }
    }

    fn session(&self) -> io::Result<&UdpSession> {
        match &self.state {
            UdpState::Session { session, .. } => Ok(session),
            UdpState::Server(_) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "udp server transports do not carry data",
            )),
            UdpState::Unbound { .. } => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "udp transport is not connected",
            )),
        }
    }
}

async fn receive_loop(
    shared: Arc<UdpShared>,
    pending: mpsc::UnboundedSender<UdpSession>,
    token: CancellationToken,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

    let sweep_period = shared
        .idle_timeout
        .map(|timeout| (timeout / 2).max(MIN_SWEEP_PERIOD))
        .unwrap_or(Duration::from_secs(3600));
    let mut sweep = tokio::time::interval(sweep_period);
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,

            _ = sweep.tick(), if shared.idle_timeout.is_some() => {
                if let Some(timeout) = shared.idle_timeout {
                    shared.evict_idle(timeout);
                }
            }

            received = shared.socket.recv_from(&mut buf) => match received {
                Ok((n, from)) => {
                    if let Some(session) = UdpShared::dispatch(&shared, &buf[..n], from) {
                        if pending.send(session).is_err() {
                            trace!("Accept queue closed, dropping session for {}", from);
                        }
                    }
                }
                Err(e) => debug!("UDP receive error: {}", e),
            },
        }
    }

    trace!("UDP receive loop stopped");
}

fn bind_socket(local: SocketAddr) -> io::Result<std::net::UdpSocket> {
    if local.ip() == IpAddr::V4(Ipv4Addr::UNSPECIFIED) {
        match bind_dual_stack(local.port()) {
            Ok(socket) => return Ok(socket),
            Err(e) => debug!("Dual-stack UDP bind failed, using IPv4 only: {}", e),
        }
    }

    let socket = Socket::new(Domain::for_address(local), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_nonblocking(true)?;
    socket.bind(&local.into())?;
    Ok(socket.into())
}

fn bind_dual_stack(port: u16) -> io::Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_only_v6(false)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port).into())?;
    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn listening_server(idle_timeout: Option<Duration>) -> UdpServer {
        let server = UdpServer::bind("127.0.0.1:0".parse().unwrap(), idle_timeout)
            .await
            .unwrap();
        server.set_accepting(true);
        server
    }

    async fn peer() -> UdpSocket {
        UdpSocket::bind("127.0.0.1:0").await.unwrap()
    }

    async fn accept_within(server: &UdpServer) -> UdpSession {
        tokio::time::timeout(Duration::from_secs(2), server.accept())
            .await
            .unwrap()
            .unwrap()
    }

    async fn receive_within(session: &UdpSession) -> Vec<u8> {
        let mut buf = vec![0u8; 1024];
        let n = tokio::time::timeout(Duration::from_secs(2), session.receive(&mut buf))
            .await
            .unwrap()
            .unwrap();
        buf.truncate(n);
        buf
    }

    #[tokio::test]
    async fn test_udp_sessions_are_demultiplexed_by_source() {
        let server = listening_server(None).await;
        let target = server.local_addr().unwrap();
        let (a, b) = (peer().await, peer().await);

        a.send_to(b"a1", target).await.unwrap();
        let session_a = accept_within(&server).await;
        b.send_to(b"b1", target).await.unwrap();
        let session_b = accept_within(&server).await;
        a.send_to(b"a2", target).await.unwrap();
        a.send_to(b"a3", target).await.unwrap();
        b.send_to(b"b2", target).await.unwrap();

        assert_eq!(session_a.peer_addr(), a.local_addr().unwrap());
        assert_eq!(session_b.peer_addr(), b.local_addr().unwrap());
        assert_ne!(session_a.id(), session_b.id());

        assert_eq!(receive_within(&session_a).await, b"a1");
        assert_eq!(receive_within(&session_a).await, b"a2");
        assert_eq!(receive_within(&session_a).await, b"a3");
        assert_eq!(receive_within(&session_b).await, b"b1");
        assert_eq!(receive_within(&session_b).await, b"b2");
        assert_eq!(server.session_count(), 2);
    }

    #[tokio::test]
    async fn test_udp_burst_before_accept_keeps_order() {
        let server = listening_server(None).await;
        let target = server.local_addr().unwrap();
        let client = peer().await;

        for i in 0..20u8 {
            client.send_to(&[i], target).await.unwrap();
        }

        let session = accept_within(&server).await;
        for i in 0..20u8 {
            assert_eq!(receive_within(&session).await, vec![i]);
        }

        // Only one session exists for the single source
        let extra = tokio::time::timeout(Duration::from_millis(100), server.accept()).await;
        assert!(extra.is_err());
        assert_eq!(server.session_count(), 1);
    }

    #[tokio::test]
    async fn test_udp_session_send_reaches_peer() {
        let server = listening_server(None).await;
        let client = peer().await;
        client.send_to(b"ping", server.local_addr().unwrap()).await.unwrap();

        let session = accept_within(&server).await;
        session.send(b"pong").await.unwrap();

        let mut buf = [0u8; 16];
        let (n, from) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"pong");
        assert_eq!(from.port(), server.local_addr().unwrap().port());
    }

    #[tokio::test]
    async fn test_udp_receive_never_returns_partial_datagram() {
        let server = listening_server(None).await;
        let client = peer().await;
        let target = server.local_addr().unwrap();
        client.send_to(b"0123456789", target).await.unwrap();
        client.send_to(b"next", target).await.unwrap();

        let session = accept_within(&server).await;
        let mut small = [0u8; 4];
        let err = session.receive(&mut small).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        // A datagram that fits is delivered whole
        let mut buf = [0u8; 4];
        assert_eq!(session.receive(&mut buf).await.unwrap(), 4);
        assert_eq!(&buf, b"next");
    }

    #[tokio::test]
    async fn test_udp_large_datagram_arrives_whole() {
        let server = listening_server(None).await;
        let client = peer().await;
        let payload: Vec<u8> = (0..6000u32).map(|i| (i % 251) as u8).collect();
        client.send_to(&payload, server.local_addr().unwrap()).await.unwrap();

        let session = accept_within(&server).await;
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let n = session.receive(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &payload[..]);
    }

    #[tokio::test]
    async fn test_udp_empty_datagram_ends_session() {
        let server = listening_server(None).await;
        let client = peer().await;
        let target = server.local_addr().unwrap();
        client.send_to(b"", target).await.unwrap();

        let session = accept_within(&server).await;
        assert_eq!(server.session_count(), 1);
        assert_eq!(receive_within(&session).await, b"");
        assert_eq!(server.session_count(), 0);

        // Later datagrams from the same peer open a fresh session
        client.send_to(b"again", target).await.unwrap();
        let fresh = accept_within(&server).await;
        assert_ne!(fresh.id(), session.id());
        assert_eq!(receive_within(&fresh).await, b"again");
        assert_eq!(server.session_count(), 1);

        // The ended session no longer owns the peer's entry
        drop(session);
        assert_eq!(server.session_count(), 1);
    }

    #[tokio::test]
    async fn test_udp_non_listening_server_drops_unknown_sources() {
        let server = UdpServer::bind("127.0.0.1:0".parse().unwrap(), None)
            .await
            .unwrap();
        assert!(!server.is_accepting());
        let target = server.local_addr().unwrap();

        let stranger = peer().await;
        let known = peer().await;
        let session = server.connect(known.local_addr().unwrap()).unwrap();

        stranger.send_to(b"noise", target).await.unwrap();
        known.send_to(b"reply", target).await.unwrap();

        assert_eq!(receive_within(&session).await, b"reply");
        assert_eq!(server.session_count(), 1);
    }

    #[tokio::test]
    async fn test_udp_connect_rejects_duplicate_remote() {
        let server = UdpServer::bind("127.0.0.1:0".parse().unwrap(), None)
            .await
            .unwrap();
        let remote: SocketAddr = "127.0.0.1:5353".parse().unwrap();
        let mapped: SocketAddr = "[::ffff:127.0.0.1]:5353".parse().unwrap();

        let _session = server.connect(remote).unwrap();
        let err = server.connect(mapped).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
    }

    #[tokio::test]
    async fn test_udp_dropping_session_releases_key() {
        let server = UdpServer::bind("127.0.0.1:0".parse().unwrap(), None)
            .await
            .unwrap();
        let remote: SocketAddr = "127.0.0.1:5353".parse().unwrap();

        let session = server.connect(remote).unwrap();
        assert_eq!(server.session_count(), 1);
        drop(session);
        assert_eq!(server.session_count(), 0);

        server.connect(remote).unwrap();
    }

    #[tokio::test]
    async fn test_udp_server_disconnect_ends_sessions() {
        let server = listening_server(None).await;
        let client = peer().await;
        client.send_to(b"first", server.local_addr().unwrap()).await.unwrap();
        let session = accept_within(&server).await;

        server.disconnect();
        assert_eq!(server.session_count(), 0);

        // Queued data is still delivered, then end of stream
        assert_eq!(receive_within(&session).await, b"first");
        assert_eq!(receive_within(&session).await, b"");

        let err = tokio::time::timeout(Duration::from_secs(2), server.accept())
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }

    #[tokio::test]
    async fn test_udp_session_outlives_dropped_server() {
        let server = listening_server(None).await;
        let client = peer().await;
        client.send_to(b"x", server.local_addr().unwrap()).await.unwrap();
        let session = accept_within(&server).await;

        drop(server);
        // The aborted receive loop releases its reference once polled
        for _ in 0..100 {
            if session.local_addr().is_err() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert!(session.local_addr().is_err());
        assert_eq!(
            session.send(b"late").await.unwrap_err().kind(),
            io::ErrorKind::NotConnected
        );
    }

    #[tokio::test]
    async fn test_udp_idle_sessions_are_evicted() {
        let server = listening_server(Some(Duration::from_millis(200))).await;
        let client = peer().await;
        client.send_to(b"hello", server.local_addr().unwrap()).await.unwrap();

        let session = accept_within(&server).await;
        assert_eq!(receive_within(&session).await, b"hello");

        // Evicted after the idle timeout: receive reports end of stream
        assert_eq!(receive_within(&session).await, b"");
        assert_eq!(server.session_count(), 0);
    }

    #[tokio::test]
    async fn test_udp_sessions_never_evicted_without_timeout() {
        let server = listening_server(None).await;
        assert_eq!(server.idle_timeout(), None);
        let client = peer().await;
        client.send_to(b"hello", server.local_addr().unwrap()).await.unwrap();

        let session = accept_within(&server).await;
        assert_eq!(receive_within(&session).await, b"hello");

        // Idle sessions accumulate: nothing reclaims this one
        let mut buf = [0u8; 16];
        let idle = tokio::time::timeout(Duration::from_millis(500), session.receive(&mut buf)).await;
        assert!(idle.is_err());
        assert_eq!(server.session_count(), 1);
    }

    #[tokio::test]
    async fn test_udp_dual_stack_accepts_ipv4_peers() {
        let server = UdpServer::bind("0.0.0.0:0".parse().unwrap(), None)
            .await
            .unwrap();
        server.set_accepting(true);
        let port = server.local_addr().unwrap().port();

        let client = peer().await;
        client
            .send_to(b"v4", SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port))
            .await
            .unwrap();

        let session = accept_within(&server).await;
        assert_eq!(session.peer_addr(), client.local_addr().unwrap());
        assert_eq!(receive_within(&session).await, b"v4");

        session.send(b"back").await.unwrap();
        let mut buf = [0u8; 16];
        let (n, _) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"back");
    }

    #[tokio::test]
    async fn test_udp_transport_bind_twice_fails() {
        let mut transport = UdpTransport::new();
        transport.bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let err = transport
            .bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
    }

    #[tokio::test]
    async fn test_udp_transport_server_carries_no_data() {
        let mut transport = UdpTransport::new();
        transport.bind("127.0.0.1:0".parse().unwrap()).await.unwrap();

        let mut buf = [0u8; 8];
        assert!(transport.send(b"x").await.is_err());
        assert!(transport.receive(&mut buf).await.is_err());
        assert!(transport.peer_addr().is_none());
    }

    #[tokio::test]
    async fn test_udp_transport_accept_requires_bind() {
        let transport = UdpTransport::new();
        assert!(transport.accept().await.is_err());
        assert!(UdpTransport::new().listen().is_err());
    }

    #[tokio::test]
    async fn test_udp_transport_dial_and_answer() {
        let mut listener = UdpTransport::new().with_idle_timeout(None);
        listener.bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        listener.listen().unwrap();
        let target = listener.local_addr().unwrap();

        let mut dialer = UdpTransport::new();
        dialer.bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let dialer = dialer.connect(target).await.unwrap();
        assert_eq!(dialer.peer_addr(), Some(target));

        dialer.send(b"hello").await.unwrap();
        let accepted = tokio::time::timeout(Duration::from_secs(2), listener.accept())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(accepted.peer_addr(), Some(dialer.local_addr().unwrap()));

        let mut buf = [0u8; 16];
        let n = accepted.receive(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");

        accepted.send(b"world").await.unwrap();
        let n = tokio::time::timeout(Duration::from_secs(2), dialer.receive(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"world");

        // Session disconnect ends its stream; sending still works
        accepted.disconnect();
        assert_eq!(accepted.receive(&mut buf).await.unwrap(), 0);
        accepted.send(b"again").await.unwrap();
        let n = tokio::time::timeout(Duration::from_secs(2), dialer.receive(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"again");

        // The peer's next datagram is a new session
        dialer.send(b"hello again").await.unwrap();
        let fresh = tokio::time::timeout(Duration::from_secs(2), listener.accept())
            .await
            .unwrap()
            .unwrap();
        let n = fresh.receive(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello again");
    }

    #[tokio::test]
    async fn test_udp_transport_connect_from_unbound() {
        let peer_socket = peer().await;
        let target = peer_socket.local_addr().unwrap();

        let session = UdpTransport::new().connect(target).await.unwrap();
        assert_ne!(session.local_addr().unwrap().port(), 0);

        session.send(b"out").await.unwrap();
        let mut buf = [0u8; 16];
        let (n, from) = peer_socket.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"out");
        assert_eq!(from.port(), session.local_addr().unwrap().port());

        assert!(session.connect(target).await.is_err());
    }
}
