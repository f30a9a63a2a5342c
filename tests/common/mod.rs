//! Test utilities for Sockpump
//!
//! This module provides common test utilities used across integration tests.

#![allow(dead_code)]

use sockpump::config::ServerSettings;
use sockpump::server::Server;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Upper bound for any single network step in a test
pub const STEP_TIMEOUT: Duration = Duration::from_secs(5);

/// Settings for a server on loopback with an ephemeral port
pub fn local_settings() -> ServerSettings {
    ServerSettings {
        listen_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
        endpoint_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
        port: 0,
        buffer_size: 4096,
        ..Default::default()
    }
}

/// A running server, cancelled on drop
pub struct TestServer {
    pub tcp_addr: SocketAddr,
    pub udp_addr: SocketAddr,
    pub token: CancellationToken,
    pub task: Option<JoinHandle<anyhow::Result<()>>>,
}

impl TestServer {
    /// Bind and start a server
    pub async fn start(settings: ServerSettings) -> Self {
        let server = Server::bind(settings).await.unwrap();
        let tcp_addr = server.tcp_addr().unwrap();
        let udp_addr = server.udp_addr().unwrap();
        let token = CancellationToken::new();
        let task = tokio::spawn(server.run(token.clone()));

        TestServer {
            tcp_addr,
            udp_addr,
            token,
            task: Some(task),
        }
    }

    /// Cancel the server and wait for it to stop
    pub async fn stop(mut self) {
        self.token.cancel();
        if let Some(task) = self.task.take() {
            tokio::time::timeout(STEP_TIMEOUT, task)
                .await
                .unwrap()
                .unwrap()
                .unwrap();
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Create a test TCP listener on an available port
pub async fn create_test_listener() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

/// A loopback port nothing listens on
pub async fn closed_port() -> u16 {
    let (listener, addr) = create_test_listener().await;
    drop(listener);
    addr.port()
}

/// UDP echo server on loopback
pub async fn spawn_udp_echo() -> (SocketAddr, JoinHandle<()>) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();

    let task = tokio::spawn(async move {
        let mut buf = vec![0u8; 65535];
        while let Ok((n, from)) = socket.recv_from(&mut buf).await {
            let _ = socket.send_to(&buf[..n], from).await;
        }
    });

    (addr, task)
}

/// Read exactly `len` bytes from a TCP stream
pub async fn read_exact(stream: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    tokio::time::timeout(STEP_TIMEOUT, stream.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    buf
}

/// Wait until the peer closes a TCP stream, discarding nothing
pub async fn expect_eof(stream: &mut TcpStream) {
    let mut buf = [0u8; 64];
    let n = tokio::time::timeout(STEP_TIMEOUT, stream.read(&mut buf))
        .await
        .unwrap()
        .unwrap_or(0);
    assert_eq!(n, 0, "expected end of stream, got {:?}", &buf[..n]);
}

/// Receive one datagram on a UDP socket
pub async fn recv_datagram(socket: &UdpSocket) -> Vec<u8> {
    let mut buf = vec![0u8; 65535];
    let n = tokio::time::timeout(STEP_TIMEOUT, socket.recv(&mut buf))
        .await
        .unwrap()
        .unwrap();
    buf.truncate(n);
    buf
}

/// Open a TCP client, negotiate and send a request; returns the stream
/// and the reply
pub async fn tcp_connect_via(proxy: SocketAddr, request: &[u8]) -> (TcpStream, Vec<u8>) {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream
        .write_all(&socks5_mock::create_auth_request_no_auth())
        .await
        .unwrap();
    assert_eq!(read_exact(&mut stream, 2).await, vec![0x05, 0x00]);

    stream.write_all(request).await.unwrap();
    let mut reply = read_exact(&mut stream, 4).await;
    let rest = match reply[3] {
        0x04 => 18,
        _ => 6,
    };
    reply.extend(read_exact(&mut stream, rest).await);
    (stream, reply)
}

/// Mock SOCKS5 messages
pub mod socks5_mock {
    use sockpump::socks::*;

    /// Create a no-auth method selection request
    pub fn create_auth_request_no_auth() -> Vec<u8> {
        vec![SOCKS5_VERSION, 1, SOCKS5_AUTH_METHOD_NONE]
    }

    /// Create a password auth method selection request
    pub fn create_auth_request_password() -> Vec<u8> {
        vec![SOCKS5_VERSION, 1, SOCKS5_AUTH_METHOD_PASSWORD]
    }

    /// Create a request to an IPv4 address
    pub fn create_request_ipv4(command: u8, ip: [u8; 4], port: u16) -> Vec<u8> {
        let mut cmd = vec![SOCKS5_VERSION, command, SOCKS5_RESERVED, SOCKS5_ADDR_TYPE_IPV4];
        cmd.extend_from_slice(&ip);
        cmd.extend_from_slice(&port.to_be_bytes());
        cmd
    }

    /// Create a connect command to IPv4 address
    pub fn create_connect_ipv4(ip: [u8; 4], port: u16) -> Vec<u8> {
        create_request_ipv4(SOCKS5_CMD_TCP_CONNECT, ip, port)
    }

    /// Create a connect command to domain
    pub fn create_connect_domain(domain: &str, port: u16) -> Vec<u8> {
        let mut cmd = vec![
            SOCKS5_VERSION,
            SOCKS5_CMD_TCP_CONNECT,
            SOCKS5_RESERVED,
            SOCKS5_ADDR_TYPE_DOMAIN,
            domain.len() as u8,
        ];
        cmd.extend_from_slice(domain.as_bytes());
        cmd.extend_from_slice(&port.to_be_bytes());
        cmd
    }
}
