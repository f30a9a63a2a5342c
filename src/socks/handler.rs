//! Per-connection SOCKS5 state machine
//!
//! A [`Connection`] owns one accepted client transport. It negotiates the
//! method, reads the request, opens an endpoint transport of the same kind,
//! replies and relays until both directions finish.
//!
//! # Protocol Flow
//!
//! 1. Method negotiation (always "no authentication")
//! 2. Request parsing (CONNECT only)
//! 3. Endpoint bind, resolution and connect
//! 4. Reply, sent whatever the outcome
//! 5. Relay

use super::auth::handshake_reply;
use super::command::encode_reply;
use super::consts::SOCKS5_VERSION;
use super::relay::relay;
use super::types::{Handshake, Request, SocksCommand};
use crate::error::{ProxyError, Socks5Error, Socks5ReplyCode};
use crate::transport::{resolve_first, Transport};
use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Lifecycle of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Created, nothing read yet
    Start,
    /// Waiting for the method-selection message
    Handshaking,
    /// Waiting for the request
    AwaitingRequest,
    /// Opening the endpoint transport
    Connecting,
    /// Relaying between client and endpoint
    Relaying,
    /// Finished normally or cancelled
    Closed,
    /// Ended by an error
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Start => "start",
            ConnectionState::Handshaking => "handshaking",
            ConnectionState::AwaitingRequest => "awaiting-request",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Relaying => "relaying",
            ConnectionState::Closed => "closed",
            ConnectionState::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

/// One proxied client connection
#[derive(Debug)]
pub struct Connection {
    id: String,
    client: Transport,
    endpoint: Option<Transport>,
    endpoint_interface: IpAddr,
    buffer_size: usize,
    state: ConnectionState,
}

impl Connection {
    /// Wrap an accepted client transport
    ///
    /// Endpoint transports are bound to `endpoint_interface` on an ephemeral
    /// port. `buffer_size` sizes the protocol buffer and each relay buffer,
    /// raised to a full datagram for UDP.
    pub fn new(client: Transport, endpoint_interface: IpAddr, buffer_size: usize) -> Self {
        Connection {
            id: format!("{:08x}", rand::random::<u32>()),
            client,
            endpoint: None,
            endpoint_interface,
            buffer_size,
            state: ConnectionState::Start,
        }
    }

    /// Random 8 hex digit id used in logs
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Drive the connection to completion and release both transports
    ///
    /// Errors are logged here; the returned state tells how it ended.
    pub async fn handle(mut self, token: CancellationToken) -> ConnectionState {
        if let Some(peer) = self.client.peer_addr() {
            debug!("New {} connection from {}", self.client.kind(), peer);
        }

        let result = tokio::select! {
            _ = token.cancelled() => None,
            result = self.run(&token) => Some(result),
        };

        match result {
            None => {
                debug!("Connection cancelled while {}", self.state);
                self.state = ConnectionState::Closed;
            }
            Some(Ok(())) => self.state = ConnectionState::Closed,
            Some(Err(e)) => {
                match &e {
                    ProxyError::Socks5(Socks5Error::ConnectFailed { .. }) => info!("{}", e),
                    ProxyError::Socks5(inner) if inner.is_protocol_error() => {
                        debug!("Rejected malformed message while {}: {}", self.state, e)
                    }
                    _ => warn!("Connection failed while {}: {}", self.state, e),
                }
                self.state = ConnectionState::Failed;
            }
        }

        self.teardown();
        self.state
    }

    async fn run(&mut self, token: &CancellationToken) -> Result<(), ProxyError> {
        let mut buf = vec![0u8; self.client.receive_buffer_size(self.buffer_size)];

        self.state = ConnectionState::Handshaking;
        let n = self.client.receive(&mut buf).await?;
        let handshake = Handshake::parse(&buf[..n])?;
        if handshake.version != SOCKS5_VERSION {
            return Err(Socks5Error::UnsupportedVersion(handshake.version).into());
        }
        trace!("Client offered methods {:?}", handshake.methods);
        self.client.send(&handshake_reply()).await?;

        self.state = ConnectionState::AwaitingRequest;
        let n = self.client.receive(&mut buf).await?;
        let request = Request::parse(&buf[..n])?;
        let command = match request.command() {
            Some(SocksCommand::Connect) => SocksCommand::Connect,
            Some(other) => return Err(Socks5Error::CommandNotSupported(other).into()),
            None => return Err(Socks5Error::UnknownCommand(request.command).into()),
        };
        info!("SOCKS5 {} request to {}", command, request);

        self.state = ConnectionState::Connecting;
        let failure = match self.open_endpoint(&request).await {
            Ok(endpoint) => {
                self.endpoint = Some(endpoint);
                None
            }
            Err(e) => Some(e),
        };

        let reply = Socks5ReplyCode::from_outcome(failure.as_ref());
        let bind = self
            .endpoint
            .as_ref()
            .and_then(|endpoint| endpoint.local_addr().ok());
        self.client.send(&encode_reply(reply, bind)).await?;

        if let Some(source) = failure {
            return Err(Socks5Error::ConnectFailed {
                target: request.to_string(),
                reply,
                source,
            }
            .into());
        }

        if let Some(endpoint) = &self.endpoint {
            self.state = ConnectionState::Relaying;
            info!("Relaying to {}", request);

            let stats = relay(&self.client, endpoint, self.buffer_size, token).await;
            info!(
                "Connection to {} closed: {} bytes up, {} bytes down",
                request, stats.upstream, stats.downstream
            );
        }

        Ok(())
    }

    async fn open_endpoint(&self, request: &Request) -> io::Result<Transport> {
        let mut endpoint = self.client.new_of_same_kind();
        endpoint
            .bind(SocketAddr::new(self.endpoint_interface, 0))
            .await?;

        let target = match request.socket_addr() {
            Some(addr) => addr,
            None => resolve_first(&request.destination(), request.port).await?,
        };

        debug!("Connecting to {} over {}", target, endpoint.kind());
        endpoint.connect(target).await
    }

    /// Disconnect and drop the endpoint, then disconnect the client
    fn teardown(&mut self) {
        if let Some(endpoint) = self.endpoint.take() {
            if let Err(e) = endpoint.disconnect() {
                trace!("Endpoint disconnect failed: {}", e);
            }
        }
        if let Err(e) = self.client.disconnect() {
            trace!("Client disconnect failed: {}", e);
        }
    }
}
