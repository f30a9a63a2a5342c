//! SOCKS5 server
//!
//! Owns one TCP listener and one UDP listener on the same address and port,
//! and spawns a [`Connection`] task for every client either of them accepts.

use crate::config::ServerSettings;
use crate::socks::Connection;
use crate::transport::{TcpTransport, Transport, UdpTransport};
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

/// Pause after a failed accept before trying again
const ACCEPT_ERROR_DELAY: Duration = Duration::from_millis(100);

/// Bound SOCKS5 server
#[derive(Debug)]
pub struct Server {
    settings: ServerSettings,
    tcp: Transport,
    udp: Transport,
}

impl Server {
    /// Bind both listeners
    ///
    /// With port 0 the UDP listener reuses the port the TCP listener got.
    pub async fn bind(settings: ServerSettings) -> Result<Self> {
        let local = SocketAddr::new(settings.listen_addr, settings.port);

        let mut tcp = Transport::from(TcpTransport::new());
        tcp.bind(local).await?;
        tcp.listen(settings.backlog)
            .with_context(|| format!("Failed to listen on tcp {}", local))?;

        let local = SocketAddr::new(settings.listen_addr, tcp.local_addr()?.port());
        let mut udp = Transport::from(
            UdpTransport::new().with_idle_timeout(settings.udp_session_timeout),
        );
        udp.bind(local)
            .await
            .with_context(|| format!("Failed to bind udp {}", local))?;
        udp.listen(settings.backlog)?;

        info!(
            "Listening on tcp {} and udp {}",
            tcp.local_addr()?,
            udp.local_addr()?
        );

        Ok(Server { settings, tcp, udp })
    }

    /// Settings the server was bound with
    pub fn settings(&self) -> &ServerSettings {
        &self.settings
    }

    /// Address of the TCP listener
    pub fn tcp_addr(&self) -> Result<SocketAddr> {
        Ok(self.tcp.local_addr()?)
    }

    /// Address of the UDP listener
    pub fn udp_addr(&self) -> Result<SocketAddr> {
        Ok(self.udp.local_addr()?)
    }

    /// Accept clients until `token` is cancelled
    pub async fn run(self, token: CancellationToken) -> Result<()> {
        info!("Starting SOCKS5 server");

        tokio::join!(
            self.accept_loop(&self.tcp, &token),
            self.accept_loop(&self.udp, &token),
        );

        if let Err(e) = self.udp.disconnect() {
            warn!("Failed to close udp listener: {}", e);
        }

        info!("Server stopped");
        Ok(())
    }

    async fn accept_loop(&self, listener: &Transport, token: &CancellationToken) {
        loop {
            let accepted = tokio::select! {
                _ = token.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok(client) => {
                    let connection = Connection::new(
                        client,
                        self.settings.endpoint_addr,
                        self.settings.buffer_size,
                    );
                    let span = info_span!("conn", id = %connection.id());
                    tokio::spawn(connection.handle(token.child_token()).instrument(span));
                }
                Err(e) => {
                    warn!("Failed to accept {} connection: {}", listener.kind(), e);
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(ACCEPT_ERROR_DELAY) => {}
                    }
                }
            }
        }
    }
}
