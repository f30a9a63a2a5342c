//! Bidirectional relay between a client and its endpoint
//!
//! Two copy loops run concurrently, one per direction. When a loop sees the
//! end of its source it closes the opposite transport, which in turn ends
//! the other loop.

use crate::transport::Transport;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Bytes moved by a finished relay
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Client to endpoint
    pub upstream: u64,
    /// Endpoint to client
    pub downstream: u64,
}

impl RelayStats {
    /// Total bytes in both directions
    pub fn total(&self) -> u64 {
        self.upstream + self.downstream
    }
}

/// Relay data between `client` and `endpoint` until both directions finish
///
/// Each direction owns a buffer of `buffer_size` bytes, or a full datagram
/// when it reads from UDP. Cancelling `token` ends both loops at their next
/// receive or send.
pub async fn relay(
    client: &Transport,
    endpoint: &Transport,
    buffer_size: usize,
    token: &CancellationToken,
) -> RelayStats {
    let (upstream, downstream) = tokio::join!(
        pump(client, endpoint, buffer_size, token, "client->endpoint"),
        pump(endpoint, client, buffer_size, token, "endpoint->client"),
    );

    RelayStats {
        upstream,
        downstream,
    }
}

/// Copy from `source` to `sink` until end of stream, error or cancellation
async fn pump(
    source: &Transport,
    sink: &Transport,
    buffer_size: usize,
    token: &CancellationToken,
    direction: &'static str,
) -> u64 {
    let mut buf = vec![0u8; source.receive_buffer_size(buffer_size)];
    let mut total = 0u64;

    loop {
        let received = tokio::select! {
            _ = token.cancelled() => {
                trace!("{} cancelled after {} bytes", direction, total);
                return total;
            }
            received = source.receive(&mut buf) => received,
        };

        let n = match received {
            Ok(0) => {
                debug!("{} finished: {} bytes", direction, total);
                close(sink, direction);
                return total;
            }
            Ok(n) => n,
            Err(e) => {
                debug!("{} receive error after {} bytes: {}", direction, total, e);
                close(sink, direction);
                return total;
            }
        };

        let sent = tokio::select! {
            _ = token.cancelled() => {
                trace!("{} cancelled after {} bytes", direction, total);
                return total;
            }
            sent = sink.send(&buf[..n]) => sent,
        };

        if let Err(e) = sent {
            debug!("{} send error after {} bytes: {}", direction, total, e);
            close(sink, direction);
            return total;
        }
        total += n as u64;
    }
}

fn close(transport: &Transport, direction: &'static str) {
    if let Err(e) = transport.disconnect() {
        trace!("{} close of opposite side failed: {}", direction, e);
    }
}
