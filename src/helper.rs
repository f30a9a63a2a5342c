//! Helper utilities for Sockpump
//!
//! This module provides common utility functions used throughout the application.

use crate::error::Socks5Error;

/// Buffer size used when the platform page size cannot be queried
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// Largest datagram a UDP socket can deliver
pub const MAX_DATAGRAM_SIZE: usize = 65535;

/// Encode a port as two big-endian bytes
///
/// Ports arrive from configuration as wider integers; anything above 65535
/// is rejected rather than truncated.
pub fn encode_port(port: u32) -> Result<[u8; 2], Socks5Error> {
    let port = u16::try_from(port).map_err(|_| Socks5Error::InvalidPort(port))?;
    Ok(port.to_be_bytes())
}

/// Decode a big-endian port
pub fn decode_port(high: u8, low: u8) -> u16 {
    u16::from_be_bytes([high, low])
}

/// Platform memory page size, the default relay buffer size
pub fn page_size() -> usize {
    #[cfg(unix)]
    {
        // SAFETY: sysconf has no preconditions and only reads system state.
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 {
            return size as usize;
        }
    }

    DEFAULT_BUFFER_SIZE
}
