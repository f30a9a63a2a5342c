//! SOCKS5 method negotiation
//!
//! Only "no authentication" is offered: the reply selects it whatever the
//! client proposed.

use super::consts::*;
use super::types::Handshake;
use crate::error::Socks5Error;

/// Parse the method-selection message
///
/// ```text
/// +----+----------+----------+
/// |VER | NMETHODS | METHODS  |
/// +----+----------+----------+
/// | 1  |    1     | 1 to 255 |
/// +----+----------+----------+
/// ```
pub fn parse_handshake(bytes: &[u8]) -> Result<Handshake, Socks5Error> {
    if bytes.len() < 2 {
        return Err(Socks5Error::Truncated {
            expected: 2,
            actual: bytes.len(),
        });
    }

    let version = bytes[0];
    let method_count = bytes[1];
    let expected = 2 + method_count as usize;

    if bytes.len() < expected {
        return Err(Socks5Error::Truncated {
            expected,
            actual: bytes.len(),
        });
    }

    Ok(Handshake {
        version,
        method_count,
        methods: bytes[2..expected].to_vec(),
    })
}

/// Method-selection reply: always version 5, no authentication
pub fn handshake_reply() -> [u8; 2] {
    [SOCKS5_VERSION, SOCKS5_AUTH_METHOD_NONE]
}
