//! SOCKS5 request parser
//!
//! Parses SOCKS5 requests from a received segment or datagram.

use crate::error::Socks5Error;
use crate::helper::decode_port;
use crate::socks::consts::*;
use crate::socks::types::{Request, RequestAddr};
use std::net::{Ipv4Addr, Ipv6Addr};

/// Parse a SOCKS5 request
///
/// The address type at offset 3 selects the layout of the rest of the
/// message; the port always follows the address payload, big-endian.
pub fn parse_request(bytes: &[u8]) -> Result<Request, Socks5Error> {
    require(bytes, REQUEST_HEADER_LEN)?;

    let version = bytes[0];
    let command = bytes[1];
    let reserved = bytes[2];
    let addr_type = bytes[3];

    let (address, port_offset) = match addr_type {
        SOCKS5_ADDR_TYPE_IPV4 => {
            require(bytes, REQUEST_HEADER_LEN + 4 + 2)?;
            let mut octets = [0u8; 4];
            octets.copy_from_slice(&bytes[4..8]);
            (RequestAddr::Ipv4(Ipv4Addr::from(octets)), 8)
        }

        SOCKS5_ADDR_TYPE_DOMAIN => {
            require(bytes, REQUEST_HEADER_LEN + 1)?;
            let domain_len = bytes[4] as usize;
            let end = 5 + domain_len;
            require(bytes, end + 2)?;

            let domain = std::str::from_utf8(&bytes[5..end])
                .map_err(|_| Socks5Error::InvalidDomain(String::from_utf8_lossy(&bytes[5..end]).into_owned()))?;
            (RequestAddr::Domain(domain.to_string()), end)
        }

        SOCKS5_ADDR_TYPE_IPV6 => {
            require(bytes, REQUEST_HEADER_LEN + 16 + 2)?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&bytes[4..20]);
            (RequestAddr::Ipv6(Ipv6Addr::from(octets)), 20)
        }

        other => return Err(Socks5Error::AddressTypeNotSupported(other)),
    };

    let port = decode_port(bytes[port_offset], bytes[port_offset + 1]);

    Ok(Request {
        version,
        command,
        reserved,
        address,
        port,
    })
}

fn require(bytes: &[u8], expected: usize) -> Result<(), Socks5Error> {
    if bytes.len() < expected {
        return Err(Socks5Error::Truncated {
            expected,
            actual: bytes.len(),
        });
    }
    Ok(())
}
