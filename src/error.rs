//! Error types for Sockpump
//!
//! This module defines all custom error types used throughout the application.

use crate::socks::SocksCommand;
use std::io;
use thiserror::Error;

/// Main error type for Sockpump operations
#[derive(Error, Debug)]
pub enum ProxyError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// SOCKS5 protocol error
    #[error("SOCKS5 error: {0}")]
    Socks5(#[from] Socks5Error),

    /// Interface resolution error
    #[error("Interface error: {0}")]
    Interface(String),
}

/// SOCKS5 specific errors
///
/// Everything except [`Socks5Error::ConnectFailed`] is raised before an
/// endpoint is opened and ends the connection without a reply.
#[derive(Error, Debug)]
pub enum Socks5Error {
    /// Message shorter than its own header says it is
    #[error("Truncated message: expected {expected} bytes, got {actual}")]
    Truncated {
        /// Bytes required to parse the message
        expected: usize,
        /// Bytes actually available
        actual: usize,
    },

    /// Unsupported SOCKS version
    #[error("Unsupported SOCKS version: {0}")]
    UnsupportedVersion(u8),

    /// Address type not supported
    #[error("Address type not supported: {0}")]
    AddressTypeNotSupported(u8),

    /// Invalid domain name
    #[error("Invalid domain name: {0}")]
    InvalidDomain(String),

    /// Command byte outside the SOCKS5 command set
    #[error("Unknown command: {0}")]
    UnknownCommand(u8),

    /// Recognised command that this server does not implement
    #[error("Command not supported: {0}")]
    CommandNotSupported(SocksCommand),

    /// Port value does not fit in 16 bits
    #[error("Invalid port: {0} (ports range from 0 to 65535)")]
    InvalidPort(u32),

    /// Endpoint could not be reached; the client already got the reply
    #[error("Connection to {target} failed ({reply:?}): {source}")]
    ConnectFailed {
        /// Requested destination
        target: String,
        /// Reply code sent to the client
        reply: Socks5ReplyCode,
        /// Underlying socket error
        #[source]
        source: io::Error,
    },
}

impl Socks5Error {
    /// Whether this error is a malformed or unsupported message
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Socks5Error::Truncated { .. }
                | Socks5Error::UnsupportedVersion(_)
                | Socks5Error::AddressTypeNotSupported(_)
                | Socks5Error::InvalidDomain(_)
                | Socks5Error::UnknownCommand(_)
        )
    }
}

/// Reply codes for SOCKS5 protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Socks5ReplyCode {
    /// Command succeeded
    Succeeded = 0x00,
    /// General SOCKS server failure
    GeneralFailure = 0x01,
    /// Connection not allowed by ruleset
    ConnectionNotAllowed = 0x02,
    /// Network unreachable
    NetworkUnreachable = 0x03,
    /// Host unreachable
    HostUnreachable = 0x04,
    /// Connection refused
    ConnectionRefused = 0x05,
    /// TTL expired
    TtlExpired = 0x06,
    /// Command not supported
    CommandNotSupported = 0x07,
    /// Address type not supported
    AddressTypeNotSupported = 0x08,
}

impl Socks5ReplyCode {
    /// Reply code for the outcome of opening an endpoint.
    ///
    /// `None` means the endpoint was opened.
    pub fn from_outcome(error: Option<&io::Error>) -> Self {
        match error {
            None => Socks5ReplyCode::Succeeded,
            Some(e) => Socks5ReplyCode::from(e),
        }
    }
}

impl From<Socks5ReplyCode> for u8 {
    fn from(code: Socks5ReplyCode) -> Self {
        code as u8
    }
}

impl From<&io::Error> for Socks5ReplyCode {
    fn from(err: &io::Error) -> Self {
        #[cfg(unix)]
        if let Some(errno) = err.raw_os_error() {
            match errno {
                libc::ENETDOWN | libc::ENETUNREACH => return Socks5ReplyCode::NetworkUnreachable,
                libc::EHOSTDOWN | libc::EHOSTUNREACH => return Socks5ReplyCode::HostUnreachable,
                _ => {}
            }
        }

        match err.kind() {
            io::ErrorKind::NetworkDown | io::ErrorKind::NetworkUnreachable => {
                Socks5ReplyCode::NetworkUnreachable
            }
            io::ErrorKind::HostUnreachable => Socks5ReplyCode::HostUnreachable,
            io::ErrorKind::ConnectionRefused => Socks5ReplyCode::ConnectionRefused,
            io::ErrorKind::TimedOut => Socks5ReplyCode::TtlExpired,
            _ => Socks5ReplyCode::GeneralFailure,
        }
    }
}
