//! SOCKS5 protocol module for Sockpump
//!
//! This module implements the SOCKS5 wire codec, the per-connection state
//! machine and the bidirectional relay between a client and its endpoint.

mod auth;
mod command;
mod consts;
mod handler;
mod relay;
mod types;

pub use auth::{handshake_reply, parse_handshake};
pub use command::{encode_reply, parse_request};
pub use consts::*;
pub use handler::{Connection, ConnectionState};
pub use relay::{relay, RelayStats};
pub use types::{Handshake, Request, RequestAddr, SocksCommand};
