//! SOCKS5 request parsing module
//!
//! Handles parsing SOCKS5 requests and encoding replies.

mod parser;
mod reply;

pub use parser::parse_request;
pub use reply::encode_reply;
