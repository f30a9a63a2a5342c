//! # Sockpump - SOCKS5 proxy server
//!
//! Sockpump accepts SOCKS5 clients over TCP and over UDP, opens an endpoint
//! connection of the same kind toward the requested destination and relays
//! bytes both ways until either side closes.
//!
//! ## Features
//!
//! - **CONNECT over TCP and UDP**: one listener of each kind on the same port
//! - **Emulated UDP connections**: datagrams are demultiplexed by source
//!   address into sessions that behave like streams
//! - **Idle UDP eviction**: sessions without traffic are reclaimed
//! - **Interface selection**: listen and endpoint sides bind to configurable
//!   interfaces
//!
//! ## Usage
//!
//! ```rust,ignore
//! use sockpump::config::{ServerSettings, SystemInterfaces};
//! use sockpump::server::Server;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = sockpump::load_config("sockpump.conf")?;
//!     let settings = ServerSettings::from_config(&config, &SystemInterfaces)?;
//!
//!     Server::bind(settings).await?.run(CancellationToken::new()).await
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! Client -> Server -> Connection -> Endpoint transport -> Target
//!                        |
//!                      Relay
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod error;
pub mod helper;
pub mod server;
pub mod socks;
pub mod transport;

// Re-export commonly used items
pub use config::{load_config, Config, ServerSettings};
pub use error::{ProxyError, Socks5Error, Socks5ReplyCode};
pub use server::Server;

/// Version of the Sockpump library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Name of the application
pub const NAME: &str = env!("CARGO_PKG_NAME");
