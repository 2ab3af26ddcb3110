//! gpgbridge client library
//!
//! Reaches a gpgbridge connector the way its client ecosystem would: a plain
//! connect for native sockets, pipes and TCP, or the Cygwin emulated-socket
//! handshake when the address is a descriptor file.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use gpgbridge_client::{AgentClient, ClientConfig};
//! use gpgbridge_common::{BridgeConfig, ConnectorKind};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let cfg = BridgeConfig::from_env()?;
//! let config = ClientConfig::for_kind(ConnectorKind::SockAgent, &cfg)
//!     .with_timeout(Duration::from_secs(5));
//!
//! let mut client = AgentClient::new(config);
//! client.connect().await?;
//! client.send(b"GETINFO version\n").await?;
//! # Ok(())
//! # }
//! ```

mod client;

pub use client::*;
// Re-export important types from gpgbridge-common for convenience
pub use gpgbridge_common::{ConnectorKind, CygwinCredentials, ListenAddress};
