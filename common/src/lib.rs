//! gpgbridge common library
//!
//! Shared pieces used by both the relay core and its clients:
//!
//! - Configuration structures, connector identities and their addresses
//! - Platform-specific listeners and streams (Unix domain sockets, Windows
//!   named pipes, loopback TCP)
//! - Bit-exact rendezvous descriptor formats (Cygwin emulated sockets and
//!   gpg-agent's assuan socket files)

/// Configuration structures and connector identities
pub mod config;

/// Error type shared by this crate
pub mod error;

/// Platform-specific socket implementations
pub mod platform_socket;

/// Rendezvous descriptor wire formats
pub mod rendezvous;

// Re-export commonly used types for convenience
pub use config::{BridgeConfig, ConnectorKind, LogicalAgent, RetryPolicy, SshCompat};
pub use error::CommonError;
pub use platform_socket::{ListenAddress, PlatformListener, PlatformStream};
pub use rendezvous::{AssuanDescriptor, CygwinCredentials, CygwinDescriptor};
