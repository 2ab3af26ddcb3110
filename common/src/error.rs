use std::io;

use thiserror::Error;

/// Errors raised by the shared transport, descriptor and configuration code
#[derive(Debug, Error)]
pub enum CommonError {
    /// Configuration could not be read or is invalid
    #[error("configuration error: {0}")]
    Config(String),

    /// A rendezvous descriptor is missing required parts or is not valid
    #[error("malformed descriptor: {0}")]
    Descriptor(String),

    /// The transport is not available on this platform
    #[error("unsupported on this platform: {0}")]
    Unsupported(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}
