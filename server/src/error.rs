use std::io;

use gpgbridge_common::{CommonError, ConnectorKind, LogicalAgent};
use thiserror::Error;

/// Errors surfaced by connectors, relay sessions and the environment publisher
#[derive(Debug, Error)]
pub enum BridgeError {
    /// A connector could not take its transport address
    #[error("{kind}: cannot listen on {address}: {source}")]
    Bind {
        kind:    ConnectorKind,
        address: String,
        #[source]
        source:  CommonError,
    },

    /// A client failed the negotiation its connector requires
    #[error("handshake failed: {reason}")]
    Handshake { reason: String },

    /// The backend descriptor is missing, malformed or refuses connections
    #[error("{agent} agent unavailable: {reason}")]
    BackendUnavailable { agent: LogicalAgent, reason: String },

    /// Publishing a variable failed; everything published before it was rolled back
    #[error("unable to publish {name}: {source}")]
    EnvApply {
        name:   String,
        #[source]
        source: io::Error,
    },

    #[error("connector {0} is not configured")]
    UnknownConnector(ConnectorKind),

    /// The session was closed from our side
    #[error("session cancelled")]
    Cancelled,

    #[error(transparent)]
    Common(#[from] CommonError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl BridgeError {
    pub(crate) fn handshake(reason: impl Into<String>) -> Self {
        BridgeError::Handshake {
            reason: reason.into(),
        }
    }

    pub(crate) fn unavailable(agent: LogicalAgent, reason: impl ToString) -> Self {
        BridgeError::BackendUnavailable {
            agent,
            reason: reason.to_string(),
        }
    }
}
