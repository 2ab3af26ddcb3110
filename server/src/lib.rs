//! gpgbridge relay core
//!
//! Exposes one gpg/ssh agent through several IPC endpoints at once:
//!
//! - [`connector::Connector`] owns one listening transport and spawns a
//!   [`relay::RelaySession`] per client
//! - [`handshake::HandshakeAdapter`] runs whatever negotiation the client's
//!   ecosystem expects before bytes flow
//! - [`backend::BackendLocator`] finds the real agent through the descriptor
//!   it publishes, fresh on every dial
//! - [`lock::LockController`] holds new sessions back while the user session
//!   is locked
//! - [`environment::EnvironmentPublisher`] tells clients where to connect
//! - [`supervisor::AgentSupervisor`] composes all of the above
//! - [`instance::InstanceGuard`] keeps a second bridge from starting

pub mod backend;
pub mod connector;
pub mod environment;
pub mod error;
pub mod handshake;
pub mod instance;
pub mod lock;
pub mod relay;
pub mod supervisor;

pub use connector::{Connector, ConnectorState, ConnectorStatus};
pub use error::BridgeError;
pub use instance::InstanceGuard;
pub use lock::{LockController, LockState};
pub use supervisor::{AgentSupervisor, SupervisorEvent};
