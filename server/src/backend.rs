//! Locating and dialing the real agent.
//!
//! The backend publishes a rendezvous descriptor per logical agent in its
//! home directory. It is read again on every dial, so a restarted backend is
//! picked up without restarting any connector.

use std::{
    io,
    net::{Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
    time::SystemTime,
};

use gpgbridge_common::{AssuanDescriptor, LogicalAgent, PlatformStream, RetryPolicy};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::{error::BridgeError, lock::LockGate};

/// Where a backend can be reached right now
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendAddress {
    /// A real AF_UNIX socket
    Unix(PathBuf),
    /// Loopback port guarded by a nonce
    Loopback(AssuanDescriptor),
}

/// Snapshot of a backend descriptor
#[derive(Debug, Clone)]
pub struct BackendDescriptor {
    pub agent:    LogicalAgent,
    pub address:  BackendAddress,
    /// Modification time of the descriptor when it was read
    pub modified: Option<SystemTime>,
}

/// Resolves logical agents to live connections
#[derive(Debug, Clone)]
pub struct BackendLocator {
    home: PathBuf,
}

impl BackendLocator {
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self { home: home.into() }
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    pub fn descriptor_path(&self, agent: LogicalAgent) -> PathBuf {
        self.home.join(agent.descriptor_name())
    }

    /// Read the agent's current descriptor
    pub async fn resolve(&self, agent: LogicalAgent) -> Result<BackendDescriptor, BridgeError> {
        let path = self.descriptor_path(agent);
        let metadata = tokio::fs::metadata(&path).await.map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                BridgeError::unavailable(agent, format!("no descriptor at {}", path.display()))
            } else {
                BridgeError::unavailable(agent, format!("{}: {e}", path.display()))
            }
        })?;
        let modified = metadata.modified().ok();

        #[cfg(unix)]
        {
            use std::os::unix::fs::FileTypeExt;
            if metadata.file_type().is_socket() {
                return Ok(BackendDescriptor {
                    agent,
                    address: BackendAddress::Unix(path),
                    modified,
                });
            }
        }

        let data = tokio::fs::read(&path)
            .await
            .map_err(|e| BridgeError::unavailable(agent, format!("{}: {e}", path.display())))?;
        let descriptor = AssuanDescriptor::parse(&data)
            .map_err(|e| BridgeError::unavailable(agent, format!("{}: {e}", path.display())))?;

        Ok(BackendDescriptor {
            agent,
            address: BackendAddress::Loopback(descriptor),
            modified,
        })
    }

    /// Resolve and connect once
    pub async fn dial(&self, agent: LogicalAgent) -> Result<PlatformStream, BridgeError> {
        let descriptor = self.resolve(agent).await?;
        match descriptor.address {
            BackendAddress::Unix(path) => PlatformStream::connect_unix(&path)
                .await
                .map_err(|e| BridgeError::unavailable(agent, e)),
            BackendAddress::Loopback(assuan) => {
                let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, assuan.port));
                let mut stream = PlatformStream::connect_tcp(addr)
                    .await
                    .map_err(|e| BridgeError::unavailable(agent, format!("{addr}: {e}")))?;
                stream
                    .write_all(&assuan.nonce)
                    .await
                    .map_err(|e| BridgeError::unavailable(agent, format!("sending nonce: {e}")))?;
                Ok(stream)
            }
        }
    }

    /// Dial, retrying per `policy` while the backend may still be starting
    ///
    /// Every attempt first waits for `gate` to be unlocked, so a lock that
    /// arrives mid-handshake or between retries still defers the dial.
    pub async fn dial_with_retry(
        &self,
        agent: LogicalAgent,
        policy: &RetryPolicy,
        gate: &mut LockGate,
        cancel: &CancellationToken,
    ) -> Result<PlatformStream, BridgeError> {
        let mut attempt = 0;
        loop {
            if gate.is_locked() {
                tracing::debug!(%agent, "session locked, deferring backend dial");
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(BridgeError::Cancelled),
                unlocked = gate.wait_unlocked() => unlocked?,
            }
            match self.dial(agent).await {
                Ok(stream) => return Ok(stream),
                Err(e) if attempt < policy.attempts => {
                    attempt += 1;
                    let delay = policy.delay_for(attempt);
                    tracing::debug!(%agent, attempt, ?delay, "backend dial failed, retrying: {e}");
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(BridgeError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}
