//! Session lock propagation.
//!
//! One writer (the controller) and any number of [`LockGate`] readers, one
//! per relay session. Sessions accepted while locked park on their gate
//! before reading a single client byte or dialing the backend.

use std::{fmt, sync::Arc, time::Duration};

use futures_util::future::BoxFuture;
use gpgbridge_common::LogicalAgent;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    sync::watch,
};

use crate::{backend::BackendLocator, error::BridgeError};

const NOTIFY_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Unlocked,
    Locked,
}

impl fmt::Display for LockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockState::Unlocked => f.write_str("unlocked"),
            LockState::Locked => f.write_str("locked"),
        }
    }
}

/// Tells the backend to drop cached passphrases
pub trait BackendNotifier: Send + Sync {
    fn forget_secrets(&self) -> BoxFuture<'_, Result<(), BridgeError>>;
}

/// Sends `RELOADAGENT` to gpg-agent, which flushes its passphrase cache
#[derive(Debug, Clone)]
pub struct ReloadAgentNotifier {
    locator: Arc<BackendLocator>,
}

impl ReloadAgentNotifier {
    pub fn new(locator: Arc<BackendLocator>) -> Self {
        Self { locator }
    }
}

impl BackendNotifier for ReloadAgentNotifier {
    fn forget_secrets(&self) -> BoxFuture<'_, Result<(), BridgeError>> {
        Box::pin(async move {
            let mut stream = self.locator.dial(LogicalAgent::Gpg).await?;
            stream.write_all(b"RELOADAGENT\nBYE\n").await?;
            stream.flush().await?;
            // Replies are not interpreted, only drained until the agent hangs up
            let mut sink = Vec::new();
            let _ = tokio::time::timeout(NOTIFY_TIMEOUT, stream.read_to_end(&mut sink)).await;
            Ok(())
        })
    }
}

/// Process-wide lock state
pub struct LockController {
    state:    watch::Sender<LockState>,
    notifier: Option<Arc<dyn BackendNotifier>>,
}

impl Default for LockController {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for LockController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockController")
            .field("state", &self.state())
            .field("notifier", &self.notifier.is_some())
            .finish()
    }
}

impl LockController {
    pub fn new() -> Self {
        let (state, _) = watch::channel(LockState::Unlocked);
        Self {
            state,
            notifier: None,
        }
    }

    pub fn with_notifier(notifier: Arc<dyn BackendNotifier>) -> Self {
        Self {
            notifier: Some(notifier),
            ..Self::new()
        }
    }

    pub fn state(&self) -> LockState {
        *self.state.borrow()
    }

    /// A reader for one session
    pub fn gate(&self) -> LockGate {
        LockGate {
            state: self.state.subscribe(),
        }
    }

    /// Lock the session; returns false when it was already locked
    ///
    /// The backend is asked to forget cached secrets, best-effort.
    pub async fn session_lock(&self) -> bool {
        if !self.transition(LockState::Locked) {
            return false;
        }
        tracing::info!("session locked, deferring new backend connections");

        if let Some(notifier) = &self.notifier {
            match tokio::time::timeout(NOTIFY_TIMEOUT, notifier.forget_secrets()).await {
                Ok(Ok(())) => tracing::debug!("backend asked to forget cached secrets"),
                Ok(Err(e)) => tracing::warn!("unable to notify backend of session lock: {e}"),
                Err(_) => tracing::warn!("backend did not acknowledge session lock in time"),
            }
        }
        true
    }

    /// Unlock the session; returns false when it was not locked
    pub fn session_unlock(&self) -> bool {
        let changed = self.transition(LockState::Unlocked);
        if changed {
            tracing::info!("session unlocked, resuming deferred connections");
        }
        changed
    }

    fn transition(&self, to: LockState) -> bool {
        self.state.send_if_modified(|state| {
            if *state == to {
                false
            } else {
                *state = to;
                true
            }
        })
    }
}

/// Read side of the lock state, held by a relay session
#[derive(Debug, Clone)]
pub struct LockGate {
    state: watch::Receiver<LockState>,
}

impl LockGate {
    pub fn is_locked(&self) -> bool {
        *self.state.borrow() == LockState::Locked
    }

    /// Wait until the session is unlocked; returns immediately when it is
    pub async fn wait_unlocked(&mut self) -> Result<(), BridgeError> {
        self.state
            .wait_for(|state| *state == LockState::Unlocked)
            .await
            .map(|_| ())
            .map_err(|_| BridgeError::Cancelled)
    }
}
