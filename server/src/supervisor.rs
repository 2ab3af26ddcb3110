//! Composition root owning every connector, the lock state and the
//! published environment.

use std::{fmt::Write as _, sync::Arc};

use gpgbridge_common::{BridgeConfig, ConnectorKind};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use crate::{
    backend::BackendLocator,
    connector::Connector,
    environment::{standard_entries, EnvironmentPublisher},
    error::BridgeError,
    lock::{LockController, LockState, ReloadAgentNotifier},
};

/// External inputs delivered to a running supervisor
#[derive(Debug)]
pub enum SupervisorEvent {
    /// The OS session was locked
    SessionLock,
    SessionUnlock,
    /// Reply with the current status text
    Status(oneshot::Sender<String>),
    Stop,
}

pub struct AgentSupervisor {
    cfg:        BridgeConfig,
    locator:    Arc<BackendLocator>,
    lock:       Arc<LockController>,
    connectors: Vec<Connector>,
    env:        Mutex<EnvironmentPublisher>,
}

impl std::fmt::Debug for AgentSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentSupervisor")
            .field("connectors", &self.connectors)
            .field("lock", &self.lock)
            .finish_non_exhaustive()
    }
}

impl AgentSupervisor {
    /// Build every enabled connector without starting any of them
    pub fn new(cfg: BridgeConfig) -> Self {
        let locator = Arc::new(BackendLocator::new(&cfg.gpg.home));
        let lock = Arc::new(LockController::with_notifier(Arc::new(ReloadAgentNotifier::new(
            locator.clone(),
        ))));
        Self::with_parts(cfg, locator, lock, EnvironmentPublisher::for_platform())
    }

    pub fn with_parts(
        cfg: BridgeConfig,
        locator: Arc<BackendLocator>,
        lock: Arc<LockController>,
        env: EnvironmentPublisher,
    ) -> Self {
        let connectors = cfg
            .enabled_connectors()
            .into_iter()
            .map(|kind| Connector::new(kind, &cfg, locator.clone(), lock.clone()))
            .collect();
        Self {
            cfg,
            locator,
            lock,
            connectors,
            env: Mutex::new(env),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.cfg
    }

    pub fn locator(&self) -> &BackendLocator {
        &self.locator
    }

    pub fn lock(&self) -> &LockController {
        &self.lock
    }

    pub fn connectors(&self) -> &[Connector] {
        &self.connectors
    }

    pub fn connector(&self, kind: ConnectorKind) -> Option<&Connector> {
        self.connectors.iter().find(|c| c.kind() == kind)
    }

    /// Serve every connector in configured order, then publish variables
    ///
    /// Stops at the first bind error; connectors already listening stay up.
    pub async fn start(&self) -> Result<(), BridgeError> {
        tracing::info!(
            connectors = self.connectors.len(),
            gpg_home = %self.locator.home().display(),
            "starting bridge"
        );
        for connector in &self.connectors {
            connector.serve().await?;
        }

        if self.cfg.gui.set_env {
            self.env.lock().apply(standard_entries(&self.cfg))?;
        }
        Ok(())
    }

    /// Close every connector, newest first, then revoke published variables
    pub async fn stop(&self) {
        for connector in self.connectors.iter().rev() {
            connector.close().await;
        }
        let mut env = self.env.lock();
        if env.is_applied() {
            env.revoke();
        }
        tracing::info!("bridge stopped");
    }

    pub async fn serve(&self, kind: ConnectorKind) -> Result<(), BridgeError> {
        self.connector(kind)
            .ok_or(BridgeError::UnknownConnector(kind))?
            .serve()
            .await
    }

    pub async fn close(&self, kind: ConnectorKind) -> Result<(), BridgeError> {
        self.connector(kind)
            .ok_or(BridgeError::UnknownConnector(kind))?
            .close()
            .await;
        Ok(())
    }

    pub async fn session_lock(&self) -> bool {
        self.lock.session_lock().await
    }

    pub fn session_unlock(&self) -> bool {
        self.lock.session_unlock()
    }

    pub fn lock_state(&self) -> LockState {
        self.lock.state()
    }

    /// Human readable snapshot of the whole bridge
    pub fn status(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "session: {}", self.lock.state());
        for connector in &self.connectors {
            let _ = writeln!(out, "{}", connector.status());
        }
        let env = self.env.lock();
        let _ = writeln!(out, "environment: {} variables published", env.applied().len());
        out
    }

    /// Process events until `Stop` or until every sender is gone
    ///
    /// The bridge is stopped before this returns.
    pub async fn run(&self, mut events: mpsc::Receiver<SupervisorEvent>) {
        while let Some(event) = events.recv().await {
            tracing::debug!(?event, "supervisor event");
            match event {
                SupervisorEvent::SessionLock => {
                    self.session_lock().await;
                }
                SupervisorEvent::SessionUnlock => {
                    self.session_unlock();
                }
                SupervisorEvent::Status(reply) => {
                    let _ = reply.send(self.status());
                }
                SupervisorEvent::Stop => break,
            }
        }
        self.stop().await;
    }
}
