//! One accepted client, bridged to one backend connection.

use std::{fmt, io, sync::Arc, time::Instant};

use gpgbridge_common::{ConnectorKind, LogicalAgent, PlatformStream, RetryPolicy};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    backend::BackendLocator,
    error::BridgeError,
    handshake::HandshakeAdapter,
    lock::LockGate,
};

const RELAY_BUFFER: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Handshaking,
    Relaying,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Handshaking => f.write_str("handshaking"),
            SessionState::Relaying => f.write_str("relaying"),
            SessionState::Closed => f.write_str("closed"),
        }
    }
}

/// Everything a session borrows from its connector
#[derive(Debug)]
pub struct RelayContext {
    pub adapter: Arc<HandshakeAdapter>,
    pub locator: Arc<BackendLocator>,
    pub gate:    LockGate,
    pub retry:   RetryPolicy,
}

/// Byte counts of a finished relay
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayOutcome {
    /// Client to backend
    pub to_backend: u64,
    /// Backend to client
    pub to_client:  u64,
}

pub struct RelaySession {
    id:      Uuid,
    kind:    ConnectorKind,
    agent:   LogicalAgent,
    peer:    String,
    client:  PlatformStream,
    state:   SessionState,
    started: Instant,
}

impl fmt::Debug for RelaySession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelaySession")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("agent", &self.agent)
            .field("peer", &self.peer)
            .field("transport", &self.client.transport())
            .field("state", &self.state)
            .finish()
    }
}

impl RelaySession {
    pub fn new(kind: ConnectorKind, agent: LogicalAgent, client: PlatformStream, peer: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            agent,
            peer,
            client,
            state: SessionState::Handshaking,
            started: Instant::now(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Drive the session to completion
    ///
    /// Waits out a session lock, negotiates, dials the backend and then
    /// copies bytes both ways until either side reaches end of stream or
    /// fails. Both connections are closed together at that point, and
    /// cancelling `cancel` does the same. The session is `Closed` when this
    /// returns, whatever the outcome.
    pub async fn run(
        &mut self,
        ctx: &RelayContext,
        cancel: &CancellationToken,
    ) -> Result<RelayOutcome, BridgeError> {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(BridgeError::Cancelled),
            result = self.drive(ctx, cancel) => result,
        };
        self.state = SessionState::Closed;

        let elapsed = self.started.elapsed();
        match &result {
            Ok(outcome) => tracing::debug!(
                session = %self.id,
                kind = %self.kind,
                to_backend = outcome.to_backend,
                to_client = outcome.to_client,
                ?elapsed,
                "session finished"
            ),
            Err(e) => tracing::debug!(session = %self.id, kind = %self.kind, ?elapsed, "session ended: {e}"),
        }
        result
    }

    async fn drive(
        &mut self,
        ctx: &RelayContext,
        cancel: &CancellationToken,
    ) -> Result<RelayOutcome, BridgeError> {
        let mut gate = ctx.gate.clone();
        if gate.is_locked() {
            tracing::debug!(session = %self.id, "session locked, holding client");
        }
        gate.wait_unlocked().await?;

        let peer_uid = self.client.peer_uid();
        ctx.adapter.negotiate(&mut self.client, peer_uid).await?;

        let mut backend = ctx
            .locator
            .dial_with_retry(self.agent, &ctx.retry, &mut gate, cancel)
            .await?;
        self.state = SessionState::Relaying;
        tracing::trace!(session = %self.id, agent = %self.agent, "relaying");

        let mut outcome = RelayOutcome::default();
        let result = {
            let (client_rd, client_wr) = tokio::io::split(&mut self.client);
            let (backend_rd, backend_wr) = tokio::io::split(&mut backend);
            tokio::select! {
                result = pump(client_rd, backend_wr, &mut outcome.to_backend) => ("client", result),
                result = pump(backend_rd, client_wr, &mut outcome.to_client) => ("backend", result),
            }
        };
        drop(backend);
        let _ = self.client.shutdown().await;

        match result {
            (side, Ok(())) => {
                tracing::trace!(session = %self.id, side, "end of stream");
                Ok(outcome)
            }
            (_, Err(e)) => Err(e.into()),
        }
    }
}

/// Copy one direction until end of stream, counting forwarded bytes
async fn pump<R, W>(mut from: R, mut to: W, forwarded: &mut u64) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER];
    loop {
        let n = from.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        to.write_all(&buf[..n]).await?;
        to.flush().await?;
        *forwarded += n as u64;
    }
}
