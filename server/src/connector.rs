//! Listeners, one per connector kind.
//!
//! A connector owns one transport address. While listening it accepts
//! clients and runs a [`RelaySession`] for each; on close it stops accepting,
//! frees the address immediately and gives in-flight sessions a bounded
//! grace period before cutting them off.

use std::{
    collections::HashMap,
    fmt,
    io,
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Instant,
};

use futures_util::future::BoxFuture;
use gpgbridge_common::{
    config::RelayConfig,
    rendezvous::remove_descriptor,
    BridgeConfig,
    CommonError,
    ConnectorKind,
    CygwinDescriptor,
    ListenAddress,
    LogicalAgent,
    PlatformListener,
    PlatformStream,
};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use uuid::Uuid;

use crate::{
    backend::BackendLocator,
    error::BridgeError,
    handshake::{fingerprint, AdapterKind, HandshakeAdapter},
    lock::LockController,
    relay::{RelayContext, RelaySession},
};

/// Fixed identity of a connector kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectorSpec {
    pub kind:    ConnectorKind,
    pub agent:   LogicalAgent,
    pub adapter: AdapterKind,
}

pub fn connector_spec(kind: ConnectorKind) -> ConnectorSpec {
    let (agent, adapter) = match kind {
        ConnectorKind::SockAgentCygwinSsh => (LogicalAgent::Ssh, AdapterKind::CygwinSecret),
        ConnectorKind::PipeSsh => (LogicalAgent::Ssh, AdapterKind::Passthrough),
        ConnectorKind::SockAgentSsh => (LogicalAgent::Ssh, AdapterKind::NativeSocket),
        ConnectorKind::ExtraPort => (LogicalAgent::Gpg, AdapterKind::Passthrough),
        ConnectorKind::SockAgent => (LogicalAgent::Gpg, AdapterKind::NativeSocket),
        ConnectorKind::SockAgentExtra => (LogicalAgent::GpgExtra, AdapterKind::NativeSocket),
    };
    ConnectorSpec {
        kind,
        agent,
        adapter,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorState {
    Idle,
    Listening,
    Draining,
    Closed,
    Failed,
}

impl fmt::Display for ConnectorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectorState::Idle => "idle",
            ConnectorState::Listening => "listening",
            ConnectorState::Draining => "draining",
            ConnectorState::Closed => "closed",
            ConnectorState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Lifetime counters of one connector
#[derive(Debug, Default)]
pub struct ConnectorStats {
    accepted:           AtomicU64,
    handshake_failures: AtomicU64,
    backend_failures:   AtomicU64,
    bytes_to_backend:   AtomicU64,
    bytes_to_client:    AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub accepted:           u64,
    pub handshake_failures: u64,
    pub backend_failures:   u64,
    pub bytes_to_backend:   u64,
    pub bytes_to_client:    u64,
}

impl ConnectorStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            accepted:           self.accepted.load(Ordering::Relaxed),
            handshake_failures: self.handshake_failures.load(Ordering::Relaxed),
            backend_failures:   self.backend_failures.load(Ordering::Relaxed),
            bytes_to_backend:   self.bytes_to_backend.load(Ordering::Relaxed),
            bytes_to_client:    self.bytes_to_client.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of a connector, as printed by the supervisor
#[derive(Debug, Clone)]
pub struct ConnectorStatus {
    pub kind:     ConnectorKind,
    pub state:    ConnectorState,
    pub address:  ListenAddress,
    pub sessions: usize,
    pub stats:    StatsSnapshot,
}

impl fmt::Display for ConnectorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<22} {:<9} {} sessions={} accepted={} handshake_failures={} backend_failures={}",
            self.kind.as_str(),
            self.state.to_string(),
            self.address,
            self.sessions,
            self.stats.accepted,
            self.stats.handshake_failures,
            self.stats.backend_failures,
        )
    }
}

#[derive(Debug)]
struct SessionEntry {
    peer:  String,
    since: Instant,
}

/// State shared between the connector handle and its accept loop
#[derive(Debug)]
struct Shared {
    spec:     ConnectorSpec,
    state:    Mutex<ConnectorState>,
    bound:    Mutex<Option<ListenAddress>>,
    sessions: Mutex<HashMap<Uuid, SessionEntry>>,
    stats:    ConnectorStats,
}

impl Shared {
    fn new(kind: ConnectorKind) -> Self {
        Self {
            spec:     connector_spec(kind),
            state:    Mutex::new(ConnectorState::Idle),
            bound:    Mutex::new(None),
            sessions: Mutex::new(HashMap::new()),
            stats:    ConnectorStats::default(),
        }
    }

    fn set_state(&self, state: ConnectorState) {
        let mut current = self.state.lock();
        if *current != state {
            tracing::debug!(kind = %self.spec.kind, from = %*current, to = %state, "connector state");
            *current = state;
        }
    }
}

/// One listening run, torn down by close
struct Running {
    accept_cancel:   CancellationToken,
    sessions_cancel: CancellationToken,
    tracker:         TaskTracker,
    accept_task:     JoinHandle<()>,
    descriptor:      Option<PathBuf>,
}

pub struct Connector {
    shared:  Arc<Shared>,
    address: ListenAddress,
    relay:   RelayConfig,
    locator: Arc<BackendLocator>,
    lock:    Arc<LockController>,
    run:     tokio::sync::Mutex<Option<Running>>,
}

impl fmt::Debug for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connector")
            .field("kind", &self.shared.spec.kind)
            .field("address", &self.address)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Connector {
    pub fn new(
        kind: ConnectorKind,
        cfg: &BridgeConfig,
        locator: Arc<BackendLocator>,
        lock: Arc<LockController>,
    ) -> Self {
        Self::with_address(kind, kind.listen_address(cfg), cfg.relay.clone(), locator, lock)
    }

    /// Build a connector for an explicit address instead of the configured one
    pub fn with_address(
        kind: ConnectorKind,
        address: ListenAddress,
        relay: RelayConfig,
        locator: Arc<BackendLocator>,
        lock: Arc<LockController>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared::new(kind)),
            address,
            relay,
            locator,
            lock,
            run: tokio::sync::Mutex::new(None),
        }
    }

    pub fn kind(&self) -> ConnectorKind {
        self.shared.spec.kind
    }

    pub fn spec(&self) -> ConnectorSpec {
        self.shared.spec
    }

    pub fn state(&self) -> ConnectorState {
        *self.shared.state.lock()
    }

    /// The address clients reach right now
    ///
    /// Ephemeral ports are resolved once the connector is listening.
    pub fn local_address(&self) -> ListenAddress {
        self.shared
            .bound
            .lock()
            .clone()
            .unwrap_or_else(|| self.address.clone())
    }

    pub fn active_sessions(&self) -> usize {
        self.shared.sessions.lock().len()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    pub fn status(&self) -> ConnectorStatus {
        ConnectorStatus {
            kind:     self.kind(),
            state:    self.state(),
            address:  self.local_address(),
            sessions: self.active_sessions(),
            stats:    self.stats(),
        }
    }

    /// Start listening
    ///
    /// A no-op while already listening. On a bind failure the connector is
    /// left in the state it was in.
    pub async fn serve(&self) -> Result<(), BridgeError> {
        let mut run = self.run.lock().await;
        let kind = self.kind();

        match self.state() {
            ConnectorState::Listening => return Ok(()),
            ConnectorState::Failed => {
                if let Some(previous) = run.take() {
                    self.shutdown(previous).await;
                }
            }
            _ => {}
        }

        let bind_error = |source: CommonError| BridgeError::Bind {
            kind,
            address: self.address.to_string(),
            source,
        };

        let listener = PlatformListener::bind(&self.address).await.map_err(bind_error)?;

        let mut bound = self.address.clone();
        let mut descriptor = None;
        let adapter = match self.shared.spec.adapter {
            AdapterKind::Passthrough => HandshakeAdapter::Passthrough,
            AdapterKind::NativeSocket => HandshakeAdapter::NativeSocket {
                expected_uid: current_uid(),
            },
            AdapterKind::CygwinSecret => {
                let (path, port) = match &self.address {
                    ListenAddress::EmulatedUnix { descriptor, .. } => {
                        (descriptor.clone(), listener.local_port().unwrap_or_default())
                    }
                    other => {
                        return Err(bind_error(CommonError::Unsupported(format!(
                            "cygwin handshake needs an emulated socket, not {other}"
                        ))))
                    }
                };
                let rendezvous = CygwinDescriptor::generate(port);
                rendezvous
                    .write(&path)
                    .map_err(|e| bind_error(CommonError::Io(e)))?;
                tracing::info!(
                    %kind,
                    descriptor = %path.display(),
                    port,
                    secret = %fingerprint(&rendezvous.secret),
                    "published emulated socket"
                );
                bound = ListenAddress::EmulatedUnix {
                    descriptor: path.clone(),
                    port,
                };
                descriptor = Some(path);
                HandshakeAdapter::CygwinSecret {
                    secret:  rendezvous.secret,
                    timeout: self.relay.handshake_timeout(),
                }
            }
        };
        if let ListenAddress::Tcp(addr) = &self.address {
            if let Some(port) = listener.local_port() {
                bound = ListenAddress::Tcp(std::net::SocketAddr::new(addr.ip(), port));
            }
        }

        let ctx = Arc::new(RelayContext {
            adapter: Arc::new(adapter),
            locator: self.locator.clone(),
            gate:    self.lock.gate(),
            retry:   self.relay.backend_retry,
        });
        let accept_cancel = CancellationToken::new();
        let sessions_cancel = CancellationToken::new();
        let tracker = TaskTracker::new();

        let accept_task = tokio::spawn(accept_loop(AcceptLoop {
            listener,
            shared: self.shared.clone(),
            ctx,
            relay: self.relay.clone(),
            cancel: accept_cancel.clone(),
            sessions_cancel: sessions_cancel.clone(),
            tracker: tracker.clone(),
        }));

        tracing::info!(%kind, address = %bound, "connector listening");
        *self.shared.bound.lock() = Some(bound);
        self.shared.set_state(ConnectorState::Listening);
        *run = Some(Running {
            accept_cancel,
            sessions_cancel,
            tracker,
            accept_task,
            descriptor,
        });
        Ok(())
    }

    /// Stop listening and drain sessions
    ///
    /// The address is free once this returns. Closing a connector that never
    /// served, or is already closed, does nothing.
    pub async fn close(&self) {
        let mut run = self.run.lock().await;
        let Some(running) = run.take() else {
            return;
        };
        self.shared.set_state(ConnectorState::Draining);
        self.shutdown(running).await;
        self.shared.set_state(ConnectorState::Closed);
        tracing::info!(kind = %self.kind(), "connector closed");
    }

    async fn shutdown(&self, running: Running) {
        let kind = self.kind();
        running.accept_cancel.cancel();
        if let Err(e) = running.accept_task.await {
            tracing::warn!(%kind, "accept loop ended abnormally: {e}");
        }

        running.tracker.close();
        let pending = running.tracker.len();
        if pending > 0 {
            tracing::debug!(%kind, pending, "draining sessions");
        }
        let drain = self.relay.drain_timeout();
        if tokio::time::timeout(drain, running.tracker.wait()).await.is_err() {
            let remaining = self.shared.sessions.lock().len();
            tracing::warn!(%kind, remaining, ?drain, "drain timed out, closing sessions");
            running.sessions_cancel.cancel();
            running.tracker.wait().await;
        }

        if let Some(path) = running.descriptor {
            if let Err(e) = remove_descriptor(&path) {
                tracing::warn!(%kind, path = %path.display(), "unable to remove descriptor: {e}");
            }
        }
        *self.shared.bound.lock() = None;
    }
}

#[cfg(unix)]
fn current_uid() -> Option<u32> {
    Some(nix::unistd::geteuid().as_raw())
}

#[cfg(not(unix))]
fn current_uid() -> Option<u32> {
    None
}

/// Consecutive accept failures, reset by every successful accept
#[derive(Debug)]
struct FailureBudget {
    consecutive: u32,
    limit:       u32,
}

impl FailureBudget {
    fn new(limit: u32) -> Self {
        Self {
            consecutive: 0,
            limit:       limit.max(1),
        }
    }

    fn reset(&mut self) {
        self.consecutive = 0;
    }

    /// Count one failure; true once the limit is reached
    fn record(&mut self) -> bool {
        self.consecutive = self.consecutive.saturating_add(1);
        self.consecutive >= self.limit
    }
}

/// Where the accept loop gets its clients from
trait Acceptor: Send + 'static {
    fn accept(&mut self) -> BoxFuture<'_, io::Result<(PlatformStream, String)>>;
}

impl Acceptor for PlatformListener {
    fn accept(&mut self) -> BoxFuture<'_, io::Result<(PlatformStream, String)>> {
        Box::pin(PlatformListener::accept(self))
    }
}

struct AcceptLoop<A> {
    listener:        A,
    shared:          Arc<Shared>,
    ctx:             Arc<RelayContext>,
    relay:           RelayConfig,
    cancel:          CancellationToken,
    sessions_cancel: CancellationToken,
    tracker:         TaskTracker,
}

async fn accept_loop<A: Acceptor>(mut lp: AcceptLoop<A>) {
    let kind = lp.shared.spec.kind;
    let mut failures = FailureBudget::new(lp.relay.max_accept_failures);

    loop {
        let accepted = tokio::select! {
            _ = lp.cancel.cancelled() => break,
            accepted = lp.listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                failures.reset();
                lp.shared.stats.accepted.fetch_add(1, Ordering::Relaxed);
                let session = RelaySession::new(kind, lp.shared.spec.agent, stream, peer);
                tracing::debug!(%kind, session = %session.id(), peer = session.peer(), "client accepted");
                lp.tracker.spawn(run_session(
                    session,
                    lp.shared.clone(),
                    lp.ctx.clone(),
                    lp.sessions_cancel.child_token(),
                ));
            }
            Err(e) => {
                let exhausted = failures.record();
                tracing::warn!(%kind, failures = failures.consecutive, "accept failed: {e}");
                if exhausted {
                    tracing::error!(%kind, "too many consecutive accept failures, giving up");
                    lp.shared.set_state(ConnectorState::Failed);
                    break;
                }
                tokio::select! {
                    _ = lp.cancel.cancelled() => break,
                    _ = tokio::time::sleep(lp.relay.accept_backoff()) => {}
                }
            }
        }
    }
    // Dropping the listener releases the address
}

async fn run_session(
    mut session: RelaySession,
    shared: Arc<Shared>,
    ctx: Arc<RelayContext>,
    cancel: CancellationToken,
) {
    let id = session.id();
    shared.sessions.lock().insert(
        id,
        SessionEntry {
            peer:  session.peer().to_string(),
            since: Instant::now(),
        },
    );

    let kind = shared.spec.kind;
    match session.run(&ctx, &cancel).await {
        Ok(outcome) => {
            shared
                .stats
                .bytes_to_backend
                .fetch_add(outcome.to_backend, Ordering::Relaxed);
            shared
                .stats
                .bytes_to_client
                .fetch_add(outcome.to_client, Ordering::Relaxed);
        }
        Err(e @ BridgeError::Handshake { .. }) => {
            shared.stats.handshake_failures.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(%kind, session = %id, "rejected client: {e}");
        }
        Err(e @ BridgeError::BackendUnavailable { .. }) => {
            shared.stats.backend_failures.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(%kind, session = %id, "{e}");
        }
        Err(BridgeError::Cancelled) => {}
        Err(e) => tracing::debug!(%kind, session = %id, "relay error: {e}"),
    }

    if let Some(entry) = shared.sessions.lock().remove(&id) {
        tracing::trace!(%kind, session = %id, peer = %entry.peer, lifetime = ?entry.since.elapsed(), "session removed");
    }
}
