//! Shared fixtures: an echoing stand-in backend and isolated configurations.

#![allow(dead_code)]

use std::{
    path::Path,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use gpgbridge_client::{AgentClient, ClientConfig};
use gpgbridge_common::{AssuanDescriptor, BridgeConfig, LogicalAgent, RetryPolicy};
use gpgbridge_server::connector::Connector;
use tokio::{
    io::AsyncReadExt,
    net::TcpListener,
    task::JoinHandle,
};

pub const NONCE: [u8; 16] = *b"gpgbridge-nonce!";

/// Echo backend publishing an assuan descriptor for every logical agent
pub struct EchoBackend {
    dials: Arc<AtomicUsize>,
    open:  Arc<AtomicUsize>,
    tasks: Vec<JoinHandle<()>>,
}

impl EchoBackend {
    pub async fn start(home: &Path) -> Self {
        std::fs::create_dir_all(home).unwrap();
        let dials = Arc::new(AtomicUsize::new(0));
        let open = Arc::new(AtomicUsize::new(0));
        let mut tasks = Vec::new();
        for agent in [LogicalAgent::Gpg, LogicalAgent::GpgExtra, LogicalAgent::Ssh] {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let descriptor = AssuanDescriptor {
                port:  listener.local_addr().unwrap().port(),
                nonce: NONCE,
            };
            std::fs::write(home.join(agent.descriptor_name()), descriptor.encode()).unwrap();
            tasks.push(tokio::spawn(accept(listener, dials.clone(), open.clone())));
        }
        Self { dials, open, tasks }
    }

    /// Connections that presented the right nonce
    pub fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    /// Connections still open from the backend's side
    pub fn open(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }
}

impl Drop for EchoBackend {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn accept(listener: TcpListener, dials: Arc<AtomicUsize>, open: Arc<AtomicUsize>) {
    while let Ok((mut stream, _)) = listener.accept().await {
        let dials = dials.clone();
        let open = open.clone();
        tokio::spawn(async move {
            let mut nonce = [0u8; 16];
            if stream.read_exact(&mut nonce).await.is_err() || nonce != NONCE {
                return;
            }
            dials.fetch_add(1, Ordering::SeqCst);
            open.fetch_add(1, Ordering::SeqCst);
            let (mut rd, mut wr) = stream.split();
            let _ = tokio::io::copy(&mut rd, &mut wr).await;
            open.fetch_sub(1, Ordering::SeqCst);
        });
    }
}

/// Configuration rooted entirely inside `dir`
pub fn config(dir: &Path) -> BridgeConfig {
    let mut cfg = BridgeConfig::default();
    cfg.gpg.home = dir.join("gnupg");
    cfg.gui.home = dir.join("bridge");
    cfg.gui.pipe_dir = dir.join("pipes");
    cfg.relay.drain_timeout_ms = 200;
    cfg.relay.handshake_timeout_ms = 500;
    cfg.relay.backend_retry = RetryPolicy::none();
    cfg
}

/// A loopback port that was free a moment ago
pub fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

pub async fn client_for(connector: &Connector) -> AgentClient {
    let config = ClientConfig::new(connector.local_address()).with_timeout(Duration::from_secs(5));
    let mut client = AgentClient::new(config);
    client.connect().await.unwrap();
    client
}

/// Poll `cond` until it holds or a second passes
pub async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
