#![cfg(unix)]

mod helpers;

use std::{sync::Arc, time::Duration};

use gpgbridge_client::{AgentClient, ClientConfig};
use gpgbridge_common::{
    rendezvous::{CREDENTIALS_LEN, SECRET_LEN},
    AssuanDescriptor,
    ConnectorKind,
    CygwinCredentials,
    CygwinDescriptor,
    ListenAddress,
    LogicalAgent,
    PlatformStream,
};
use gpgbridge_server::{
    backend::BackendLocator,
    connector::Connector,
    environment::{EnvironmentPublisher, MemoryEnvStore},
    AgentSupervisor,
    ConnectorState,
    LockController,
};
use helpers::{client_for, config, eventually, free_port, EchoBackend, NONCE};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpListener,
};

fn connector(kind: ConnectorKind, cfg: &gpgbridge_common::BridgeConfig, lock: &Arc<LockController>) -> Connector {
    Connector::new(
        kind,
        cfg,
        Arc::new(BackendLocator::new(&cfg.gpg.home)),
        lock.clone(),
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn native_socket_and_pipe_clients_get_their_own_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path());
    cfg.connectors.enabled = vec![ConnectorKind::SockAgent, ConnectorKind::PipeSsh];
    let _backend = EchoBackend::start(&cfg.gpg.home).await;

    let locator = Arc::new(BackendLocator::new(&cfg.gpg.home));
    let env = EnvironmentPublisher::new(Arc::new(MemoryEnvStore::new()), Arc::new(MemoryEnvStore::new()));
    let sup = AgentSupervisor::with_parts(cfg, locator, Arc::new(LockController::new()), env);
    sup.start().await.unwrap();

    let mut clients = Vec::new();
    for kind in [ConnectorKind::SockAgent, ConnectorKind::PipeSsh] {
        let address = sup.connector(kind).unwrap().local_address();
        for n in 0..3 {
            let address = address.clone();
            clients.push(tokio::spawn(async move {
                let mut client = AgentClient::new(ClientConfig::new(address));
                client.connect().await.unwrap();
                let mut expected = Vec::new();
                for round in 0..20 {
                    let chunk = format!("{kind}/{n}/{round};").into_bytes();
                    client.send(&chunk).await.unwrap();
                    expected.extend_from_slice(&chunk);
                }
                let echoed = client.recv_exact(expected.len()).await.unwrap();
                assert_eq!(echoed, expected, "client {kind}/{n} saw foreign bytes");
                client.disconnect();
            }));
        }
    }
    for client in clients {
        client.await.unwrap();
    }

    for kind in [ConnectorKind::SockAgent, ConnectorKind::PipeSsh] {
        let connector = sup.connector(kind).unwrap();
        assert_eq!(connector.stats().accepted, 3);
        assert!(eventually(|| connector.active_sessions() == 0).await);
    }
    sup.stop().await;
}

#[tokio::test]
async fn close_frees_the_address_for_every_kind() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path());
    cfg.gui.extra_port = free_port();
    cfg.gui.cygwin_port = free_port();
    let lock = Arc::new(LockController::new());

    for kind in ConnectorKind::ALL {
        let first = connector(kind, &cfg, &lock);
        first.serve().await.unwrap();
        assert_eq!(first.state(), ConnectorState::Listening, "{kind}");
        first.close().await;
        assert_eq!(first.state(), ConnectorState::Closed, "{kind}");

        // Same address, fresh connector, immediately
        let second = connector(kind, &cfg, &lock);
        second.serve().await.unwrap_or_else(|e| panic!("{kind}: {e}"));
        second.close().await;

        // And the original one can serve again too
        first.serve().await.unwrap();
        first.close().await;
    }
}

#[tokio::test]
async fn close_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path());
    let lock = Arc::new(LockController::new());
    let sock = connector(ConnectorKind::SockAgent, &cfg, &lock);

    sock.close().await;
    assert_eq!(sock.state(), ConnectorState::Idle);

    sock.serve().await.unwrap();
    let path = cfg.gui.home.join("S.gpg-agent");
    assert!(path.exists());
    sock.close().await;
    sock.close().await;
    assert_eq!(sock.state(), ConnectorState::Closed);
    assert!(!path.exists());
}

#[tokio::test]
async fn bind_error_leaves_connector_idle() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path());
    std::fs::create_dir_all(&cfg.gui.home).unwrap();
    std::fs::write(cfg.gui.home.join("S.gpg-agent"), b"not a socket").unwrap();

    let lock = Arc::new(LockController::new());
    let sock = connector(ConnectorKind::SockAgent, &cfg, &lock);
    let err = sock.serve().await.unwrap_err();
    assert!(err.to_string().contains("sock_agent"), "{err}");
    assert_eq!(sock.state(), ConnectorState::Idle);
}

#[tokio::test]
async fn cygwin_secret_gates_the_relay() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path());
    let _backend = EchoBackend::start(&cfg.gpg.home).await;
    let lock = Arc::new(LockController::new());
    let cyg = connector(ConnectorKind::SockAgentCygwinSsh, &cfg, &lock);
    cyg.serve().await.unwrap();

    let ListenAddress::EmulatedUnix { descriptor, port } = cyg.local_address() else {
        panic!("cygwin connector must listen on an emulated socket");
    };
    let published = CygwinDescriptor::read(&descriptor).unwrap();
    assert_eq!(published.port, port);

    // A good client keeps relaying while a bad one is turned away
    let mut good = client_for(&cyg).await;
    assert_eq!(good.roundtrip(b"ssh-agent request 1").await.unwrap(), b"ssh-agent request 1");

    let mut bad = PlatformStream::connect_tcp(([127, 0, 0, 1], port).into()).await.unwrap();
    let mut wrong = published.secret;
    wrong[0] ^= 0xff;
    bad.write_all(&wrong).await.unwrap();
    let mut rest = Vec::new();
    let _ = bad.read_to_end(&mut rest).await;
    assert!(rest.is_empty(), "wrong secret must not be echoed");

    assert_eq!(good.roundtrip(b"ssh-agent request 2").await.unwrap(), b"ssh-agent request 2");
    assert!(eventually(|| cyg.stats().handshake_failures == 1).await);

    cyg.close().await;
    assert!(!descriptor.exists());
}

#[tokio::test]
async fn cygwin_descriptor_is_fresh_per_serve() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path());
    let lock = Arc::new(LockController::new());
    let cyg = connector(ConnectorKind::SockAgentCygwinSsh, &cfg, &lock);

    cyg.serve().await.unwrap();
    let ListenAddress::EmulatedUnix { descriptor, .. } = cyg.local_address() else {
        panic!("expected an emulated socket");
    };
    let first = CygwinDescriptor::read(&descriptor).unwrap();
    cyg.close().await;

    cyg.serve().await.unwrap();
    let second = CygwinDescriptor::read(&descriptor).unwrap();
    assert_ne!(first.secret, second.secret);
    assert_eq!(second.secret.len(), SECRET_LEN);
    cyg.close().await;
}

#[tokio::test]
async fn session_lock_defers_the_backend_dial() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path());
    let backend = EchoBackend::start(&cfg.gpg.home).await;
    let lock = Arc::new(LockController::new());
    let sock = connector(ConnectorKind::SockAgent, &cfg, &lock);
    sock.serve().await.unwrap();

    lock.session_lock().await;
    let mut client = client_for(&sock).await;
    client.send(b"queued while locked").await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(backend.dials(), 0);
    assert!(eventually(|| sock.active_sessions() == 1).await);

    lock.session_unlock();
    let echoed = client.recv_exact(b"queued while locked".len()).await.unwrap();
    assert_eq!(echoed, b"queued while locked");
    assert_eq!(backend.dials(), 1);

    sock.close().await;
}

#[tokio::test]
async fn missing_backend_closes_client_and_connector_recovers() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path());
    let lock = Arc::new(LockController::new());
    let sock = connector(ConnectorKind::SockAgentExtra, &cfg, &lock);
    sock.serve().await.unwrap();

    let mut orphan = client_for(&sock).await;
    assert!(orphan.recv_to_end().await.unwrap().is_empty());
    assert!(eventually(|| sock.stats().backend_failures == 1).await);
    assert_eq!(sock.state(), ConnectorState::Listening);

    let _backend = EchoBackend::start(&cfg.gpg.home).await;
    let mut client = client_for(&sock).await;
    assert_eq!(client.roundtrip(b"back again").await.unwrap(), b"back again");

    sock.close().await;
}

#[tokio::test]
async fn close_cuts_sessions_after_the_drain_deadline() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path());
    let _backend = EchoBackend::start(&cfg.gpg.home).await;
    let lock = Arc::new(LockController::new());
    let sock = connector(ConnectorKind::SockAgent, &cfg, &lock);
    sock.serve().await.unwrap();

    let mut idle = client_for(&sock).await;
    assert_eq!(idle.roundtrip(b"ping").await.unwrap(), b"ping");

    let started = std::time::Instant::now();
    sock.close().await;
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(sock.active_sessions(), 0);
    assert!(idle.recv_to_end().await.unwrap().is_empty());
}

#[tokio::test]
async fn client_presents_credentials_to_cygwin_listener() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path());
    let _backend = EchoBackend::start(&cfg.gpg.home).await;
    let lock = Arc::new(LockController::new());
    let cyg = connector(ConnectorKind::SockAgentCygwinSsh, &cfg, &lock);
    cyg.serve().await.unwrap();

    let config = ClientConfig::new(cyg.local_address()).with_credentials(CygwinCredentials {
        pid: 4242,
        uid: 197_609,
        gid: 197_121,
    });
    AgentClient::probe(config).await.unwrap();
    cyg.close().await;
}

#[tokio::test]
async fn lock_during_cygwin_handshake_defers_the_dial() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path());
    let backend = EchoBackend::start(&cfg.gpg.home).await;
    let lock = Arc::new(LockController::new());
    let cyg = connector(ConnectorKind::SockAgentCygwinSsh, &cfg, &lock);
    cyg.serve().await.unwrap();

    let ListenAddress::EmulatedUnix { descriptor, port } = cyg.local_address() else {
        panic!("expected an emulated socket");
    };
    let published = CygwinDescriptor::read(&descriptor).unwrap();
    let mut stream = PlatformStream::connect_tcp(([127, 0, 0, 1], port).into()).await.unwrap();
    stream.write_all(&published.secret).await.unwrap();
    let mut echo = [0u8; SECRET_LEN];
    stream.read_exact(&mut echo).await.unwrap();
    assert_eq!(echo, published.secret);

    // Locked after the secret but before the credentials arrive
    lock.session_lock().await;
    let credentials = CygwinCredentials {
        pid: 1,
        uid: 1000,
        gid: 1000,
    };
    stream.write_all(&credentials.to_bytes()).await.unwrap();
    let mut reply = [0u8; CREDENTIALS_LEN];
    stream.read_exact(&mut reply).await.unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(backend.dials(), 0);
    assert_eq!(cyg.active_sessions(), 1);

    lock.session_unlock();
    stream.write_all(b"after unlock").await.unwrap();
    let mut echoed = [0u8; 12];
    stream.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"after unlock");
    assert_eq!(backend.dials(), 1);

    cyg.close().await;
}

#[tokio::test]
async fn backend_hangup_ends_the_session() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path());
    std::fs::create_dir_all(&cfg.gpg.home).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let rendezvous = AssuanDescriptor {
        port:  listener.local_addr().unwrap().port(),
        nonce: NONCE,
    };
    std::fs::write(cfg.gpg.home.join(LogicalAgent::Gpg.descriptor_name()), rendezvous.encode()).unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut nonce = [0u8; 16];
        stream.read_exact(&mut nonce).await.unwrap();
        stream.write_all(b"OK closing connection\n").await.unwrap();
    });

    let lock = Arc::new(LockController::new());
    let sock = connector(ConnectorKind::SockAgent, &cfg, &lock);
    sock.serve().await.unwrap();

    // The client stays open and silent; the bridge must still let go
    let mut client = client_for(&sock).await;
    assert_eq!(client.recv_to_end().await.unwrap(), b"OK closing connection\n");
    assert!(eventually(|| sock.active_sessions() == 0).await);
    assert_eq!(sock.stats().bytes_to_client, 22);

    sock.close().await;
}

#[tokio::test]
async fn client_hangup_ends_the_session() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path());
    let backend = EchoBackend::start(&cfg.gpg.home).await;
    let lock = Arc::new(LockController::new());
    let sock = connector(ConnectorKind::SockAgent, &cfg, &lock);
    sock.serve().await.unwrap();

    let mut client = client_for(&sock).await;
    assert_eq!(client.roundtrip(b"GETINFO pid\n").await.unwrap(), b"GETINFO pid\n");
    assert!(eventually(|| backend.open() == 1).await);

    client.finish().await.unwrap();
    assert!(eventually(|| sock.active_sessions() == 0).await);
    assert!(eventually(|| backend.open() == 0).await);

    sock.close().await;
}
