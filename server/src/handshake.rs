//! Per-transport negotiation run before any relaying starts.

use std::{fmt, time::Duration};

use gpgbridge_common::rendezvous::{CygwinCredentials, CREDENTIALS_LEN, SECRET_LEN};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::BridgeError;

/// Negotiation strategy a connector kind uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterKind {
    /// Nothing to negotiate
    Passthrough,
    /// No exchange, but the kernel-reported peer must be our own user
    NativeSocket,
    /// Cygwin/MSYS emulated socket secret exchange
    CygwinSecret,
}

/// A configured adapter, shared by every session of one listener
pub enum HandshakeAdapter {
    Passthrough,
    NativeSocket {
        /// Uid peers must run as; `None` where the platform cannot tell
        expected_uid: Option<u32>,
    },
    CygwinSecret {
        secret:  [u8; SECRET_LEN],
        timeout: Duration,
    },
}

impl fmt::Debug for HandshakeAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeAdapter::Passthrough => f.write_str("Passthrough"),
            HandshakeAdapter::NativeSocket { expected_uid } => f
                .debug_struct("NativeSocket")
                .field("expected_uid", expected_uid)
                .finish(),
            HandshakeAdapter::CygwinSecret { timeout, .. } => f
                .debug_struct("CygwinSecret")
                .field("timeout", timeout)
                .finish_non_exhaustive(),
        }
    }
}

impl HandshakeAdapter {
    pub fn kind(&self) -> AdapterKind {
        match self {
            HandshakeAdapter::Passthrough => AdapterKind::Passthrough,
            HandshakeAdapter::NativeSocket { .. } => AdapterKind::NativeSocket,
            HandshakeAdapter::CygwinSecret { .. } => AdapterKind::CygwinSecret,
        }
    }

    /// Run the negotiation on a freshly accepted client
    ///
    /// Any failure means the session must be closed without relaying.
    pub async fn negotiate<S>(&self, stream: &mut S, peer_uid: Option<u32>) -> Result<(), BridgeError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match self {
            HandshakeAdapter::Passthrough => Ok(()),
            HandshakeAdapter::NativeSocket { expected_uid } => match (expected_uid, peer_uid) {
                (Some(expected), Some(peer)) if *expected != peer => Err(BridgeError::handshake(
                    format!("peer uid {peer} does not match {expected}"),
                )),
                _ => Ok(()),
            },
            HandshakeAdapter::CygwinSecret { secret, timeout } => {
                let client = cygwin_exchange(stream, secret, *timeout).await?;
                tracing::debug!(pid = client.pid, uid = client.uid, "cygwin client accepted");
                Ok(())
            }
        }
    }
}

/// Server side of the Cygwin socket handshake
///
/// The client sends the 16 byte secret, which is echoed back on a match, then
/// its pid/uid/gid block; the reply carries our pid with the client's uid/gid.
async fn cygwin_exchange<S>(
    stream: &mut S,
    secret: &[u8; SECRET_LEN],
    timeout: Duration,
) -> Result<CygwinCredentials, BridgeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut presented = [0u8; SECRET_LEN];
    read_bounded(stream, &mut presented, timeout, "secret").await?;
    if !bool::from(presented[..].ct_eq(&secret[..])) {
        return Err(BridgeError::handshake("secret mismatch"));
    }
    write_all(stream, &presented).await?;

    let mut raw = [0u8; CREDENTIALS_LEN];
    read_bounded(stream, &mut raw, timeout, "credentials").await?;
    let client = CygwinCredentials::from_bytes(&raw);

    let reply = CygwinCredentials {
        pid: std::process::id(),
        uid: client.uid,
        gid: client.gid,
    };
    write_all(stream, &reply.to_bytes()).await?;
    Ok(client)
}

async fn read_bounded<S>(
    stream: &mut S,
    buf: &mut [u8],
    timeout: Duration,
    what: &str,
) -> Result<(), BridgeError>
where
    S: AsyncRead + Unpin,
{
    match tokio::time::timeout(timeout, stream.read_exact(buf)).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(BridgeError::handshake(format!("reading {what}: {e}"))),
        Err(_) => Err(BridgeError::handshake(format!("timed out waiting for {what}"))),
    }
}

async fn write_all<S>(stream: &mut S, data: &[u8]) -> Result<(), BridgeError>
where
    S: AsyncWrite + Unpin,
{
    stream
        .write_all(data)
        .await
        .map_err(|e| BridgeError::handshake(format!("writing reply: {e}")))?;
    stream
        .flush()
        .await
        .map_err(|e| BridgeError::handshake(format!("flushing reply: {e}")))
}

/// Short, non-reversible fingerprint of a secret, safe to log
pub fn fingerprint(secret: &[u8]) -> String {
    hex::encode(&Sha256::digest(secret)[..8])
}

#[cfg(test)]
mod tests {
    use tokio::io::duplex;

    use super::*;

    fn cygwin(secret: [u8; SECRET_LEN]) -> HandshakeAdapter {
        HandshakeAdapter::CygwinSecret {
            secret,
            timeout: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn cygwin_exchange_with_correct_secret() {
        let secret = [9u8; SECRET_LEN];
        let adapter = cygwin(secret);
        let (mut server, mut client) = duplex(64);

        let client_side = tokio::spawn(async move {
            client.write_all(&secret).await.unwrap();
            let mut echo = [0u8; SECRET_LEN];
            client.read_exact(&mut echo).await.unwrap();
            assert_eq!(echo, secret);

            let creds = CygwinCredentials { pid: 42, uid: 1000, gid: 100 };
            client.write_all(&creds.to_bytes()).await.unwrap();
            let mut reply = [0u8; CREDENTIALS_LEN];
            client.read_exact(&mut reply).await.unwrap();
            CygwinCredentials::from_bytes(&reply)
        });

        adapter.negotiate(&mut server, None).await.unwrap();
        let reply = client_side.await.unwrap();
        assert_eq!(reply.pid, std::process::id());
        assert_eq!((reply.uid, reply.gid), (1000, 100));
    }

    #[tokio::test]
    async fn cygwin_rejects_wrong_secret_without_echo() {
        let adapter = cygwin([1u8; SECRET_LEN]);
        let (mut server, mut client) = duplex(64);

        client.write_all(&[2u8; SECRET_LEN]).await.unwrap();
        let err = adapter.negotiate(&mut server, None).await.unwrap_err();
        assert!(matches!(err, BridgeError::Handshake { .. }));

        drop(server);
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty(), "nothing may be echoed on mismatch");
    }

    #[tokio::test]
    async fn cygwin_times_out_on_silent_client() {
        let adapter = cygwin([1u8; SECRET_LEN]);
        let (mut server, mut client) = duplex(64);
        client.write_all(&[1u8; 4]).await.unwrap();

        let err = adapter.negotiate(&mut server, None).await.unwrap_err();
        assert!(err.to_string().contains("timed out"), "{err}");
    }

    #[tokio::test]
    async fn native_socket_checks_peer_uid() {
        let adapter = HandshakeAdapter::NativeSocket {
            expected_uid: Some(1000),
        };
        let (mut server, _client) = duplex(8);

        assert!(adapter.negotiate(&mut server, Some(1000)).await.is_ok());
        assert!(adapter.negotiate(&mut server, None).await.is_ok());
        assert!(adapter.negotiate(&mut server, Some(0)).await.is_err());
        assert!(HandshakeAdapter::Passthrough
            .negotiate(&mut server, Some(0))
            .await
            .is_ok());
    }

    #[test]
    fn fingerprint_is_stable_and_short() {
        assert_eq!(fingerprint(b"abc"), "ba7816bf8f01cfea");
    }

    #[test]
    fn debug_hides_secret() {
        let text = format!("{:?}", cygwin([0xAB; SECRET_LEN]));
        assert!(!text.contains("171"), "{text}");
        assert_eq!(cygwin([0; SECRET_LEN]).kind(), AdapterKind::CygwinSecret);
    }
}
