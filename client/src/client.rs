use std::{
    net::{Ipv4Addr, SocketAddr},
    time::Duration,
};

use anyhow::{anyhow, bail, Context, Result};
use gpgbridge_common::{
    rendezvous::{CREDENTIALS_LEN, SECRET_LEN},
    BridgeConfig,
    ConnectorKind,
    CygwinCredentials,
    CygwinDescriptor,
    ListenAddress,
    PlatformStream,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Configuration for an agent client
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Connector address to reach
    pub address:     ListenAddress,
    /// Bound on connecting and on every read
    pub timeout:     Duration,
    /// Identity presented during the Cygwin handshake
    pub credentials: CygwinCredentials,
}

impl ClientConfig {
    pub fn new(address: ListenAddress) -> Self {
        Self {
            address,
            timeout: Duration::from_secs(10),
            credentials: CygwinCredentials {
                pid: std::process::id(),
                uid: 0,
                gid: 0,
            },
        }
    }

    /// Address of `kind` under the given bridge configuration
    pub fn for_kind(kind: ConnectorKind, cfg: &BridgeConfig) -> Self {
        Self::new(kind.listen_address(cfg))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_credentials(mut self, credentials: CygwinCredentials) -> Self {
        self.credentials = credentials;
        self
    }
}

/// A client of one connector, speaking whatever handshake it requires
pub struct AgentClient {
    config:         ClientConfig,
    connection:     Option<PlatformStream>,
    bytes_sent:     u64,
    bytes_received: u64,
}

impl AgentClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            connection: None,
            bytes_sent: 0,
            bytes_received: 0,
        }
    }

    /// Connect, running the Cygwin handshake for emulated sockets
    pub async fn connect(&mut self) -> Result<()> {
        let timeout = self.config.timeout;
        let stream = tokio::time::timeout(timeout, self.open())
            .await
            .map_err(|_| anyhow!("Timed out connecting to {}", self.config.address))??;
        tracing::debug!(address = %self.config.address, transport = stream.transport(), "connected");
        self.connection = Some(stream);
        Ok(())
    }

    async fn open(&self) -> Result<PlatformStream> {
        match &self.config.address {
            ListenAddress::EmulatedUnix { descriptor, .. } => {
                let rendezvous = CygwinDescriptor::read(descriptor).with_context(|| {
                    format!("Failed to read socket descriptor {}", descriptor.display())
                })?;
                let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, rendezvous.port));
                let mut stream = PlatformStream::connect_tcp(addr)
                    .await
                    .with_context(|| format!("Failed to connect to {addr}"))?;
                let server = cygwin_handshake(&mut stream, &rendezvous.secret, self.config.credentials)
                    .await?;
                tracing::debug!(server_pid = server.pid, "cygwin handshake completed");
                Ok(stream)
            }
            address => PlatformStream::connect(address)
                .await
                .with_context(|| format!("Failed to connect to {address}")),
        }
    }

    pub fn disconnect(&mut self) {
        self.connection = None;
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    fn stream(&mut self) -> Result<&mut PlatformStream> {
        self.connection
            .as_mut()
            .ok_or_else(|| anyhow!("Not connected to agent"))
    }

    pub async fn send(&mut self, data: &[u8]) -> Result<()> {
        let stream = self.stream()?;
        stream.write_all(data).await.context("Failed to send")?;
        stream.flush().await.context("Failed to flush")?;
        self.bytes_sent += data.len() as u64;
        Ok(())
    }

    /// Read exactly `len` bytes
    pub async fn recv_exact(&mut self, len: usize) -> Result<Vec<u8>> {
        let timeout = self.config.timeout;
        let stream = self.stream()?;
        let mut buf = vec![0u8; len];
        tokio::time::timeout(timeout, stream.read_exact(&mut buf))
            .await
            .map_err(|_| anyhow!("Timed out waiting for {len} bytes"))?
            .context("Failed to receive")?;
        self.bytes_received += len as u64;
        Ok(buf)
    }

    /// Read whatever arrives until the agent closes the connection
    pub async fn recv_to_end(&mut self) -> Result<Vec<u8>> {
        let timeout = self.config.timeout;
        let stream = self.stream()?;
        let mut buf = Vec::new();
        tokio::time::timeout(timeout, stream.read_to_end(&mut buf))
            .await
            .map_err(|_| anyhow!("Timed out waiting for end of stream"))?
            .context("Failed to receive")?;
        self.bytes_received += buf.len() as u64;
        Ok(buf)
    }

    /// Close our sending side, which ends the relayed session
    pub async fn finish(&mut self) -> Result<()> {
        self.stream()?.shutdown().await.context("Failed to shut down")
    }

    /// Send `data` and read back as many bytes
    pub async fn roundtrip(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        self.send(data).await?;
        self.recv_exact(data.len()).await
    }

    pub fn into_stream(mut self) -> Option<PlatformStream> {
        self.connection.take()
    }

    pub fn stats(&self) -> ClientStats {
        ClientStats {
            connected:      self.is_connected(),
            address:        self.config.address.to_string(),
            bytes_sent:     self.bytes_sent,
            bytes_received: self.bytes_received,
        }
    }
}

/// Statistics about the client connection
#[derive(Debug, Clone)]
pub struct ClientStats {
    pub connected:      bool,
    pub address:        String,
    pub bytes_sent:     u64,
    pub bytes_received: u64,
}

// Convenience functions for common operations
impl AgentClient {
    /// Check that a connector accepts and negotiates, then hang up
    pub async fn probe(config: ClientConfig) -> Result<()> {
        let mut client = Self::new(config);
        client.connect().await?;
        client.disconnect();
        Ok(())
    }
}

/// Client side of the Cygwin emulated-socket handshake
///
/// Returns the credentials the server answered with.
pub async fn cygwin_handshake<S>(
    stream: &mut S,
    secret: &[u8; SECRET_LEN],
    credentials: CygwinCredentials,
) -> Result<CygwinCredentials>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(secret).await.context("Failed to send secret")?;
    let mut echo = [0u8; SECRET_LEN];
    stream
        .read_exact(&mut echo)
        .await
        .context("Server closed the connection during the handshake")?;
    if &echo != secret {
        bail!("Server echoed a different secret");
    }

    stream
        .write_all(&credentials.to_bytes())
        .await
        .context("Failed to send credentials")?;
    let mut reply = [0u8; CREDENTIALS_LEN];
    stream
        .read_exact(&mut reply)
        .await
        .context("Failed to read server credentials")?;
    Ok(CygwinCredentials::from_bytes(&reply))
}
