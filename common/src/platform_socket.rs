use std::{
    fmt, io,
    net::{Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
    pin::Pin,
    task::{Context, Poll},
};

#[cfg(windows)]
use std::time::Duration;

use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::{TcpListener, TcpStream},
};
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};
#[cfg(windows)]
use tokio::net::windows::named_pipe::{ClientOptions, NamedPipeClient, NamedPipeServer, ServerOptions};

use crate::error::CommonError;

/// Where a connector listens
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddress {
    /// Native AF_UNIX socket at a filesystem path
    Unix(PathBuf),
    /// Plain TCP socket
    Tcp(SocketAddr),
    /// Native pipe; on Unix the pipe namespace is emulated by a socket in `dir`
    Pipe { name: String, dir: PathBuf },
    /// Loopback TCP port advertised through a descriptor file
    EmulatedUnix { descriptor: PathBuf, port: u16 },
}

impl ListenAddress {
    /// The path a client is given to reach this address, if it has one
    pub fn client_path(&self) -> Option<PathBuf> {
        match self {
            ListenAddress::Unix(path) => Some(path.clone()),
            ListenAddress::Tcp(_) => None,
            ListenAddress::Pipe { name, dir } => Some(pipe_path(name, dir)),
            ListenAddress::EmulatedUnix { descriptor, .. } => Some(descriptor.clone()),
        }
    }
}

impl fmt::Display for ListenAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenAddress::Unix(path) => write!(f, "unix:{}", path.display()),
            ListenAddress::Tcp(addr) => write!(f, "tcp:{addr}"),
            ListenAddress::Pipe { name, dir } => write!(f, "pipe:{}", pipe_path(name, dir).display()),
            ListenAddress::EmulatedUnix { descriptor, port } => {
                write!(f, "cygwin:{} (port {port})", descriptor.display())
            }
        }
    }
}

/// Full path of a pipe as clients see it
pub fn pipe_path(name: &str, dir: &Path) -> PathBuf {
    #[cfg(windows)]
    {
        let _ = dir;
        PathBuf::from(format!(r"\\.\pipe\{name}"))
    }
    #[cfg(not(windows))]
    {
        dir.join(name)
    }
}

/// Cross-platform socket listener
pub enum PlatformListener {
    /// TCP listener, also used behind emulated sockets
    Tcp(TcpListener),
    #[cfg(unix)]
    /// Unix domain socket listener; the socket file is removed on drop
    Unix { listener: UnixListener, path: PathBuf },
    #[cfg(windows)]
    /// Windows named pipe, holding the instance the next client will connect to
    Pipe { name: String, next: NamedPipeServer },
}

impl PlatformListener {
    /// Create a new platform-specific listener
    pub async fn bind(address: &ListenAddress) -> Result<Self, CommonError> {
        match address {
            ListenAddress::Tcp(addr) => {
                let listener = TcpListener::bind(addr).await?;
                Ok(PlatformListener::Tcp(listener))
            }
            ListenAddress::EmulatedUnix { port, .. } => {
                let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, *port)).await?;
                Ok(PlatformListener::Tcp(listener))
            }
            ListenAddress::Unix(path) => bind_unix(path),
            ListenAddress::Pipe { name, dir } => bind_pipe(name, dir),
        }
    }

    /// Accept the next client connection
    ///
    /// Returns the stream and a printable description of the peer.
    pub async fn accept(&mut self) -> io::Result<(PlatformStream, String)> {
        match self {
            PlatformListener::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                stream.set_nodelay(true)?;
                Ok((PlatformStream::Tcp(stream), peer.to_string()))
            }
            #[cfg(unix)]
            PlatformListener::Unix { listener, .. } => {
                let (stream, _) = listener.accept().await?;
                let peer = match stream.peer_cred() {
                    Ok(cred) => format!("uid {}", cred.uid()),
                    Err(_) => "unix peer".to_string(),
                };
                Ok((PlatformStream::Unix(stream), peer))
            }
            #[cfg(windows)]
            PlatformListener::Pipe { name, next } => {
                next.connect().await?;
                // Create the next instance before handing out the connected one
                // so the name never disappears between clients.
                let fresh = ServerOptions::new()
                    .reject_remote_clients(true)
                    .create(name.as_str())?;
                let connected = std::mem::replace(next, fresh);
                Ok((PlatformStream::PipeServer(connected), "pipe client".to_string()))
            }
        }
    }

    /// Port of a TCP-backed listener
    pub fn local_port(&self) -> Option<u16> {
        match self {
            PlatformListener::Tcp(listener) => listener.local_addr().ok().map(|a| a.port()),
            #[cfg(unix)]
            PlatformListener::Unix { .. } => None,
            #[cfg(windows)]
            PlatformListener::Pipe { .. } => None,
        }
    }
}

#[cfg(unix)]
impl Drop for PlatformListener {
    fn drop(&mut self) {
        if let PlatformListener::Unix { path, .. } = self {
            if let Err(e) = std::fs::remove_file(&*path) {
                if e.kind() != io::ErrorKind::NotFound {
                    tracing::warn!(path = %path.display(), "failed to remove socket file: {e}");
                }
            }
        }
    }
}

#[cfg(unix)]
fn bind_unix(path: &Path) -> Result<PlatformListener, CommonError> {
    use std::os::unix::fs::{FileTypeExt, PermissionsExt};

    if let Some(parent) = path.parent() {
        ensure_directory(parent)?;
    }

    match std::fs::symlink_metadata(path) {
        Ok(metadata) if metadata.file_type().is_socket() => {
            // A socket somebody still answers on is in use, not stale
            if std::os::unix::net::UnixStream::connect(path).is_ok() {
                return Err(io::Error::new(
                    io::ErrorKind::AddrInUse,
                    format!("socket {} is in use by another process", path.display()),
                )
                .into());
            }
            tracing::warn!(path = %path.display(), "removing stale socket file");
            std::fs::remove_file(path)?;
        }
        Ok(_) => {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{} exists but is not a socket", path.display()),
            )
            .into());
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let listener = UnixListener::bind(path)?;

    // Owner read/write only
    if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)) {
        tracing::warn!(path = %path.display(), "failed to set socket permissions: {e}");
    }

    tracing::debug!(path = %path.display(), "bound unix socket");
    Ok(PlatformListener::Unix {
        listener,
        path: path.to_path_buf(),
    })
}

#[cfg(not(unix))]
fn bind_unix(path: &Path) -> Result<PlatformListener, CommonError> {
    Err(CommonError::Unsupported(format!(
        "AF_UNIX socket {}",
        path.display()
    )))
}

#[cfg(windows)]
fn bind_pipe(name: &str, _dir: &Path) -> Result<PlatformListener, CommonError> {
    let pipe_name = format!(r"\\.\pipe\{name}");
    // first_pipe_instance fails when another process already owns the name
    let first = ServerOptions::new()
        .first_pipe_instance(true)
        .reject_remote_clients(true)
        .create(&pipe_name)?;
    tracing::debug!(pipe = %pipe_name, "created named pipe");
    Ok(PlatformListener::Pipe {
        name: pipe_name,
        next: first,
    })
}

#[cfg(not(windows))]
fn bind_pipe(name: &str, dir: &Path) -> Result<PlatformListener, CommonError> {
    bind_unix(&dir.join(name))
}

/// Create a missing socket directory with 0700; existing directories are left alone
pub fn ensure_directory(path: &Path) -> io::Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(metadata) if metadata.is_dir() => Ok(()),
        Ok(_) => Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("{} exists but is not a directory", path.display()),
        )),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            std::fs::create_dir_all(path)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))?;
            }
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Cross-platform byte stream
pub enum PlatformStream {
    /// TCP stream
    Tcp(TcpStream),
    #[cfg(unix)]
    /// Unix domain socket
    Unix(UnixStream),
    #[cfg(windows)]
    /// Server end of a named pipe
    PipeServer(NamedPipeServer),
    #[cfg(windows)]
    /// Client end of a named pipe
    PipeClient(NamedPipeClient),
}

impl PlatformStream {
    /// Connect to a natively reachable address
    pub async fn connect(address: &ListenAddress) -> Result<Self, CommonError> {
        match address {
            ListenAddress::Unix(path) => Ok(Self::connect_unix(path).await?),
            ListenAddress::Tcp(addr) => Ok(Self::connect_tcp(*addr).await?),
            ListenAddress::Pipe { name, dir } => Ok(Self::connect_pipe(name, dir).await?),
            ListenAddress::EmulatedUnix { descriptor, .. } => Err(CommonError::Unsupported(format!(
                "{} requires the emulated socket handshake",
                descriptor.display()
            ))),
        }
    }

    pub async fn connect_tcp(addr: SocketAddr) -> io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(PlatformStream::Tcp(stream))
    }

    #[cfg(unix)]
    pub async fn connect_unix(path: &Path) -> io::Result<Self> {
        Ok(PlatformStream::Unix(UnixStream::connect(path).await?))
    }

    #[cfg(not(unix))]
    pub async fn connect_unix(path: &Path) -> io::Result<Self> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("AF_UNIX socket {} is not supported here", path.display()),
        ))
    }

    #[cfg(unix)]
    pub async fn connect_pipe(name: &str, dir: &Path) -> io::Result<Self> {
        Self::connect_unix(&dir.join(name)).await
    }

    #[cfg(windows)]
    pub async fn connect_pipe(name: &str, _dir: &Path) -> io::Result<Self> {
        use windows::Win32::Foundation::ERROR_PIPE_BUSY;

        let pipe_name = format!(r"\\.\pipe\{name}");
        loop {
            match ClientOptions::new().open(&pipe_name) {
                Ok(client) => return Ok(PlatformStream::PipeClient(client)),
                Err(e) if e.raw_os_error() == Some(ERROR_PIPE_BUSY.0 as i32) => {}
                Err(e) => return Err(e),
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Uid of the connected peer, where the kernel reports one
    pub fn peer_uid(&self) -> Option<u32> {
        match self {
            #[cfg(unix)]
            PlatformStream::Unix(stream) => stream.peer_cred().ok().map(|cred| cred.uid()),
            _ => None,
        }
    }

    /// Short transport label for logs
    pub fn transport(&self) -> &'static str {
        match self {
            PlatformStream::Tcp(_) => "tcp",
            #[cfg(unix)]
            PlatformStream::Unix(_) => "unix",
            #[cfg(windows)]
            PlatformStream::PipeServer(_) | PlatformStream::PipeClient(_) => "pipe",
        }
    }
}

macro_rules! delegate {
    ($self:ident, $stream:ident => $call:expr) => {
        match $self.get_mut() {
            PlatformStream::Tcp($stream) => $call,
            #[cfg(unix)]
            PlatformStream::Unix($stream) => $call,
            #[cfg(windows)]
            PlatformStream::PipeServer($stream) => $call,
            #[cfg(windows)]
            PlatformStream::PipeClient($stream) => $call,
        }
    };
}

impl AsyncRead for PlatformStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        delegate!(self, stream => Pin::new(stream).poll_read(cx, buf))
    }
}

impl AsyncWrite for PlatformStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        delegate!(self, stream => Pin::new(stream).poll_write(cx, buf))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        delegate!(self, stream => Pin::new(stream).poll_flush(cx))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        delegate!(self, stream => Pin::new(stream).poll_shutdown(cx))
    }
}
