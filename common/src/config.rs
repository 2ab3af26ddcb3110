use std::{
    env, fmt, fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{error::CommonError, platform_socket::ListenAddress};

/// Conventional name of the Windows OpenSSH agent pipe
pub const SSH_PIPE_NAME: &str = "openssh-ssh-agent";

/// gpg-agent socket names, shared by the backend home and our own home
pub const GPG_AGENT_SOCKET: &str = "S.gpg-agent";
pub const GPG_AGENT_EXTRA_SOCKET: &str = "S.gpg-agent.extra";
pub const GPG_AGENT_SSH_SOCKET: &str = "S.gpg-agent.ssh";
pub const CYGWIN_SSH_SOCKET: &str = "S.gpg-agent.ssh.cyg";

const CONFIG_PATH_ENV: &str = "GPGBRIDGE_CONFIG";
const HOME_DIR_ENV: &str = "GPGBRIDGE_HOME";
const GNUPG_HOME_ENV: &str = "GNUPGHOME";
const DEFAULT_HOME_SUBDIR: &str = "gpgbridge";

/// Logical backend agents the bridge can relay to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogicalAgent {
    /// Main gpg-agent socket
    Gpg,
    /// Restricted gpg-agent socket meant for forwarding
    GpgExtra,
    /// gpg-agent acting as ssh-agent
    Ssh,
}

impl LogicalAgent {
    /// File name of the rendezvous descriptor inside the backend home
    pub fn descriptor_name(self) -> &'static str {
        match self {
            LogicalAgent::Gpg => GPG_AGENT_SOCKET,
            LogicalAgent::GpgExtra => GPG_AGENT_EXTRA_SOCKET,
            LogicalAgent::Ssh => GPG_AGENT_SSH_SOCKET,
        }
    }
}

impl fmt::Display for LogicalAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogicalAgent::Gpg => "gpg",
            LogicalAgent::GpgExtra => "gpg-extra",
            LogicalAgent::Ssh => "ssh",
        };
        f.write_str(name)
    }
}

/// Every transport identity the bridge can listen on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectorKind {
    /// Emulated Cygwin/MSYS AF_UNIX socket over loopback TCP, for ssh
    SockAgentCygwinSsh,
    /// Native pipe for Windows OpenSSH
    PipeSsh,
    /// Native AF_UNIX socket for ssh
    SockAgentSsh,
    /// Loopback TCP port for gpg
    ExtraPort,
    /// Native AF_UNIX socket for gpg
    SockAgent,
    /// Native AF_UNIX socket for the restricted gpg socket
    SockAgentExtra,
}

impl ConnectorKind {
    /// All kinds, in the order they are brought up by default
    pub const ALL: [ConnectorKind; 6] = [
        ConnectorKind::SockAgentCygwinSsh,
        ConnectorKind::PipeSsh,
        ConnectorKind::SockAgentSsh,
        ConnectorKind::ExtraPort,
        ConnectorKind::SockAgent,
        ConnectorKind::SockAgentExtra,
    ];

    /// Kinds that listen on a native AF_UNIX socket
    pub fn is_native_socket(self) -> bool {
        matches!(
            self,
            ConnectorKind::SockAgentSsh | ConnectorKind::SockAgent | ConnectorKind::SockAgentExtra
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectorKind::SockAgentCygwinSsh => "sock_agent_cygwin_ssh",
            ConnectorKind::PipeSsh => "pipe_ssh",
            ConnectorKind::SockAgentSsh => "sock_agent_ssh",
            ConnectorKind::ExtraPort => "extra_port",
            ConnectorKind::SockAgent => "sock_agent",
            ConnectorKind::SockAgentExtra => "sock_agent_extra",
        }
    }

    /// Resolve the address this kind listens on under the given configuration
    pub fn listen_address(self, cfg: &BridgeConfig) -> ListenAddress {
        match self {
            ConnectorKind::SockAgentCygwinSsh => ListenAddress::EmulatedUnix {
                descriptor: cfg.gui.home.join(CYGWIN_SSH_SOCKET),
                port:       cfg.gui.cygwin_port,
            },
            ConnectorKind::PipeSsh => ListenAddress::Pipe {
                name: cfg.gui.pipe_name.clone(),
                dir:  cfg.gui.pipe_dir.clone(),
            },
            ConnectorKind::SockAgentSsh => ListenAddress::Unix(cfg.gui.home.join(GPG_AGENT_SSH_SOCKET)),
            ConnectorKind::ExtraPort => ListenAddress::Tcp(std::net::SocketAddr::from((
                std::net::Ipv4Addr::LOCALHOST,
                cfg.gui.extra_port,
            ))),
            ConnectorKind::SockAgent => ListenAddress::Unix(cfg.gui.home.join(GPG_AGENT_SOCKET)),
            ConnectorKind::SockAgentExtra => {
                ListenAddress::Unix(cfg.gui.home.join(GPG_AGENT_EXTRA_SOCKET))
            }
        }
    }
}

impl fmt::Display for ConnectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConnectorKind {
    type Err = CommonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ConnectorKind::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| CommonError::Config(format!("unknown connector kind: {s}")))
    }
}

/// Which socket flavour `SSH_AUTH_SOCK` should point ssh clients at
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SshCompat {
    /// Windows OpenSSH, through the native pipe
    #[default]
    Native,
    /// Cygwin/MSYS ssh ports, through the emulated socket
    Cygwin,
}

/// Backend (gpg-agent) side of the configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GpgConfig {
    /// Directory where the backend keeps its rendezvous descriptors
    pub home: PathBuf,
}

impl Default for GpgConfig {
    fn default() -> Self {
        Self { home: default_gpg_home() }
    }
}

/// Bridge side of the configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuiConfig {
    /// Working directory holding our own sockets and descriptors
    pub home:        PathBuf,
    /// Pipe name for the native ssh connector
    pub pipe_name:   String,
    /// Where pipe-namespace sockets live on platforms without named pipes
    pub pipe_dir:    PathBuf,
    /// Loopback TCP port for gpg, 0 disables the connector
    pub extra_port:  u16,
    /// Loopback port behind the Cygwin descriptor, 0 picks an ephemeral one
    pub cygwin_port: u16,
    pub ssh:         SshCompat,
    /// Publish client environment variables
    pub set_env:     bool,
    pub debug:       bool,
}

impl Default for GuiConfig {
    fn default() -> Self {
        Self {
            home:        default_bridge_home(),
            pipe_name:   SSH_PIPE_NAME.to_string(),
            pipe_dir:    env::temp_dir(),
            extra_port:  0,
            cygwin_port: 0,
            ssh:         SshCompat::Native,
            set_env:     false,
            debug:       false,
        }
    }
}

/// Enabled connectors, in start order
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectorsConfig {
    pub enabled: Vec<ConnectorKind>,
}

impl Default for ConnectorsConfig {
    fn default() -> Self {
        // The runtime has no AF_UNIX listener on Windows
        let enabled = ConnectorKind::ALL
            .into_iter()
            .filter(|kind| cfg!(unix) || !kind.is_native_socket())
            .collect();
        Self { enabled }
    }
}

/// How delays grow between backend dial attempts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    #[default]
    Fixed,
    Exponential,
}

/// Retry policy applied when the backend cannot be dialed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Extra attempts after the first failure
    pub attempts: u32,
    pub delay_ms: u64,
    pub backoff:  Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 1,
            delay_ms: 250,
            backoff:  Backoff::Fixed,
        }
    }
}

impl RetryPolicy {
    /// Never retry
    pub fn none() -> Self {
        Self {
            attempts: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = Duration::from_millis(self.delay_ms);
        match self.backoff {
            Backoff::Fixed => base,
            Backoff::Exponential => {
                let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
                base.saturating_mul(factor)
            }
        }
    }
}

/// Timeouts and limits of the relay core
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub handshake_timeout_ms: u64,
    pub drain_timeout_ms:     u64,
    pub accept_backoff_ms:    u64,
    /// Consecutive accept failures before a connector gives up
    pub max_accept_failures:  u32,
    pub backend_retry:        RetryPolicy,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: 5_000,
            drain_timeout_ms:     3_000,
            accept_backoff_ms:    100,
            max_accept_failures:  10,
            backend_retry:        RetryPolicy::default(),
        }
    }
}

impl RelayConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn accept_backoff(&self) -> Duration {
        Duration::from_millis(self.accept_backoff_ms)
    }
}

/// Complete bridge configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub gpg:        GpgConfig,
    pub gui:        GuiConfig,
    pub connectors: ConnectorsConfig,
    pub relay:      RelayConfig,
}

impl BridgeConfig {
    /// Reads a JSON configuration file
    pub fn load(path: &Path) -> Result<Self, CommonError> {
        let data = fs::read_to_string(path).map_err(|e| {
            CommonError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        serde_json::from_str(&data)
            .map_err(|e| CommonError::Config(format!("cannot parse {}: {e}", path.display())))
    }

    /// Builds the configuration from the environment
    ///
    /// Reads the file named by GPGBRIDGE_CONFIG when it is set, then applies
    /// GPGBRIDGE_HOME and GNUPGHOME overrides.
    pub fn from_env() -> Result<Self, CommonError> {
        let mut cfg = match env::var_os(CONFIG_PATH_ENV) {
            Some(path) => Self::load(Path::new(&path))?,
            None => Self::default(),
        };

        if let Some(home) = env::var_os(HOME_DIR_ENV) {
            cfg.gui.home = PathBuf::from(home);
        }
        if let Some(home) = env::var_os(GNUPG_HOME_ENV) {
            cfg.gpg.home = PathBuf::from(home);
        }

        tracing::debug!(
            gpg_home = %cfg.gpg.home.display(),
            home = %cfg.gui.home.display(),
            "configuration resolved"
        );
        Ok(cfg)
    }

    /// Connectors to start, in order; `ExtraPort` is skipped while its port is 0
    pub fn enabled_connectors(&self) -> Vec<ConnectorKind> {
        let mut kinds: Vec<ConnectorKind> = Vec::with_capacity(self.connectors.enabled.len());
        for kind in &self.connectors.enabled {
            if *kind == ConnectorKind::ExtraPort && self.gui.extra_port == 0 {
                continue;
            }
            if !kinds.contains(kind) {
                kinds.push(*kind);
            }
        }
        kinds
    }
}

fn default_gpg_home() -> PathBuf {
    if let Some(home) = env::var_os(GNUPG_HOME_ENV) {
        return PathBuf::from(home);
    }
    #[cfg(windows)]
    {
        dirs::data_dir()
            .map(|d| d.join("gnupg"))
            .unwrap_or_else(|| PathBuf::from("gnupg"))
    }
    #[cfg(not(windows))]
    {
        dirs::home_dir()
            .map(|d| d.join(".gnupg"))
            .unwrap_or_else(|| PathBuf::from(".gnupg"))
    }
}

fn default_bridge_home() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(env::temp_dir)
        .join(DEFAULT_HOME_SUBDIR)
}
