//! Publishing the variables that point clients at our connectors.
//!
//! Entries are committed as one transaction: either every entry is visible
//! afterwards or none is. Persistent entries go to a user-scoped store that
//! outlives this process as well as to the process environment.

use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
    sync::Arc,
};

use gpgbridge_common::{BridgeConfig, ConnectorKind, SshCompat};
use parking_lot::Mutex;

use crate::error::BridgeError;

pub const SSH_AUTH_SOCK: &str = "SSH_AUTH_SOCK";
pub const WSL_GNUPG_HOME: &str = "WSL_GNUPG_HOME";
pub const WIN_GNUPG_HOME: &str = "WIN_GNUPG_HOME";
pub const WSL_AGENT_HOME: &str = "WSL_AGENT_HOME";
pub const WIN_AGENT_HOME: &str = "WIN_AGENT_HOME";

/// One variable to publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvVarEntry {
    pub name:      String,
    pub value:     String,
    /// Also write to the user-scoped persistent store
    pub persist:   bool,
    /// Rewrite the value as a path inside the Linux subsystem
    pub translate: bool,
    applied:       bool,
}

impl EnvVarEntry {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name:      name.into(),
            value:     value.into(),
            persist:   false,
            translate: false,
            applied:   false,
        }
    }

    pub fn persistent(mut self) -> Self {
        self.persist = true;
        self
    }

    pub fn translated(mut self) -> Self {
        self.translate = true;
        self
    }

    pub fn is_applied(&self) -> bool {
        self.applied
    }

    /// The value actually written
    pub fn effective_value(&self) -> String {
        if self.translate {
            translate_path(&self.value)
        } else {
            self.value.clone()
        }
    }

    fn validate(&self) -> io::Result<()> {
        let invalid = |what: &str| io::Error::new(io::ErrorKind::InvalidInput, what.to_string());
        if self.name.is_empty() {
            return Err(invalid("empty variable name"));
        }
        if self.name.contains(['=', '\0']) {
            return Err(invalid("variable name contains '=' or NUL"));
        }
        if self.value.contains('\0') {
            return Err(invalid("variable value contains NUL"));
        }
        Ok(())
    }
}

/// A place variables can be written to
pub trait EnvStore: Send + Sync {
    fn set(&self, name: &str, value: &str) -> io::Result<()>;
    fn remove(&self, name: &str) -> io::Result<()>;
    fn get(&self, name: &str) -> Option<String>;
}

/// Serializes every access this crate makes to the process environment
static PROCESS_ENV: Mutex<()> = parking_lot::const_mutex(());

/// This process's environment, inherited by anything it spawns
///
/// Only the supervisor's start and stop paths write here; relay tasks never
/// read or write the environment. Threads outside this crate that read the
/// environment concurrently are not covered by the lock.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessEnvStore;

impl EnvStore for ProcessEnvStore {
    fn set(&self, name: &str, value: &str) -> io::Result<()> {
        let _guard = PROCESS_ENV.lock();
        std::env::set_var(name, value);
        Ok(())
    }

    fn remove(&self, name: &str) -> io::Result<()> {
        let _guard = PROCESS_ENV.lock();
        std::env::remove_var(name);
        Ok(())
    }

    fn get(&self, name: &str) -> Option<String> {
        let _guard = PROCESS_ENV.lock();
        std::env::var(name).ok()
    }
}

/// `NAME=value` lines in a systemd `environment.d` style file
#[derive(Debug, Clone)]
pub struct FileEnvStore {
    path: PathBuf,
    // Serializes read-modify-write cycles
    guard: Arc<Mutex<()>>,
}

impl FileEnvStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path:  path.into(),
            guard: Arc::new(Mutex::new(())),
        }
    }

    /// `~/.config/environment.d/gpgbridge.conf`, picked up by the user session
    pub fn user_default() -> Option<Self> {
        dirs::config_dir().map(|dir| Self::new(dir.join("environment.d").join("gpgbridge.conf")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> io::Result<Vec<(String, String)>> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        Ok(text
            .lines()
            .filter(|line| !line.trim_start().starts_with('#'))
            .filter_map(|line| line.split_once('='))
            .map(|(name, value)| (name.trim().to_string(), value.to_string()))
            .collect())
    }

    fn store(&self, vars: &[(String, String)]) -> io::Result<()> {
        if vars.is_empty() {
            return match fs::remove_file(&self.path) {
                Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
                _ => Ok(()),
            };
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut text = String::new();
        for (name, value) in vars {
            text.push_str(name);
            text.push('=');
            text.push_str(value);
            text.push('\n');
        }
        let staging = self.path.with_extension("conf.tmp");
        fs::write(&staging, text)?;
        fs::rename(&staging, &self.path)
    }
}

impl EnvStore for FileEnvStore {
    fn set(&self, name: &str, value: &str) -> io::Result<()> {
        let _guard = self.guard.lock();
        let mut vars = self.load()?;
        match vars.iter_mut().find(|(n, _)| n == name) {
            Some(entry) => entry.1 = value.to_string(),
            None => vars.push((name.to_string(), value.to_string())),
        }
        self.store(&vars)
    }

    fn remove(&self, name: &str) -> io::Result<()> {
        let _guard = self.guard.lock();
        let mut vars = self.load()?;
        let before = vars.len();
        vars.retain(|(n, _)| n != name);
        if vars.len() == before {
            return Ok(());
        }
        self.store(&vars)
    }

    fn get(&self, name: &str) -> Option<String> {
        let _guard = self.guard.lock();
        self.load()
            .ok()?
            .into_iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }
}

/// `HKCU\Environment`, announced to running programs with `WM_SETTINGCHANGE`
#[cfg(windows)]
#[derive(Debug, Default, Clone, Copy)]
pub struct RegistryEnvStore;

#[cfg(windows)]
mod registry {
    use std::{ffi::c_void, io};

    use windows::{
        core::{w, HSTRING, PCWSTR},
        Win32::{
            Foundation::{ERROR_FILE_NOT_FOUND, LPARAM, WIN32_ERROR, WPARAM},
            System::Registry::{
                RegCloseKey, RegDeleteValueW, RegGetValueW, RegOpenKeyExW, RegSetValueExW, HKEY,
                HKEY_CURRENT_USER, KEY_READ, KEY_WRITE, REG_SZ, RRF_RT_REG_SZ,
            },
            UI::WindowsAndMessaging::{
                SendMessageTimeoutW, HWND_BROADCAST, SMTO_ABORTIFHUNG, WM_SETTINGCHANGE,
            },
        },
    };

    fn check(code: WIN32_ERROR) -> io::Result<()> {
        if code.is_ok() {
            Ok(())
        } else {
            Err(io::Error::from_raw_os_error(code.0 as i32))
        }
    }

    struct Key(HKEY);

    impl Drop for Key {
        fn drop(&mut self) {
            unsafe {
                let _ = RegCloseKey(self.0);
            }
        }
    }

    fn open() -> io::Result<Key> {
        let mut key = HKEY::default();
        check(unsafe {
            RegOpenKeyExW(HKEY_CURRENT_USER, w!("Environment"), 0, KEY_READ | KEY_WRITE, &mut key)
        })?;
        Ok(Key(key))
    }

    fn broadcast() {
        unsafe {
            let _ = SendMessageTimeoutW(
                HWND_BROADCAST,
                WM_SETTINGCHANGE,
                WPARAM(0),
                LPARAM(w!("Environment").as_ptr() as isize),
                SMTO_ABORTIFHUNG,
                5000,
                None,
            );
        }
    }

    pub(super) fn set(name: &str, value: &str) -> io::Result<()> {
        let key = open()?;
        let wide: Vec<u16> = value.encode_utf16().chain(Some(0)).collect();
        let bytes = unsafe { std::slice::from_raw_parts(wide.as_ptr() as *const u8, wide.len() * 2) };
        check(unsafe { RegSetValueExW(key.0, &HSTRING::from(name), 0, REG_SZ, Some(bytes)) })?;
        broadcast();
        Ok(())
    }

    pub(super) fn remove(name: &str) -> io::Result<()> {
        let key = open()?;
        let code = unsafe { RegDeleteValueW(key.0, &HSTRING::from(name)) };
        if code != ERROR_FILE_NOT_FOUND {
            check(code)?;
        }
        broadcast();
        Ok(())
    }

    pub(super) fn get(name: &str) -> Option<String> {
        let key = open().ok()?;
        let name = HSTRING::from(name);
        let mut size = 0u32;
        unsafe {
            check(RegGetValueW(key.0, PCWSTR::null(), &name, RRF_RT_REG_SZ, None, None, Some(&mut size as *mut u32)))
                .ok()?;
        }
        let mut buf = vec![0u16; (size as usize).div_ceil(2)];
        unsafe {
            check(RegGetValueW(
                key.0,
                PCWSTR::null(),
                &name,
                RRF_RT_REG_SZ,
                None,
                Some(buf.as_mut_ptr() as *mut c_void),
                Some(&mut size as *mut u32),
            ))
            .ok()?;
        }
        let len = buf.iter().position(|c| *c == 0).unwrap_or(buf.len());
        String::from_utf16(&buf[..len]).ok()
    }
}

#[cfg(windows)]
impl EnvStore for RegistryEnvStore {
    fn set(&self, name: &str, value: &str) -> io::Result<()> {
        registry::set(name, value)
    }

    fn remove(&self, name: &str) -> io::Result<()> {
        registry::remove(name)
    }

    fn get(&self, name: &str) -> Option<String> {
        registry::get(name)
    }
}

/// In-memory store, also useful for dry runs
///
/// Records every mutation in order and can be told to fail on one name.
#[derive(Debug, Default)]
pub struct MemoryEnvStore {
    vars:    Mutex<BTreeMap<String, String>>,
    journal: Mutex<Vec<String>>,
    fail_on: Option<String>,
}

impl MemoryEnvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store whose `set` fails for `name`
    pub fn failing_on(name: impl Into<String>) -> Self {
        Self {
            fail_on: Some(name.into()),
            ..Self::default()
        }
    }

    /// Mutations so far, as `set NAME` / `remove NAME`
    pub fn journal(&self) -> Vec<String> {
        self.journal.lock().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.lock().is_empty()
    }
}

impl EnvStore for MemoryEnvStore {
    fn set(&self, name: &str, value: &str) -> io::Result<()> {
        if self.fail_on.as_deref() == Some(name) {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "store refused the variable"));
        }
        self.vars.lock().insert(name.to_string(), value.to_string());
        self.journal.lock().push(format!("set {name}"));
        Ok(())
    }

    fn remove(&self, name: &str) -> io::Result<()> {
        self.vars.lock().remove(name);
        self.journal.lock().push(format!("remove {name}"));
        Ok(())
    }

    fn get(&self, name: &str) -> Option<String> {
        self.vars.lock().get(name).cloned()
    }
}

/// Transactional publisher over a process store and a persistent store
pub struct EnvironmentPublisher {
    process:    Arc<dyn EnvStore>,
    persistent: Arc<dyn EnvStore>,
    applied:    Vec<EnvVarEntry>,
}

impl std::fmt::Debug for EnvironmentPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvironmentPublisher")
            .field("applied", &self.applied)
            .finish_non_exhaustive()
    }
}

impl EnvironmentPublisher {
    pub fn new(process: Arc<dyn EnvStore>, persistent: Arc<dyn EnvStore>) -> Self {
        Self {
            process,
            persistent,
            applied: Vec::new(),
        }
    }

    /// Process environment plus the platform's user-scoped store
    pub fn for_platform() -> Self {
        #[cfg(windows)]
        let persistent: Arc<dyn EnvStore> = Arc::new(RegistryEnvStore);
        #[cfg(not(windows))]
        let persistent: Arc<dyn EnvStore> = match FileEnvStore::user_default() {
            Some(store) => Arc::new(store),
            None => {
                tracing::warn!("no user config directory, persistent variables stay in memory");
                Arc::new(MemoryEnvStore::new())
            }
        };
        Self::new(Arc::new(ProcessEnvStore), persistent)
    }

    pub fn is_applied(&self) -> bool {
        !self.applied.is_empty()
    }

    /// Entries currently published, in the order they were applied
    pub fn applied(&self) -> &[EnvVarEntry] {
        &self.applied
    }

    /// Publish `entries` in order, all or nothing
    ///
    /// Anything still published from an earlier call is revoked first. On
    /// failure every entry of this call is rolled back in reverse order and
    /// the error names the entry that failed.
    pub fn apply(&mut self, entries: Vec<EnvVarEntry>) -> Result<(), BridgeError> {
        if self.is_applied() {
            self.revoke();
        }

        for mut entry in entries {
            if let Err(source) = self.apply_one(&entry) {
                tracing::warn!(name = %entry.name, "publishing failed, rolling back: {source}");
                self.revoke();
                return Err(BridgeError::EnvApply {
                    name: entry.name,
                    source,
                });
            }
            entry.applied = true;
            tracing::debug!(name = %entry.name, persist = entry.persist, "variable published");
            self.applied.push(entry);
        }
        Ok(())
    }

    fn apply_one(&self, entry: &EnvVarEntry) -> io::Result<()> {
        entry.validate()?;
        let value = entry.effective_value();
        self.process.set(&entry.name, &value)?;
        if entry.persist {
            if let Err(e) = self.persistent.set(&entry.name, &value) {
                let _ = self.process.remove(&entry.name);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Remove everything published, newest first
    ///
    /// Individual failures are logged and skipped. Calling this again does
    /// nothing.
    pub fn revoke(&mut self) {
        while let Some(mut entry) = self.applied.pop() {
            if entry.persist {
                if let Err(e) = self.persistent.remove(&entry.name) {
                    tracing::warn!(name = %entry.name, "unable to remove persistent variable: {e}");
                }
            }
            if let Err(e) = self.process.remove(&entry.name) {
                tracing::warn!(name = %entry.name, "unable to remove variable: {e}");
            }
            entry.applied = false;
            tracing::debug!(name = %entry.name, "variable revoked");
        }
    }
}

/// Rewrite a Windows drive path into its `/mnt/<drive>` form
///
/// Anything that does not start with a drive letter is returned unchanged.
pub fn translate_path(path: &str) -> String {
    let bytes = path.as_bytes();
    let has_drive = bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':';
    if !has_drive || (bytes.len() > 2 && !matches!(bytes[2], b'\\' | b'/')) {
        return path.to_string();
    }

    let drive = (bytes[0] as char).to_ascii_lowercase();
    let rest = path[2..].replace('\\', "/");
    let rest = rest.trim_end_matches('/');
    if rest.is_empty() {
        format!("/mnt/{drive}")
    } else {
        format!("/mnt/{drive}{rest}")
    }
}

/// Forward-slash form of a Windows path
pub fn windows_path(path: &str) -> String {
    path.replace('\\', "/")
}

/// The variables a running bridge publishes for its clients
pub fn standard_entries(cfg: &BridgeConfig) -> Vec<EnvVarEntry> {
    let ssh_kind = match cfg.gui.ssh {
        SshCompat::Native => ConnectorKind::PipeSsh,
        SshCompat::Cygwin => ConnectorKind::SockAgentCygwinSsh,
    };
    let gpg_home = cfg.gpg.home.to_string_lossy().into_owned();
    let agent_home = cfg.gui.home.to_string_lossy().into_owned();

    let mut entries = Vec::with_capacity(5);
    if let Some(sock) = ssh_kind.listen_address(cfg).client_path() {
        entries.push(EnvVarEntry::new(SSH_AUTH_SOCK, sock.to_string_lossy()).persistent());
    }
    entries.extend([
        EnvVarEntry::new(WSL_GNUPG_HOME, gpg_home.clone()).persistent().translated(),
        EnvVarEntry::new(WIN_GNUPG_HOME, windows_path(&gpg_home)).persistent(),
        EnvVarEntry::new(WSL_AGENT_HOME, agent_home.clone()).persistent().translated(),
        EnvVarEntry::new(WIN_AGENT_HOME, windows_path(&agent_home)).persistent(),
    ]);
    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    fn publisher(persistent: Arc<MemoryEnvStore>) -> (EnvironmentPublisher, Arc<MemoryEnvStore>) {
        let process = Arc::new(MemoryEnvStore::new());
        (EnvironmentPublisher::new(process.clone(), persistent), process)
    }

    #[test]
    fn process_store_round_trip() {
        let store = ProcessEnvStore;
        let name = "GPGBRIDGE_TEST_PROCESS_STORE";
        store.set(name, "/run/bridge/S.gpg-agent").unwrap();
        assert_eq!(store.get(name).as_deref(), Some("/run/bridge/S.gpg-agent"));
        store.remove(name).unwrap();
        assert_eq!(store.get(name), None);
    }

    #[test]
    fn translates_drive_paths() {
        assert_eq!(translate_path(r"C:\Users\me\gnupg"), "/mnt/c/Users/me/gnupg");
        assert_eq!(translate_path("D:/work/"), "/mnt/d/work");
        assert_eq!(translate_path("E:"), "/mnt/e");
        assert_eq!(translate_path("/home/me/.gnupg"), "/home/me/.gnupg");
        assert_eq!(translate_path("c:relative"), "c:relative");
        assert_eq!(windows_path(r"C:\Users\me"), "C:/Users/me");
    }

    #[test]
    fn failure_rolls_back_everything() {
        let persistent = Arc::new(MemoryEnvStore::failing_on("C"));
        let (mut env, process) = publisher(persistent.clone());

        let err = env
            .apply(vec![
                EnvVarEntry::new("A", "valA").persistent(),
                EnvVarEntry::new("B", "valB").persistent(),
                EnvVarEntry::new("C", "valC").persistent(),
            ])
            .unwrap_err();

        assert!(matches!(err, BridgeError::EnvApply { ref name, .. } if name == "C"));
        assert!(!env.is_applied());
        for name in ["A", "B", "C"] {
            assert_eq!(process.get(name), None);
            assert_eq!(persistent.get(name), None);
        }
        assert_eq!(
            persistent.journal(),
            ["set A", "set B", "remove B", "remove A"]
        );
    }

    #[test]
    fn revoke_undoes_in_reverse_and_is_idempotent() {
        let persistent = Arc::new(MemoryEnvStore::new());
        let (mut env, process) = publisher(persistent.clone());

        env.apply(vec![
            EnvVarEntry::new("SOCK", "/tmp/s"),
            EnvVarEntry::new("HOME_WSL", r"C:\g").persistent().translated(),
        ])
        .unwrap();
        assert_eq!(process.get("HOME_WSL").as_deref(), Some("/mnt/c/g"));
        assert_eq!(persistent.get("HOME_WSL").as_deref(), Some("/mnt/c/g"));
        assert_eq!(persistent.get("SOCK"), None);
        assert!(env.applied().iter().all(EnvVarEntry::is_applied));

        env.revoke();
        assert_eq!(
            process.journal(),
            ["set SOCK", "set HOME_WSL", "remove HOME_WSL", "remove SOCK"]
        );
        assert!(process.is_empty() && persistent.is_empty());

        env.revoke();
        assert_eq!(process.journal().len(), 4);
    }

    #[test]
    fn invalid_name_is_rejected() {
        let (mut env, process) = publisher(Arc::new(MemoryEnvStore::new()));
        let err = env
            .apply(vec![EnvVarEntry::new("OK", "1"), EnvVarEntry::new("BAD=NAME", "2")])
            .unwrap_err();
        assert!(matches!(err, BridgeError::EnvApply { ref name, .. } if name == "BAD=NAME"));
        assert_eq!(process.get("OK"), None);
    }

    #[test]
    fn reapply_replaces_previous_entries() {
        let (mut env, process) = publisher(Arc::new(MemoryEnvStore::new()));
        env.apply(vec![EnvVarEntry::new("OLD", "1")]).unwrap();
        env.apply(vec![EnvVarEntry::new("NEW", "2")]).unwrap();
        assert_eq!(process.get("OLD"), None);
        assert_eq!(process.get("NEW").as_deref(), Some("2"));
        assert_eq!(env.applied().len(), 1);
    }

    #[test]
    fn file_store_rewrites_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileEnvStore::new(dir.path().join("environment.d").join("gpgbridge.conf"));

        store.set("A", "1").unwrap();
        store.set("B", "/mnt/c/x").unwrap();
        store.set("A", "2").unwrap();
        assert_eq!(
            fs::read_to_string(store.path()).unwrap(),
            "A=2\nB=/mnt/c/x\n"
        );
        assert_eq!(store.get("B").as_deref(), Some("/mnt/c/x"));

        store.remove("A").unwrap();
        store.remove("missing").unwrap();
        store.remove("B").unwrap();
        assert!(!store.path().exists());
    }

    #[test]
    fn standard_entries_follow_ssh_mode() {
        let mut cfg = BridgeConfig::default();
        cfg.gpg.home = PathBuf::from("/home/me/.gnupg");
        cfg.gui.home = PathBuf::from("/run/gpgbridge");
        cfg.gui.pipe_dir = PathBuf::from("/run/pipes");

        let entries = standard_entries(&cfg);
        let names: Vec<_> = entries.iter().map(|e| e.name.clone()).collect();
        assert_eq!(
            names,
            [SSH_AUTH_SOCK, WSL_GNUPG_HOME, WIN_GNUPG_HOME, WSL_AGENT_HOME, WIN_AGENT_HOME]
        );
        assert!(entries.iter().all(|e| e.persist));
        assert!(!entries[0].translate);

        cfg.gui.ssh = SshCompat::Cygwin;
        let entries = standard_entries(&cfg);
        assert_eq!(entries[0].value, "/run/gpgbridge/S.gpg-agent.ssh.cyg");
        assert!(entries[0].persist && !entries[0].translate);
        assert!(entries[1].persist && entries[1].translate);
        assert!(entries[2].persist && !entries[2].translate);
    }
}
