//! Rendezvous descriptor formats.
//!
//! Two descriptor flavours are involved in relaying:
//!
//! - [`CygwinDescriptor`]: what we publish for Cygwin/MSYS clients. The file
//!   reads `!<socket >PORT s XXXXXXXX-XXXXXXXX-XXXXXXXX-XXXXXXXX` plus a NUL,
//!   and the four words are the connection secret in little-endian order.
//! - [`AssuanDescriptor`]: what gpg-agent publishes on platforms without
//!   AF_UNIX: an ASCII port, a newline and a 16 byte nonce that has to be the
//!   first thing written on the loopback connection.

use std::{fs, io, path::Path};

use rand::RngCore;

use crate::error::CommonError;

/// Length of the Cygwin connection secret and of the assuan nonce
pub const SECRET_LEN: usize = 16;

/// Length of the Cygwin credential block (pid, uid, gid)
pub const CREDENTIALS_LEN: usize = 12;

const SOCKET_COOKIE: &str = "!<socket >";

/// Descriptor of an emulated Cygwin AF_UNIX socket
#[derive(Clone, PartialEq, Eq)]
pub struct CygwinDescriptor {
    pub port:   u16,
    pub secret: [u8; SECRET_LEN],
}

impl std::fmt::Debug for CygwinDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CygwinDescriptor")
            .field("port", &self.port)
            .finish_non_exhaustive()
    }
}

impl CygwinDescriptor {
    /// New descriptor with a freshly generated secret
    pub fn generate(port: u16) -> Self {
        let mut secret = [0u8; SECRET_LEN];
        rand::thread_rng().fill_bytes(&mut secret);
        Self { port, secret }
    }

    /// Secret as the four words Cygwin prints
    fn words(&self) -> [u32; 4] {
        let mut words = [0u32; 4];
        for (word, chunk) in words.iter_mut().zip(self.secret.chunks_exact(4)) {
            *word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        words
    }

    /// File content, including the trailing NUL
    pub fn encode(&self) -> Vec<u8> {
        let [a, b, c, d] = self.words();
        let mut out =
            format!("{SOCKET_COOKIE}{} s {a:08X}-{b:08X}-{c:08X}-{d:08X}", self.port).into_bytes();
        out.push(0);
        out
    }

    pub fn parse(data: &[u8]) -> Result<Self, CommonError> {
        let text = std::str::from_utf8(data)
            .map_err(|_| CommonError::Descriptor("cygwin descriptor is not text".into()))?;
        let text = text.trim_end_matches('\0');
        let rest = text
            .strip_prefix(SOCKET_COOKIE)
            .ok_or_else(|| CommonError::Descriptor("missing socket cookie".into()))?;

        let mut fields = rest.split(' ');
        let port = fields
            .next()
            .and_then(|p| p.parse::<u16>().ok())
            .ok_or_else(|| CommonError::Descriptor("bad port".into()))?;
        if fields.next() != Some("s") {
            return Err(CommonError::Descriptor("not a stream socket".into()));
        }
        let key = fields
            .next()
            .ok_or_else(|| CommonError::Descriptor("missing secret".into()))?;
        if fields.next().is_some() {
            return Err(CommonError::Descriptor("trailing data".into()));
        }

        let mut secret = [0u8; SECRET_LEN];
        let mut count = 0;
        for (i, word) in key.split('-').enumerate() {
            if i >= 4 || word.len() != 8 {
                return Err(CommonError::Descriptor("bad secret".into()));
            }
            let value = u32::from_str_radix(word, 16)
                .map_err(|_| CommonError::Descriptor("bad secret".into()))?;
            secret[i * 4..i * 4 + 4].copy_from_slice(&value.to_le_bytes());
            count += 1;
        }
        if count != 4 {
            return Err(CommonError::Descriptor("bad secret".into()));
        }

        Ok(Self { port, secret })
    }

    /// Write the descriptor so Cygwin recognises it as a socket
    pub fn write(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            crate::platform_socket::ensure_directory(parent)?;
        }
        remove_descriptor(path)?;
        fs::write(path, self.encode())?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
        }
        #[cfg(windows)]
        mark_system(path)?;

        Ok(())
    }

    pub fn read(path: &Path) -> Result<Self, CommonError> {
        Self::parse(&fs::read(path)?)
    }
}

/// Remove a descriptor file; a missing file is not an error
pub fn remove_descriptor(path: &Path) -> io::Result<()> {
    #[cfg(windows)]
    clear_attributes(path);
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[cfg(windows)]
fn wide(path: &Path) -> Vec<u16> {
    use std::os::windows::ffi::OsStrExt;
    path.as_os_str().encode_wide().chain(Some(0)).collect()
}

#[cfg(windows)]
fn mark_system(path: &Path) -> io::Result<()> {
    use windows::{
        core::PCWSTR,
        Win32::Storage::FileSystem::{SetFileAttributesW, FILE_ATTRIBUTE_SYSTEM},
    };

    let name = wide(path);
    // SAFETY: name is a NUL-terminated UTF-16 buffer that outlives the call
    unsafe { SetFileAttributesW(PCWSTR(name.as_ptr()), FILE_ATTRIBUTE_SYSTEM) }
        .map_err(|e| io::Error::other(e.to_string()))
}

#[cfg(windows)]
fn clear_attributes(path: &Path) {
    use windows::{
        core::PCWSTR,
        Win32::Storage::FileSystem::{SetFileAttributesW, FILE_ATTRIBUTE_NORMAL},
    };

    let name = wide(path);
    // SAFETY: name is a NUL-terminated UTF-16 buffer that outlives the call
    let _ = unsafe { SetFileAttributesW(PCWSTR(name.as_ptr()), FILE_ATTRIBUTE_NORMAL) };
}

/// Credential block exchanged after the Cygwin secret
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CygwinCredentials {
    pub pid: u32,
    pub uid: u32,
    pub gid: u32,
}

impl CygwinCredentials {
    pub fn to_bytes(self) -> [u8; CREDENTIALS_LEN] {
        let mut out = [0u8; CREDENTIALS_LEN];
        out[0..4].copy_from_slice(&self.pid.to_le_bytes());
        out[4..8].copy_from_slice(&self.uid.to_le_bytes());
        out[8..12].copy_from_slice(&self.gid.to_le_bytes());
        out
    }

    pub fn from_bytes(raw: &[u8; CREDENTIALS_LEN]) -> Self {
        let word = |i: usize| u32::from_le_bytes([raw[i], raw[i + 1], raw[i + 2], raw[i + 3]]);
        Self {
            pid: word(0),
            uid: word(4),
            gid: word(8),
        }
    }
}

/// gpg-agent's socket emulation file
#[derive(Clone, PartialEq, Eq)]
pub struct AssuanDescriptor {
    pub port:  u16,
    pub nonce: [u8; SECRET_LEN],
}

impl std::fmt::Debug for AssuanDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssuanDescriptor")
            .field("port", &self.port)
            .finish_non_exhaustive()
    }
}

impl AssuanDescriptor {
    pub fn parse(data: &[u8]) -> Result<Self, CommonError> {
        let newline = data
            .iter()
            .position(|b| *b == b'\n')
            .ok_or_else(|| CommonError::Descriptor("missing port terminator".into()))?;
        let port = std::str::from_utf8(&data[..newline])
            .ok()
            .and_then(|p| p.trim().parse::<u16>().ok())
            .filter(|p| *p != 0)
            .ok_or_else(|| CommonError::Descriptor("bad port".into()))?;
        let nonce: [u8; SECRET_LEN] = data[newline + 1..]
            .try_into()
            .map_err(|_| CommonError::Descriptor("nonce must be 16 bytes".into()))?;
        Ok(Self { port, nonce })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = format!("{}\n", self.port).into_bytes();
        out.extend_from_slice(&self.nonce);
        out
    }
}
