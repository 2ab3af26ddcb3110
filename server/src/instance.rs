//! Single running bridge per user.
//!
//! A second bridge would overwrite the first one's descriptors and fight
//! over its sockets, so the binary takes an exclusive lock on a file in
//! `gui.home` before serving anything.

use std::{
    fs::{File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
};

use fs2::FileExt;

use crate::error::BridgeError;

pub const LOCK_FILE: &str = "gpgbridge.lock";

/// Exclusive hold on the instance lock, released on drop
#[derive(Debug)]
pub struct InstanceGuard {
    file: File,
    path: PathBuf,
}

impl InstanceGuard {
    /// Take the instance lock in `dir`
    ///
    /// Returns `None` when another process already holds it. The lock file
    /// itself is left in place; only the lock on it matters.
    pub fn acquire(dir: &Path) -> Result<Option<Self>, BridgeError> {
        let path = dir.join(LOCK_FILE);
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(e) = std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)) {
                tracing::warn!(path = %path.display(), "unable to restrict lock file: {e}");
            }
        }

        match file.try_lock_exclusive() {
            Ok(()) => {}
            Err(e) if is_contended(&e) => {
                tracing::debug!(path = %path.display(), "instance lock held elsewhere");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        }

        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        tracing::debug!(path = %path.display(), "instance lock taken");
        Ok(Some(Self { file, path }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstanceGuard {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!(path = %self.path.display(), "unable to release instance lock: {e}");
        }
    }
}

fn is_contended(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
        || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_instance_is_turned_away() {
        let dir = tempfile::tempdir().unwrap();

        let first = InstanceGuard::acquire(dir.path()).unwrap().unwrap();
        assert_eq!(first.path(), dir.path().join(LOCK_FILE));
        assert!(InstanceGuard::acquire(dir.path()).unwrap().is_none());

        let pid = std::fs::read_to_string(first.path()).unwrap();
        assert_eq!(pid.trim(), std::process::id().to_string());

        drop(first);
        assert!(InstanceGuard::acquire(dir.path()).unwrap().is_some());
    }

    #[test]
    fn missing_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = InstanceGuard::acquire(&dir.path().join("absent")).unwrap_err();
        assert!(matches!(err, BridgeError::Io(_)));
    }
}
