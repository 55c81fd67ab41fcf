//! Sentinel lock over the results working copy
//!
//! The lock is a file created with `create_new`, so acquisition is atomic
//! across processes and hosts sharing the filesystem. It holds the owner's
//! PID for diagnosis and is removed when the guard drops.

use super::results::StoreError;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

/// Exclusive inter-process lock, released on drop
#[derive(Debug)]
pub struct SentinelLock {
    path: PathBuf,
}

impl SentinelLock {
    /// Creates the lock file, failing if it already exists
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::LockHeld`] when another writer owns the lock and
    /// [`StoreError::Io`] for any other filesystem failure.
    pub fn acquire(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                let holder = Self::holder(path);
                tracing::debug!(lock = %path.display(), holder, "Results lock is taken");
                return Err(StoreError::LockHeld {
                    path: path.to_path_buf(),
                    holder,
                });
            }
            Err(source) => {
                return Err(StoreError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };

        // From here on the guard owns the file and removes it on every path.
        let lock = Self {
            path: path.to_path_buf(),
        };
        write!(file, "{}", std::process::id()).map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::debug!(lock = %path.display(), "Acquired results lock");
        Ok(lock)
    }

    /// PID written by the current holder of the lock at `path`
    ///
    /// `None` when the file is missing, unreadable or still being written.
    #[must_use]
    pub fn holder(path: &Path) -> Option<u32> {
        fs::read_to_string(path).ok()?.trim().parse().ok()
    }

    /// Path of the lock file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SentinelLock {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            tracing::warn!(lock = %self.path.display(), error = %err, "Failed to remove results lock");
        }
    }
}
