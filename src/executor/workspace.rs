//! Per-run workspace directories
//!
//! Every run checks its sources out into `<root>/<uuid>`. The [`Workspace`]
//! guard owns that directory and removes it when dropped, on every exit path
//! including unwinding. Checkouts can leave read-only files and directories
//! behind, so write permission is restored across the tree before removal.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

/// Exclusive owner of one run's checkout directory
#[derive(Debug)]
pub struct Workspace {
    path: PathBuf,
}

impl Workspace {
    /// Reserves a fresh, uniquely named directory under `root`
    ///
    /// Only the path is chosen here; the directory itself is created by
    /// whatever populates it (the checkout step).
    #[must_use]
    pub fn allocate(root: &Path) -> Self {
        Self {
            path: root.join(Uuid::new_v4().to_string()),
        }
    }

    /// Path of the workspace directory
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if !self.path.exists() {
            return;
        }
        if let Err(err) = clear_readonly(&self.path) {
            warn!(workspace = %self.path.display(), error = %err, "failed to clear read-only attributes");
        }
        match fs::remove_dir_all(&self.path) {
            Ok(()) => debug!(workspace = %self.path.display(), "workspace removed"),
            Err(err) => {
                warn!(workspace = %self.path.display(), error = %err, "failed to remove workspace");
            }
        }
    }
}

/// Restores owner write access to every file and directory under `path`
///
/// Symlinks are not followed.
///
/// # Errors
///
/// Returns the first I/O error encountered while walking the tree.
pub fn clear_readonly(path: &Path) -> io::Result<()> {
    let metadata = fs::symlink_metadata(path)?;
    if metadata.file_type().is_symlink() {
        return Ok(());
    }

    make_writable(path, &metadata)?;
    if metadata.is_dir() {
        for entry in fs::read_dir(path)? {
            clear_readonly(&entry?.path())?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn make_writable(path: &Path, metadata: &fs::Metadata) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut permissions = metadata.permissions();
    let wanted = if metadata.is_dir() { 0o700 } else { 0o600 };
    let mode = permissions.mode();
    if mode & wanted != wanted {
        permissions.set_mode(mode | wanted);
        fs::set_permissions(path, permissions)?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn make_writable(path: &Path, metadata: &fs::Metadata) -> io::Result<()> {
    let mut permissions = metadata.permissions();
    if permissions.readonly() {
        #[allow(clippy::permissions_set_readonly_false)]
        permissions.set_readonly(false);
        fs::set_permissions(path, permissions)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_allocate_is_unique_under_root() {
        let root = TempDir::new().unwrap();
        let a = Workspace::allocate(root.path());
        let b = Workspace::allocate(root.path());
        assert_ne!(a.path(), b.path());
        assert_eq!(a.path().parent(), Some(root.path()));
        assert!(!a.path().exists());
    }

    #[test]
    fn test_drop_removes_tree() {
        let root = TempDir::new().unwrap();
        let workspace = Workspace::allocate(root.path());
        let path = workspace.path().to_path_buf();
        fs::create_dir_all(path.join("src/nested")).unwrap();
        fs::write(path.join("src/nested/main.rs"), "fn main() {}").unwrap();

        drop(workspace);

        assert!(!path.exists());
    }

    #[test]
    fn test_drop_removes_read_only_entries() {
        let root = TempDir::new().unwrap();
        let workspace = Workspace::allocate(root.path());
        let path = workspace.path().to_path_buf();
        let objects = path.join(".git/objects");
        fs::create_dir_all(&objects).unwrap();
        let pack = objects.join("pack-1.pack");
        fs::write(&pack, b"PACK").unwrap();

        let mut permissions = fs::metadata(&pack).unwrap().permissions();
        permissions.set_readonly(true);
        fs::set_permissions(&pack, permissions).unwrap();
        let mut permissions = fs::metadata(&objects).unwrap().permissions();
        permissions.set_readonly(true);
        fs::set_permissions(&objects, permissions).unwrap();

        drop(workspace);

        assert!(!path.exists());
    }

    #[test]
    fn test_drop_of_never_created_workspace_is_silent() {
        let root = TempDir::new().unwrap();
        let workspace = Workspace::allocate(root.path());
        drop(workspace);
        assert!(fs::read_dir(root.path()).unwrap().next().is_none());
    }
}
