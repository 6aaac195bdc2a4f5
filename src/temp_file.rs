//! Drop guard for temporary files.

use std::path::{Path, PathBuf};

/// Removes the file at `path` when dropped, unless defused first.
#[derive(Debug)]
pub struct TempFileGuard {
    path: Option<PathBuf>,
}

impl TempFileGuard {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: Some(path.as_ref().to_path_buf()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Keep the file; call once it has been renamed into place.
    pub fn defuse(mut self) {
        self.path = None;
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            match std::fs::remove_file(&path) {
                Ok(()) => tracing::debug!("Removed temp file {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!("Failed to remove temp file {}: {}", path.display(), e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_guard_removes_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("x.tmp");
        std::fs::write(&path, b"partial").unwrap();

        drop(TempFileGuard::new(&path));
        assert!(!path.exists());
    }

    #[test]
    fn test_defused_guard_keeps_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("x.tmp");
        std::fs::write(&path, b"done").unwrap();

        TempFileGuard::new(&path).defuse();
        assert!(path.exists());
    }

    #[test]
    fn test_missing_file_is_fine() {
        let tmp = TempDir::new().unwrap();
        drop(TempFileGuard::new(tmp.path().join("never-created")));
    }
}
