//! Transactional write of a repository file.
//!
//! Data goes to `<final>.tmp` and is linked into place only on commit, so
//! the repository never shows a partial backup under its real name. Dropping
//! an uncommitted file removes the temp file.
//!
//! The temp file is created exclusively: while one session writes an edge,
//! a second session for the same edge fails with `FileExists` and never
//! touches the first one's data. Commit uses `link(2)`, which refuses an
//! existing destination atomically.

use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};

use crate::error::{BackupError, Result};
use crate::temp_file::TempFileGuard;

pub const TEMP_SUFFIX: &str = ".tmp";

pub fn temp_path_for(final_path: &Path) -> PathBuf {
    let mut name = OsString::from(final_path.as_os_str());
    name.push(TEMP_SUFFIX);
    PathBuf::from(name)
}

pub struct TransactionalFile {
    // Declared before the guard so the handle closes before the unlink
    writer: BufWriter<File>,
    final_path: PathBuf,
    guard: TempFileGuard,
}

impl TransactionalFile {
    /// Open the temp file for `final_path`.
    ///
    /// Fails with `FileExists` when the final path is already taken, leaving
    /// no temp file behind. An existing temp file means another session is
    /// writing the same edge (or one crashed); that is `FileExists` on the
    /// temp path and the file is left alone.
    pub async fn create(final_path: impl Into<PathBuf>) -> Result<Self> {
        let final_path = final_path.into();
        let temp_path = temp_path_for(&final_path);

        let file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(BackupError::FileExists(temp_path));
            }
            Err(e) => return Err(e.into()),
        };
        // Only guard a file this session created
        let guard = TempFileGuard::new(&temp_path);

        if tokio::fs::try_exists(&final_path).await? {
            return Err(BackupError::FileExists(final_path));
        }

        Ok(Self {
            writer: BufWriter::new(file),
            final_path,
            guard,
        })
    }

    pub fn writer(&mut self) -> &mut BufWriter<File> {
        &mut self.writer
    }

    pub fn final_path(&self) -> &Path {
        &self.final_path
    }

    /// Flush, sync and link into place, then drop the temp name.
    pub async fn commit(self) -> Result<PathBuf> {
        let TransactionalFile {
            mut writer,
            final_path,
            guard,
        } = self;

        writer.flush().await?;
        writer.get_ref().sync_all().await?;
        drop(writer);

        let temp_path = temp_path_for(&final_path);
        match tokio::fs::hard_link(&temp_path, &final_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(BackupError::FileExists(final_path));
            }
            Err(e) => return Err(e.into()),
        }

        if let Err(e) = tokio::fs::remove_file(&temp_path).await {
            tracing::warn!("Failed to remove {}: {}", temp_path.display(), e);
        }
        guard.defuse();

        tracing::debug!("Committed {}", final_path.display());
        Ok(final_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_commit_renames_into_place() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("FULL__a.btrfs");

        let mut file = TransactionalFile::create(&target).await.unwrap();
        assert!(temp_path_for(&target).exists());
        assert!(!target.exists());

        file.writer().write_all(b"snapshot bytes").await.unwrap();
        let committed = file.commit().await.unwrap();

        assert_eq!(committed, target);
        assert_eq!(std::fs::read(&target).unwrap(), b"snapshot bytes");
        assert!(!temp_path_for(&target).exists());
    }

    #[tokio::test]
    async fn test_existing_destination_is_file_exists() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("FULL__a.btrfs");
        std::fs::write(&target, b"first backup").unwrap();

        let err = TransactionalFile::create(&target).await.err().unwrap();
        assert!(matches!(err, BackupError::FileExists(ref p) if p == &target));
        assert!(!temp_path_for(&target).exists());
        assert_eq!(std::fs::read(&target).unwrap(), b"first backup");
    }

    #[tokio::test]
    async fn test_abandoned_write_leaves_nothing() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("FULL__a.btrfs");

        let body = async {
            let mut file = TransactionalFile::create(&target).await?;
            file.writer().write_all(b"half a snapsh").await?;
            Err::<(), BackupError>(BackupError::integrity("piece hash mismatch"))
        };
        assert!(body.await.is_err());

        assert!(!target.exists());
        assert!(!temp_path_for(&target).exists());
    }

    #[tokio::test]
    async fn test_commit_refuses_to_clobber() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("FULL__a.btrfs");

        let mut file = TransactionalFile::create(&target).await.unwrap();
        file.writer().write_all(b"late").await.unwrap();
        std::fs::write(&target, b"early").unwrap();

        let err = file.commit().await.unwrap_err();
        assert!(matches!(err, BackupError::FileExists(_)));
        assert_eq!(std::fs::read(&target).unwrap(), b"early");
        assert!(!temp_path_for(&target).exists());
    }

    #[tokio::test]
    async fn test_second_writer_cannot_disturb_first() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("FULL__a.btrfs");

        let mut first = TransactionalFile::create(&target).await.unwrap();
        first.writer().write_all(b"verified payload").await.unwrap();

        let err = TransactionalFile::create(&target).await.err().unwrap();
        assert!(matches!(err, BackupError::FileExists(ref p) if p == &temp_path_for(&target)));
        drop(err);

        // The failed second writer left the in-flight temp file alone
        assert!(temp_path_for(&target).exists());
        assert_eq!(first.commit().await.unwrap(), target);
        assert_eq!(std::fs::read(&target).unwrap(), b"verified payload");
        assert!(!temp_path_for(&target).exists());
    }

    #[tokio::test]
    async fn test_concurrent_creates_admit_one_writer() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("FULL__a.btrfs");

        let (a, b) = tokio::join!(
            TransactionalFile::create(&target),
            TransactionalFile::create(&target)
        );
        let (mut winner, loser) = match (a, b) {
            (Ok(file), Err(e)) | (Err(e), Ok(file)) => (file, e),
            (a, b) => panic!("expected one writer, got {:?} and {:?}", a.is_ok(), b.is_ok()),
        };
        assert!(matches!(loser, BackupError::FileExists(_)));

        winner.writer().write_all(b"only one").await.unwrap();
        winner.commit().await.unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"only one");
    }

    #[test]
    fn test_temp_path() {
        assert_eq!(
            temp_path_for(Path::new("/repo/FULL__a.btrfs")),
            PathBuf::from("/repo/FULL__a.btrfs.tmp")
        );
    }
}
