//! Client storage on a btrfs filesystem.
//!
//! Snapshots live as read-only subvolumes under `node_root`, one directory
//! per node. Diffs come from `btrfs send`, which runs as a child process
//! whose stdout feeds the relay.

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncRead;
use tokio::process::{Child, ChildStdout, Command};

use crate::config::BtrfsConfig;
use crate::error::{BackupError, Result};
use crate::lineage::Node;
use crate::storage::{ClientStorage, SnapshotDiff};

pub struct BtrfsStorage {
    binary: PathBuf,
    subvolume: PathBuf,
    node_root: PathBuf,
}

impl BtrfsStorage {
    /// Back up `subvolume`, keeping snapshots under `node_root`.
    pub fn new(subvolume: impl Into<PathBuf>, node_root: impl Into<PathBuf>) -> Self {
        Self {
            binary: BtrfsConfig::default().binary,
            subvolume: subvolume.into(),
            node_root: node_root.into(),
        }
    }

    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = binary.into();
        self
    }

    pub fn subvolume(&self) -> &Path {
        &self.subvolume
    }

    pub fn node_root(&self) -> &Path {
        &self.node_root
    }
}

/// Run one btrfs command to completion; non-zero exit is fatal.
async fn run_btrfs<I, S>(binary: &Path, action: &str, args: I) -> Result<()>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut cmd = Command::new(binary);
    cmd.args(action.split(' '))
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::inherit());

    tracing::debug!("Running {} {}", binary.display(), action);
    let status = cmd.status().await?;
    if !status.success() {
        return Err(BackupError::external(format!("btrfs {}", action), status));
    }
    Ok(())
}

async fn delete_subvolumes(binary: &Path, paths: &[PathBuf]) -> Result<()> {
    if paths.is_empty() {
        return Ok(());
    }
    run_btrfs(binary, "subvolume delete", paths).await
}

#[async_trait]
impl ClientStorage for BtrfsStorage {
    async fn list_local_nodes(&self) -> Result<BTreeSet<Node>> {
        let mut nodes = BTreeSet::new();
        let mut entries = tokio::fs::read_dir(&self.node_root).await?;

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                tracing::warn!("Skipping non-UTF-8 entry in {}", self.node_root.display());
                continue;
            };
            match Node::new(name) {
                Ok(node) => {
                    nodes.insert(node);
                }
                Err(e) => tracing::debug!("Skipping {}: {}", name, e),
            }
        }

        Ok(nodes)
    }

    fn path_for(&self, node: &Node) -> PathBuf {
        self.node_root.join(node.as_str())
    }

    fn generate_node_name(&self) -> Node {
        Node::from_timestamp(chrono::Local::now().naive_local())
    }

    async fn open_snapshot_diff(
        &self,
        from: &Node,
        to: &Node,
        keep_new_snapshot: bool,
    ) -> Result<Box<dyn SnapshotDiff>> {
        let snapshot = self.path_for(to);
        run_btrfs(
            &self.binary,
            "subvolume snapshot",
            [OsStr::new("-r"), self.subvolume.as_os_str(), snapshot.as_os_str()],
        )
        .await?;
        tracing::info!("Created snapshot {}", snapshot.display());

        let mut cmd = Command::new(&self.binary);
        cmd.arg("send");
        if !from.is_root() {
            cmd.arg("-p").arg(self.path_for(from));
        }
        cmd.arg(&snapshot)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let spawned = cmd.spawn().map_err(BackupError::from).and_then(|mut child| {
            let stdout = child
                .stdout
                .take()
                .ok_or_else(|| BackupError::external("btrfs send", "stdout not captured"))?;
            Ok((child, stdout))
        });

        match spawned {
            Ok((child, stdout)) => Ok(Box::new(BtrfsSend {
                child,
                stdout,
                snapshot,
                binary: self.binary.clone(),
                keep_new_snapshot,
            })),
            Err(e) => {
                if let Err(cleanup) = delete_subvolumes(&self.binary, &[snapshot]).await {
                    tracing::warn!("Failed to remove snapshot after spawn failure: {}", cleanup);
                }
                Err(e)
            }
        }
    }

    async fn delete_nodes(&self, nodes: &[Node]) -> Result<()> {
        let paths: Vec<PathBuf> = nodes.iter().map(|n| self.path_for(n)).collect();
        delete_subvolumes(&self.binary, &paths).await?;
        if !paths.is_empty() {
            tracing::info!("Deleted {} local snapshot(s)", paths.len());
        }
        Ok(())
    }
}

/// A running `btrfs send`.
struct BtrfsSend {
    child: Child,
    stdout: ChildStdout,
    snapshot: PathBuf,
    binary: PathBuf,
    keep_new_snapshot: bool,
}

#[async_trait]
impl SnapshotDiff for BtrfsSend {
    fn reader(&mut self) -> &mut (dyn AsyncRead + Send + Unpin) {
        &mut self.stdout
    }

    async fn finish(self: Box<Self>) -> Result<()> {
        let BtrfsSend {
            mut child,
            stdout,
            snapshot,
            binary,
            keep_new_snapshot,
        } = *self;
        drop(stdout);

        let sent = match child.wait().await {
            Ok(status) if status.success() => Ok(()),
            Ok(status) => Err(BackupError::external("btrfs send", status)),
            Err(e) => Err(e.into()),
        };

        if sent.is_err() || !keep_new_snapshot {
            if let Err(e) = delete_subvolumes(&binary, &[snapshot]).await {
                if sent.is_ok() {
                    return Err(e);
                }
                tracing::warn!("Failed to remove snapshot: {}", e);
            }
        }
        sent
    }

    async fn abort(self: Box<Self>) {
        let BtrfsSend {
            mut child,
            stdout,
            snapshot,
            binary,
            ..
        } = *self;
        drop(stdout);

        // Already exited is fine
        if let Err(e) = child.start_kill() {
            tracing::debug!("btrfs send already gone: {}", e);
        }
        if let Err(e) = child.wait().await {
            tracing::warn!("Failed to reap btrfs send: {}", e);
        }

        if let Err(e) = delete_subvolumes(&binary, &[snapshot.clone()]).await {
            tracing::warn!("Failed to remove snapshot {}: {}", snapshot.display(), e);
        }
    }
}
