//! Storage drivers.
//!
//! The protocol never touches the filesystem directly. A client driver turns
//! nodes into snapshots and diff streams; a server driver turns edges into
//! repository files. Both are rebuilt from their on-disk listing every
//! session.

pub mod btrfs;
pub mod repository;
pub mod transactional;

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::path::PathBuf;
use tokio::io::AsyncRead;

use crate::error::Result;
use crate::lineage::{Edge, Node};

pub use btrfs::BtrfsStorage;
pub use repository::{edge_filename, parse_edge_filename, RepositoryStorage, EDGE_EXTENSION};
pub use transactional::TransactionalFile;

/// Client side: the snapshots held next to the backed-up subvolume.
#[async_trait]
pub trait ClientStorage: Send + Sync {
    /// Nodes currently materialized on disk.
    async fn list_local_nodes(&self) -> Result<BTreeSet<Node>>;

    fn path_for(&self, node: &Node) -> PathBuf;

    /// Name for a snapshot taken now. Must parse back with
    /// [`Node::timestamp`].
    fn generate_node_name(&self) -> Node;

    /// Create a read-only snapshot at `to` and start streaming its diff
    /// against `from`, or a full stream when `from` is the root.
    ///
    /// Unless `keep_new_snapshot` is set, the new snapshot is deleted once
    /// the stream is finished.
    async fn open_snapshot_diff(
        &self,
        from: &Node,
        to: &Node,
        keep_new_snapshot: bool,
    ) -> Result<Box<dyn SnapshotDiff>>;

    /// Delete every node in one batch.
    async fn delete_nodes(&self, nodes: &[Node]) -> Result<()>;
}

/// A running snapshot diff. Exactly one of `finish` or `abort` must be called.
#[async_trait]
pub trait SnapshotDiff: Send {
    fn reader(&mut self) -> &mut (dyn AsyncRead + Send + Unpin);

    /// Wait for the sender to exit cleanly. A non-zero exit is an
    /// `ExternalTool` error and removes the new snapshot.
    async fn finish(self: Box<Self>) -> Result<()>;

    /// Stop the sender and remove the new snapshot. Best effort; failures are
    /// logged, never returned, so the error that caused the abort propagates.
    async fn abort(self: Box<Self>);
}

/// Server side: the repository directory.
#[async_trait]
pub trait ServerStorage: Send + Sync {
    async fn list_stored_edges(&self) -> Result<BTreeSet<Edge>>;

    fn path_for_edge(&self, edge: &Edge) -> PathBuf;
}
