//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncRead;

use snapback::lineage::{Edge, Node};
use snapback::storage::{ClientStorage, RepositoryStorage, ServerStorage, SnapshotDiff};
use snapback::BackupError;

// =============================================================================
// In-memory client storage
// =============================================================================

#[derive(Clone)]
pub struct MemoryStorage {
    nodes: Arc<Mutex<BTreeSet<Node>>>,
    deleted: Arc<Mutex<Vec<Node>>>,
    next_name: Node,
    payload: Arc<Vec<u8>>,
    fail_send: bool,
}

impl MemoryStorage {
    pub fn new(local: &[&str], next_name: &str, payload: Vec<u8>) -> Self {
        Self {
            nodes: Arc::new(Mutex::new(local.iter().map(|n| node(n)).collect())),
            deleted: Arc::new(Mutex::new(Vec::new())),
            next_name: node(next_name),
            payload: Arc::new(payload),
            fail_send: false,
        }
    }

    pub fn failing_send(mut self) -> Self {
        self.fail_send = true;
        self
    }

    pub fn local(&self) -> BTreeSet<Node> {
        self.nodes.lock().unwrap().clone()
    }

    pub fn deleted(&self) -> Vec<Node> {
        self.deleted.lock().unwrap().clone()
    }
}

#[async_trait]
impl ClientStorage for MemoryStorage {
    async fn list_local_nodes(&self) -> snapback::Result<BTreeSet<Node>> {
        Ok(self.local())
    }

    fn path_for(&self, node: &Node) -> PathBuf {
        Path::new("/memory").join(node.as_str())
    }

    fn generate_node_name(&self) -> Node {
        self.next_name.clone()
    }

    async fn open_snapshot_diff(
        &self,
        _from: &Node,
        to: &Node,
        keep_new_snapshot: bool,
    ) -> snapback::Result<Box<dyn SnapshotDiff>> {
        self.nodes.lock().unwrap().insert(to.clone());
        Ok(Box::new(MemoryDiff {
            data: Cursor::new(self.payload.to_vec()),
            node: to.clone(),
            nodes: Arc::clone(&self.nodes),
            keep_new_snapshot,
            fail: self.fail_send,
        }))
    }

    async fn delete_nodes(&self, nodes: &[Node]) -> snapback::Result<()> {
        let mut local = self.nodes.lock().unwrap();
        for n in nodes {
            local.remove(n);
            self.deleted.lock().unwrap().push(n.clone());
        }
        Ok(())
    }
}

struct MemoryDiff {
    data: Cursor<Vec<u8>>,
    node: Node,
    nodes: Arc<Mutex<BTreeSet<Node>>>,
    keep_new_snapshot: bool,
    fail: bool,
}

#[async_trait]
impl SnapshotDiff for MemoryDiff {
    fn reader(&mut self) -> &mut (dyn AsyncRead + Send + Unpin) {
        &mut self.data
    }

    async fn finish(self: Box<Self>) -> snapback::Result<()> {
        if self.fail || !self.keep_new_snapshot {
            self.nodes.lock().unwrap().remove(&self.node);
        }
        if self.fail {
            return Err(BackupError::external("btrfs send", "exit status: 1"));
        }
        Ok(())
    }

    async fn abort(self: Box<Self>) {
        self.nodes.lock().unwrap().remove(&self.node);
    }
}

// =============================================================================
// Helpers
// =============================================================================

pub fn node(name: &str) -> Node {
    Node::new(name).unwrap()
}

pub fn edge(from: &str, to: &str) -> Edge {
    Edge::parse(from, to).unwrap()
}

pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

pub fn store_edges(repo: &RepositoryStorage, edges: &[(&str, &str)]) {
    for (from, to) in edges {
        std::fs::write(repo.path_for_edge(&edge(from, to)), b"older backup").unwrap();
    }
}

pub fn repo_files(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}
