//! Server storage: a flat directory of diff files, one per edge.
//!
//! The file name is the edge: `{from}__{to}.btrfs`. Nothing else is
//! persisted; the lineage graph is rebuilt from the listing each session.

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::lineage::node::EDGE_SEPARATOR;
use crate::lineage::Edge;
use crate::storage::ServerStorage;

pub const EDGE_EXTENSION: &str = ".btrfs";

pub fn edge_filename(edge: &Edge) -> String {
    format!("{}{}{}{}", edge.from, EDGE_SEPARATOR, edge.to, EDGE_EXTENSION)
}

/// Inverse of [`edge_filename`]. `None` for anything that is not a
/// committed edge file, including in-flight `.tmp` files.
pub fn parse_edge_filename(name: &str) -> Option<Edge> {
    let stem = name.strip_suffix(EDGE_EXTENSION)?;
    let (from, to) = stem.split_once(EDGE_SEPARATOR)?;
    match Edge::parse(from, to) {
        Ok(edge) => Some(edge),
        Err(e) => {
            tracing::debug!("Ignoring {}: {}", name, e);
            None
        }
    }
}

pub struct RepositoryStorage {
    root: PathBuf,
}

impl RepositoryStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl ServerStorage for RepositoryStorage {
    async fn list_stored_edges(&self) -> Result<BTreeSet<Edge>> {
        let mut edges = BTreeSet::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            if let Some(edge) = entry.file_name().to_str().and_then(parse_edge_filename) {
                edges.insert(edge);
            }
        }

        tracing::debug!("Repository {} holds {} edges", self.root.display(), edges.len());
        Ok(edges)
    }

    fn path_for_edge(&self, edge: &Edge) -> PathBuf {
        self.root.join(edge_filename(edge))
    }
}
