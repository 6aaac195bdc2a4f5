//! Server mode - runs when invoked as `snapback --server <path>`
//!
//! Receives one snapshot diff per session and commits it to the repository
//! under the name of its edge.

pub mod inspect;

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tokio::io::{self, AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::lineage::Edge;
use crate::storage::{RepositoryStorage, ServerStorage, TransactionalFile};
use crate::streaming::codec::decode_stream;
use crate::streaming::protocol::{
    read_magic, read_message, write_message, EdgeIntent, GraphDescriptor,
};

pub use inspect::{inspect_repository, RepositorySummary};

/// Outcome of one received backup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveReport {
    pub edge: Edge,
    /// Payload bytes written to the repository file
    pub bytes: u64,
    pub path: PathBuf,
}

/// Expand tilde (~) in paths to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();

    if path_str == "~" {
        dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
    } else if let Some(rest) = path_str.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            home.join(rest)
        } else {
            path.to_path_buf()
        }
    } else {
        path.to_path_buf()
    }
}

/// Main server entry point: one session on stdin/stdout.
pub async fn run_server(repository: &Path) -> Result<ReceiveReport> {
    let root_path = expand_tilde(repository);

    if !root_path.exists() {
        tokio::fs::create_dir_all(&root_path)
            .await
            .with_context(|| format!("Failed to create repository {}", root_path.display()))?;
    }

    let storage = RepositoryStorage::new(root_path);
    let report = serve(&storage, io::stdin(), io::stdout()).await?;

    tracing::info!(
        "Committed {} ({} bytes) to {}",
        report.edge,
        report.bytes,
        report.path.display()
    );
    Ok(report)
}

/// Run the server side of one session over `reader`/`writer`.
///
/// The destination file only appears once the whole stream has been
/// verified; any failure leaves the repository as it was.
pub async fn serve<S, R, W>(storage: &S, mut reader: R, mut writer: W) -> Result<ReceiveReport>
where
    S: ServerStorage + ?Sized,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    // 1. Validate magic number
    read_magic(&mut reader).await?;

    // 2. Send GRAPH
    let edges = storage
        .list_stored_edges()
        .await
        .context("Failed to list repository")?;
    let descriptor = GraphDescriptor {
        edges: edges.iter().cloned().collect(),
    };
    write_message(&mut writer, &descriptor).await?;
    writer.flush().await?;
    tracing::debug!("Sent graph with {} edges", descriptor.edges.len());

    // 3. Receive EDGE_INTENT
    let EdgeIntent { edge } = read_message(&mut reader)
        .await
        .context("Failed to read edge intent")?;
    if !edge.is_full() && !edges.iter().any(|stored| stored.to == edge.from) {
        anyhow::bail!("Parent {} of {} is not in the repository", edge.from, edge);
    }
    tracing::info!("Receiving {}", edge);

    // 4. Receive the stream into a transactional file
    let mut file = TransactionalFile::create(storage.path_for_edge(&edge)).await?;
    let bytes = decode_stream(&mut reader, file.writer())
        .await
        .with_context(|| format!("Stream for {} rejected", edge))?;
    let path = file.commit().await?;

    Ok(ReceiveReport { edge, bytes, path })
}
