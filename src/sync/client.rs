//! Client side of a backup session.
//!
//! Drives the protocol over any duplex pipe: announce, learn the lineage,
//! pick a parent, stream the diff, then prune local snapshots.

use anyhow::{anyhow, Context, Result};
use std::collections::BTreeSet;
use std::future::Future;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::lineage::{Edge, LineageGraph, LineageView, Node, RetentionPolicy};
use crate::storage::ClientStorage;
use crate::streaming::protocol::{
    read_message, write_magic, write_message, EdgeIntent, GraphDescriptor,
};
use crate::streaming::{SnapshotRelay, StreamEncoder};

/// Outcome of one successful session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupReport {
    pub edge: Edge,
    /// Snapshot diff bytes streamed to the server
    pub bytes: u64,
    /// Local snapshots deleted after the transfer
    pub pruned: BTreeSet<Node>,
}

/// Orchestrator for the client side
pub struct BackupClient<S> {
    storage: S,
    policy: RetentionPolicy,
    relay: SnapshotRelay,
}

impl<S: ClientStorage> BackupClient<S> {
    pub fn new(storage: S, policy: RetentionPolicy) -> Self {
        Self {
            storage,
            policy,
            relay: SnapshotRelay::new(),
        }
    }

    pub fn with_relay(mut self, relay: SnapshotRelay) -> Self {
        self.relay = relay;
        self
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn policy(&self) -> &RetentionPolicy {
        &self.policy
    }

    /// Run one backup session.
    ///
    /// `reader`/`writer` are the two halves of the pipe to the server.
    /// `peer` resolves once the server side has finished; only after it
    /// succeeds is the new snapshot treated as stored.
    pub async fn backup<R, W, P>(&self, mut reader: R, mut writer: W, peer: P) -> Result<BackupReport>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
        P: Future<Output = Result<()>>,
    {
        // 1. Send magic number
        write_magic(&mut writer).await?;
        writer.flush().await?;

        // 2. Receive GRAPH
        let descriptor: GraphDescriptor = read_message(&mut reader)
            .await
            .context("Failed to read lineage graph from server")?;
        let graph = LineageGraph::new(descriptor.edges)?;
        tracing::info!("Server holds {} backups", graph.len());

        // 3. Select parent and name the new node
        let local = self
            .storage
            .list_local_nodes()
            .await
            .context("Failed to list local snapshots")?;
        tracing::debug!("{} local snapshots", local.len());
        let mut view = LineageView::new(graph, local);

        let new_node = self.storage.generate_node_name();
        let now = new_node
            .timestamp()
            .ok_or_else(|| anyhow!("Generated node name {} is not a timestamp", new_node))?;
        let parent = self.policy.best_parent(&view, now)?;
        let edge = Edge::new(parent, new_node);
        if edge.is_full() {
            tracing::info!("Full backup of {}", edge.to);
        } else {
            tracing::info!("Incremental backup {}", edge);
        }

        // 4. Send EDGE_INTENT; nothing more comes back from the server
        write_message(&mut writer, &EdgeIntent { edge: edge.clone() }).await?;
        drop(reader);

        // 5. Stream the snapshot diff
        let bytes = self.transfer(&edge, &mut writer).await?;

        // 6. Close our half and wait for the server to commit
        let finished: Result<()> = async {
            writer.shutdown().await?;
            drop(writer);
            peer.await
        }
        .await;
        if let Err(e) = finished {
            self.discard_snapshot(&edge.to).await;
            return Err(e.context(format!("Server did not store {}", edge)));
        }
        tracing::info!("Stored {} ({} bytes)", edge, bytes);

        // 7. Prune
        view.record_snapshot(edge.clone())?;
        let pruned = self.policy.prune_local_nodes(&mut view, now);
        if !pruned.is_empty() {
            let doomed: Vec<Node> = pruned.iter().cloned().collect();
            tracing::info!("Pruning {} local snapshot(s)", doomed.len());
            self.storage
                .delete_nodes(&doomed)
                .await
                .context("Failed to prune local snapshots")?;
        }

        Ok(BackupReport { edge, bytes, pruned })
    }

    /// Snapshot, relay the diff and close the stream. Any failure poisons the
    /// stream and leaves no new snapshot behind.
    async fn transfer<W>(&self, edge: &Edge, writer: &mut W) -> Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        let mut diff = self
            .storage
            .open_snapshot_diff(&edge.from, &edge.to, true)
            .await
            .with_context(|| format!("Failed to snapshot {}", edge.to))?;

        let mut encoder = StreamEncoder::new(writer);
        let relayed = match encoder.write_start().await {
            Ok(()) => self.relay.run(diff.reader(), &mut encoder).await,
            Err(e) => Err(e),
        };

        // The sender's exit status decides whether the stream is complete
        let sent = match relayed {
            Ok(stats) => diff.finish().await.map(|()| stats),
            Err(e) => {
                diff.abort().await;
                Err(e)
            }
        };

        match sent {
            Ok(stats) => {
                if let Err(e) = encoder.finish().await {
                    self.discard_snapshot(&edge.to).await;
                    return Err(anyhow::Error::new(e).context("Failed to finish stream"));
                }
                tracing::debug!("Relayed {} bytes in {} pieces", stats.bytes, stats.pieces);
                Ok(stats.bytes)
            }
            Err(e) => {
                if let Err(poison_err) = encoder.poison().await {
                    tracing::debug!("Could not poison stream: {}", poison_err);
                }
                Err(anyhow::Error::new(e).context(format!("Failed to stream {}", edge)))
            }
        }
    }

    async fn discard_snapshot(&self, node: &Node) {
        if let Err(e) = self.storage.delete_nodes(std::slice::from_ref(node)).await {
            tracing::warn!("Failed to remove unsent snapshot {}: {}", node, e);
        }
    }
}
