//! Read-only view of a repository for the `graph` command.

use serde::Serialize;
use std::fmt;

use crate::error::Result;
use crate::lineage::{Edge, LineageGraph, Node};
use crate::storage::ServerStorage;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeSummary {
    pub node: Node,
    pub parents: Vec<Node>,
    /// Distance from the full backup; `None` if the node is unreachable
    pub height: Option<usize>,
    /// Shortest list of nodes whose diffs rebuild this one, root first
    pub restore_chain: Option<Vec<Node>>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RepositorySummary {
    pub edges: Vec<Edge>,
    pub nodes: Vec<NodeSummary>,
}

impl RepositorySummary {
    pub fn from_graph(graph: &LineageGraph) -> Self {
        let root = Node::root();
        let nodes = graph
            .nodes()
            .into_iter()
            .filter(|n| !n.is_root())
            .map(|node| NodeSummary {
                node: node.clone(),
                parents: graph.parents(node).iter().cloned().collect(),
                height: graph.height(node),
                restore_chain: graph.min_path(node, &root).ok(),
            })
            .collect();

        Self {
            edges: graph.edges().cloned().collect(),
            nodes,
        }
    }
}

impl fmt::Display for RepositorySummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} backups", self.edges.len())?;
        for summary in &self.nodes {
            let height = summary
                .height
                .map_or_else(|| "?".to_string(), |h| h.to_string());
            write!(f, "  {}  height {}", summary.node, height)?;
            match &summary.restore_chain {
                Some(chain) => writeln!(f, "  restore: {} file(s)", chain.len() - 1)?,
                None => writeln!(f, "  restore: unreachable")?,
            }
        }
        Ok(())
    }
}

pub async fn inspect_repository<S: ServerStorage + ?Sized>(storage: &S) -> Result<RepositorySummary> {
    let edges = storage.list_stored_edges().await?;
    let graph = LineageGraph::new(edges)?;
    Ok(RepositorySummary::from_graph(&graph))
}
