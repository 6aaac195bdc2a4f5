//! Retention policy interface.
//!
//! A policy looks at the lineage graph together with the nodes the client
//! still holds on disk, picks the parent for the next incremental snapshot,
//! names the new node, and decides which local snapshots may go.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::config::PolicyConfig;
use crate::error::Result;
use crate::lineage::calendar::CalendarPolicy;
use crate::lineage::graph::LineageGraph;
use crate::lineage::node::{Edge, Node};
use crate::lineage::threshold::ThresholdPolicy;

/// Graph plus the client's local node set, rebuilt every session.
#[derive(Debug, Clone)]
pub struct LineageView {
    graph: LineageGraph,
    local: BTreeSet<Node>,
}

impl LineageView {
    pub fn new(graph: LineageGraph, local: BTreeSet<Node>) -> Self {
        Self { graph, local }
    }

    pub fn graph(&self) -> &LineageGraph {
        &self.graph
    }

    pub fn local_nodes(&self) -> &BTreeSet<Node> {
        &self.local
    }

    /// Local nodes a policy may reason about: everything except the root.
    pub fn managed_nodes(&self) -> impl DoubleEndedIterator<Item = &Node> {
        self.local.iter().filter(|n| !n.is_root())
    }

    /// Extend the view with a snapshot that was just stored on the server.
    pub fn record_snapshot(&mut self, edge: Edge) -> Result<()> {
        let node = edge.to.clone();
        self.graph.add_edge(edge)?;
        self.local.insert(node);
        Ok(())
    }

    fn forget(&mut self, nodes: &BTreeSet<Node>) {
        self.local.retain(|n| !nodes.contains(n));
    }
}

/// Capabilities every retention strategy provides.
pub trait Retention {
    /// Parent for the next snapshot; the root means a full snapshot.
    fn best_parent(&self, view: &LineageView, now: NaiveDateTime) -> Result<Node>;

    /// Local nodes that are no longer needed.
    fn prunable(&self, view: &LineageView, now: NaiveDateTime) -> BTreeSet<Node>;
}

/// Which strategy a client runs, as named in the config file and CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum PolicyKind {
    Threshold,
    #[default]
    Calendar,
}

#[derive(Debug, Clone)]
pub enum RetentionPolicy {
    Threshold(ThresholdPolicy),
    Calendar(CalendarPolicy),
}

impl RetentionPolicy {
    pub fn from_config(config: &PolicyConfig) -> Self {
        match config.kind {
            PolicyKind::Threshold => RetentionPolicy::Threshold(ThresholdPolicy {
                allow_root_fallback: config.allow_root_fallback,
                enforce_depth_caps: config.enforce_depth_caps,
            }),
            PolicyKind::Calendar => RetentionPolicy::Calendar(CalendarPolicy {
                allow_root_fallback: config.allow_root_fallback,
            }),
        }
    }

    pub fn kind(&self) -> PolicyKind {
        match self {
            RetentionPolicy::Threshold(_) => PolicyKind::Threshold,
            RetentionPolicy::Calendar(_) => PolicyKind::Calendar,
        }
    }

    fn strategy(&self) -> &dyn Retention {
        match self {
            RetentionPolicy::Threshold(p) => p,
            RetentionPolicy::Calendar(p) => p,
        }
    }

    pub fn best_parent(&self, view: &LineageView, now: NaiveDateTime) -> Result<Node> {
        self.strategy().best_parent(view, now)
    }

    /// Name for the snapshot taken at `now`. Must stay parseable by
    /// [`Node::timestamp`] or the calendar buckets misclassify it.
    pub fn name_new_node(&self, now: NaiveDateTime) -> Node {
        Node::from_timestamp(now)
    }

    /// Drop prunable nodes from the view and return them as one batch.
    pub fn prune_local_nodes(&self, view: &mut LineageView, now: NaiveDateTime) -> BTreeSet<Node> {
        let doomed = self.strategy().prunable(view, now);
        view.forget(&doomed);
        doomed
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        RetentionPolicy::from_config(&PolicyConfig::default())
    }
}
