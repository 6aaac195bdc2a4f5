//! Lineage graph built from the repository's edge list.
//!
//! Rebuilt from scratch every session. Nodes are never removed from the
//! graph; pruning only shrinks the client's local node set.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use crate::error::{BackupError, Result};
use crate::lineage::node::{Edge, Node};

static NO_NODES: BTreeSet<Node> = BTreeSet::new();

/// Longest ancestry path `paths_from` will walk before giving up.
pub const MAX_PATH_DEPTH: usize = 4096;

#[derive(Debug, Clone, Default)]
pub struct LineageGraph {
    edges: BTreeSet<Edge>,
    forward: BTreeMap<Node, BTreeSet<Node>>,
    reverse: BTreeMap<Node, BTreeSet<Node>>,
    /// Shortest distance to the root, for nodes reachable from it.
    heights: HashMap<Node, usize>,
}

impl LineageGraph {
    /// Build the graph, rejecting cycles and edges into the root.
    pub fn new(edges: impl IntoIterator<Item = Edge>) -> Result<Self> {
        let mut graph = Self::default();
        for edge in edges {
            graph.link(edge)?;
        }
        graph.check_acyclic()?;
        graph.compute_heights();
        Ok(graph)
    }

    /// Record an edge created during this session.
    pub fn add_edge(&mut self, edge: Edge) -> Result<()> {
        if self.edges.contains(&edge) {
            return Ok(());
        }
        self.link(edge)?;
        self.check_acyclic()?;
        self.compute_heights();
        Ok(())
    }

    fn link(&mut self, edge: Edge) -> Result<()> {
        if edge.to.is_root() {
            return Err(BackupError::protocol(format!(
                "edge {} points into the root node",
                edge
            )));
        }
        if edge.from == edge.to {
            return Err(BackupError::GraphCycle(edge.to));
        }

        self.forward
            .entry(edge.from.clone())
            .or_default()
            .insert(edge.to.clone());
        self.reverse
            .entry(edge.to.clone())
            .or_default()
            .insert(edge.from.clone());
        self.edges.insert(edge);
        Ok(())
    }

    /// Kahn's algorithm; any node left with unresolved parents sits on a cycle.
    fn check_acyclic(&self) -> Result<()> {
        let mut indegree: BTreeMap<&Node, usize> = BTreeMap::new();
        for (from, children) in &self.forward {
            indegree.entry(from).or_insert(0);
            for child in children {
                *indegree.entry(child).or_insert(0) += 1;
            }
        }

        let mut ready: VecDeque<&Node> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(&n, _)| n)
            .collect();
        let mut resolved = 0usize;

        while let Some(node) = ready.pop_front() {
            resolved += 1;
            for child in self.children(node) {
                if let Some(d) = indegree.get_mut(child) {
                    *d -= 1;
                    if *d == 0 {
                        ready.push_back(child);
                    }
                }
            }
        }

        if resolved == indegree.len() {
            return Ok(());
        }

        let culprit = indegree
            .into_iter()
            .find(|(_, d)| *d > 0)
            .map(|(n, _)| n.clone())
            .unwrap_or_else(Node::root);
        Err(BackupError::GraphCycle(culprit))
    }

    /// Breadth-first walk from the root: first visit is the shortest distance.
    fn compute_heights(&mut self) {
        let mut heights = HashMap::new();
        let mut queue = VecDeque::new();
        heights.insert(Node::root(), 0usize);
        queue.push_back(Node::root());

        while let Some(node) = queue.pop_front() {
            let next = heights[&node] + 1;
            for child in self.forward.get(&node).unwrap_or(&NO_NODES) {
                if !heights.contains_key(child) {
                    heights.insert(child.clone(), next);
                    queue.push_back(child.clone());
                }
            }
        }

        self.heights = heights;
    }

    pub fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.edges.iter()
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// Every node mentioned by some edge.
    pub fn nodes(&self) -> BTreeSet<&Node> {
        self.forward
            .keys()
            .chain(self.reverse.keys())
            .collect::<BTreeSet<_>>()
    }

    /// Node is the root or appears in some edge.
    pub fn contains(&self, node: &Node) -> bool {
        node.is_root() || self.forward.contains_key(node) || self.reverse.contains_key(node)
    }

    /// Node was stored in the repository as the target of some edge.
    pub fn is_stored(&self, node: &Node) -> bool {
        self.reverse.contains_key(node)
    }

    pub fn children(&self, node: &Node) -> &BTreeSet<Node> {
        self.forward.get(node).unwrap_or(&NO_NODES)
    }

    pub fn parents(&self, node: &Node) -> &BTreeSet<Node> {
        self.reverse.get(node).unwrap_or(&NO_NODES)
    }

    /// Shortest distance to the root. `None` when the node is unknown or
    /// only hangs off an orphaned ancestor.
    pub fn height(&self, node: &Node) -> Option<usize> {
        self.heights.get(node).copied()
    }

    /// Lazily enumerate every simple ancestry path of `source`.
    ///
    /// Each path starts at an ancestor and ends at `source`; the trivial
    /// path `[source]` comes first.
    pub fn paths_from(&self, source: &Node) -> AncestorPaths<'_> {
        AncestorPaths {
            graph: self,
            path: vec![source.clone()],
            stack: Vec::new(),
            started: false,
        }
    }

    /// Shortest ancestry path from `target` down to `source`.
    pub fn min_path(&self, source: &Node, target: &Node) -> Result<Vec<Node>> {
        self.paths_from(source)
            .filter(|path| path.first() == Some(target))
            .min_by_key(|path| path.len())
            .ok_or_else(|| BackupError::PathNotFound {
                from: source.clone(),
                to: target.clone(),
            })
    }
}

/// Depth-first ancestry walk driven by an explicit stack.
pub struct AncestorPaths<'a> {
    graph: &'a LineageGraph,
    /// source, parent, grandparent, ...
    path: Vec<Node>,
    stack: Vec<std::collections::btree_set::Iter<'a, Node>>,
    started: bool,
}

impl AncestorPaths<'_> {
    fn current(&self) -> Vec<Node> {
        self.path.iter().rev().cloned().collect()
    }
}

impl Iterator for AncestorPaths<'_> {
    type Item = Vec<Node>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.started {
            self.started = true;
            let source = self.path.last()?;
            self.stack.push(self.graph.parents(source).iter());
            return Some(self.current());
        }

        loop {
            let parents = self.stack.last_mut()?;
            match parents.next() {
                Some(parent) => {
                    if self.path.contains(parent) || self.path.len() >= MAX_PATH_DEPTH {
                        continue;
                    }
                    self.path.push(parent.clone());
                    self.stack.push(self.graph.parents(parent).iter());
                    return Some(self.current());
                }
                None => {
                    self.stack.pop();
                    self.path.pop();
                }
            }
        }
    }
}
