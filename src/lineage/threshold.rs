//! Threshold retention: newest stored local node wins.
//!
//! When no stored local node qualifies, a full backup is only chosen if the
//! server holds nothing yet or the client lists the root itself as local.
//! Pruning removes a local node once it has fanned out to the child cap for
//! its depth. The stricter selection that also honours those caps is opt-in
//! (`enforce_depth_caps`).

use chrono::NaiveDateTime;
use std::collections::BTreeSet;

use crate::error::{BackupError, Result};
use crate::lineage::graph::LineageGraph;
use crate::lineage::node::Node;
use crate::lineage::policy::{LineageView, Retention};

/// Nodes deeper than this are never picked as a parent.
pub const MAX_HEIGHT: usize = 3;

/// Child cap per depth; depths outside the table are unbounded.
pub fn max_children_for_depth(depth: usize) -> Option<usize> {
    match depth {
        1 => Some(4),
        2 => Some(8),
        3 => Some(24),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct ThresholdPolicy {
    pub allow_root_fallback: bool,
    pub enforce_depth_caps: bool,
}

impl Default for ThresholdPolicy {
    fn default() -> Self {
        Self {
            allow_root_fallback: true,
            enforce_depth_caps: false,
        }
    }
}

impl ThresholdPolicy {
    /// Whether one more child still fits under `node` in the strict scheme.
    fn has_room(graph: &LineageGraph, node: &Node, depth: usize) -> bool {
        let children = graph.children(node).len();
        depth < MAX_HEIGHT && max_children_for_depth(depth).map_or(true, |cap| children < cap)
    }
}

impl Retention for ThresholdPolicy {
    fn best_parent(&self, view: &LineageView, _now: NaiveDateTime) -> Result<Node> {
        let graph = view.graph();

        // Names sort chronologically, so walk newest first.
        let chosen = view
            .managed_nodes()
            .rev()
            .filter(|node| graph.is_stored(node))
            .find(|node| match graph.height(node) {
                Some(depth) if depth <= MAX_HEIGHT => {
                    !self.enforce_depth_caps || Self::has_room(graph, node, depth)
                }
                _ => false,
            });

        let root = Node::root();
        match chosen {
            Some(node) => Ok(node.clone()),
            None if graph.is_empty() => Ok(root),
            None if self.allow_root_fallback && view.local_nodes().contains(&root) => Ok(root),
            None => Err(BackupError::RetentionPolicyExhausted),
        }
    }

    fn prunable(&self, view: &LineageView, _now: NaiveDateTime) -> BTreeSet<Node> {
        let graph = view.graph();
        view.managed_nodes()
            .filter(|node| {
                let Some(cap) = graph.height(node).and_then(max_children_for_depth) else {
                    return false;
                };
                graph.children(node).len() >= cap
            })
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lineage::node::Edge;
    use chrono::NaiveDate;

    fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2013, 7, 10)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    fn view(edges: &[(&str, &str)], local: &[&str]) -> LineageView {
        let graph = LineageGraph::new(edges.iter().map(|(f, t)| Edge::parse(f, t).unwrap())).unwrap();
        let local = local.iter().map(|n| Node::new(*n).unwrap()).collect();
        LineageView::new(graph, local)
    }

    #[test]
    fn test_picks_most_recent_stored_node() {
        let v = view(&[("FULL", "A"), ("A", "B")], &["FULL", "A", "B"]);
        let parent = ThresholdPolicy::default().best_parent(&v, now()).unwrap();
        assert_eq!(parent.as_str(), "B");
    }

    #[test]
    fn test_ignores_local_nodes_unknown_to_server() {
        let v = view(
            &[("FULL", "2013-07-01")],
            &["2013-07-01", "2013-07-09", "use_for_incr"],
        );
        let parent = ThresholdPolicy::default().best_parent(&v, now()).unwrap();
        assert_eq!(parent.as_str(), "2013-07-01");
    }

    #[test]
    fn test_skips_nodes_beyond_max_height() {
        let v = view(
            &[("FULL", "A"), ("A", "B"), ("B", "C"), ("C", "D")],
            &["A", "B", "C", "D"],
        );
        let parent = ThresholdPolicy::default().best_parent(&v, now()).unwrap();
        assert_eq!(parent.as_str(), "C");
    }

    #[test]
    fn test_strict_mode_respects_caps() {
        let edges = [("FULL", "A"), ("A", "B1"), ("A", "B2"), ("A", "B3"), ("A", "B4")];
        let v = view(&edges, &["FULL", "A"]);

        let lenient = ThresholdPolicy::default();
        assert_eq!(lenient.best_parent(&v, now()).unwrap().as_str(), "A");

        // A already has the four children allowed at depth 1
        let strict = ThresholdPolicy {
            enforce_depth_caps: true,
            ..Default::default()
        };
        assert!(strict.best_parent(&v, now()).unwrap().is_root());

        let v = view(&[("FULL", "A"), ("A", "B1")], &["A", "B1"]);
        // B1 sits at depth 2 with room to spare
        assert_eq!(strict.best_parent(&v, now()).unwrap().as_str(), "B1");
    }

    #[test]
    fn test_empty_graph_falls_back_to_root() {
        let v = view(&[], &["FULL"]);
        let strict = ThresholdPolicy {
            allow_root_fallback: false,
            enforce_depth_caps: false,
        };
        assert!(strict.best_parent(&v, now()).unwrap().is_root());
    }

    #[test]
    fn test_exhausted_without_fallback() {
        let v = view(&[("FULL", "A")], &["B"]);
        let policy = ThresholdPolicy {
            allow_root_fallback: false,
            enforce_depth_caps: false,
        };
        let err = policy.best_parent(&v, now()).unwrap_err();
        assert!(matches!(err, BackupError::RetentionPolicyExhausted));

        // Fallback alone does not make the root a candidate
        let err = ThresholdPolicy::default().best_parent(&v, now()).unwrap_err();
        assert!(matches!(err, BackupError::RetentionPolicyExhausted));
    }

    #[test]
    fn test_root_fallback_needs_local_root() {
        let v = view(&[("FULL", "A")], &["FULL", "B"]);
        assert!(ThresholdPolicy::default()
            .best_parent(&v, now())
            .unwrap()
            .is_root());

        let no_fallback = ThresholdPolicy {
            allow_root_fallback: false,
            enforce_depth_caps: false,
        };
        assert!(matches!(
            no_fallback.best_parent(&v, now()),
            Err(BackupError::RetentionPolicyExhausted)
        ));
    }

    #[test]
    fn test_prunes_nodes_at_child_cap() {
        let v = view(
            &[
                ("FULL", "A"),
                ("A", "B1"),
                ("A", "B2"),
                ("A", "B3"),
                ("A", "B4"),
                ("FULL", "C"),
                ("C", "D"),
            ],
            &["FULL", "A", "B4", "C"],
        );
        let doomed = ThresholdPolicy::default().prunable(&v, now());
        let names: Vec<_> = doomed.iter().map(Node::as_str).collect();
        assert_eq!(names, vec!["A"]);
    }
}
