//! Calendar-bucket retention (month / week / day / hour rotation).
//!
//! A node's bucket is its height in the lineage graph: depth 1 is monthly,
//! 2 weekly, 3 daily, 4 hourly. Deeper nodes are not allowed.

use chrono::{Datelike, NaiveDateTime};
use std::collections::BTreeSet;

use crate::error::{BackupError, Result};
use crate::lineage::node::Node;
use crate::lineage::policy::{LineageView, Retention};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bucket {
    Monthly,
    Weekly,
    Daily,
    Hourly,
}

/// Buckets scanned for a parent, most specific first. Hourly nodes never
/// parent anything.
pub const PARENT_SEARCH_ORDER: [Bucket; 3] = [Bucket::Daily, Bucket::Weekly, Bucket::Monthly];

impl Bucket {
    pub fn from_depth(depth: usize) -> Option<Self> {
        match depth {
            1 => Some(Bucket::Monthly),
            2 => Some(Bucket::Weekly),
            3 => Some(Bucket::Daily),
            4 => Some(Bucket::Hourly),
            _ => None,
        }
    }

    pub fn depth(self) -> usize {
        match self {
            Bucket::Monthly => 1,
            Bucket::Weekly => 2,
            Bucket::Daily => 3,
            Bucket::Hourly => 4,
        }
    }

    /// A node in this bucket taken at `ts` can parent a snapshot taken `now`.
    pub fn accepts_child(self, ts: NaiveDateTime, now: NaiveDateTime) -> bool {
        match self {
            Bucket::Daily => same_iso_week(ts, now),
            Bucket::Weekly => same_month(ts, now),
            Bucket::Monthly => true,
            Bucket::Hourly => false,
        }
    }

    /// A local node in this bucket taken at `ts` is still worth keeping.
    ///
    /// Dailies live for the rest of their ISO week, not just their day.
    pub fn keeps(self, ts: NaiveDateTime, now: NaiveDateTime) -> bool {
        match self {
            Bucket::Monthly => same_month(ts, now),
            Bucket::Weekly | Bucket::Daily => same_iso_week(ts, now),
            Bucket::Hourly => false,
        }
    }
}

fn same_iso_week(a: NaiveDateTime, b: NaiveDateTime) -> bool {
    a.iso_week() == b.iso_week()
}

fn same_month(a: NaiveDateTime, b: NaiveDateTime) -> bool {
    (a.year(), a.month()) == (b.year(), b.month())
}

#[derive(Debug, Clone)]
pub struct CalendarPolicy {
    pub allow_root_fallback: bool,
}

impl Default for CalendarPolicy {
    fn default() -> Self {
        Self {
            allow_root_fallback: true,
        }
    }
}

impl CalendarPolicy {
    /// Managed local nodes with their bucket and timestamp.
    fn classified<'a>(
        view: &'a LineageView,
    ) -> impl Iterator<Item = (&'a Node, Option<Bucket>, NaiveDateTime)> + 'a {
        let graph = view.graph();
        view.managed_nodes().filter_map(move |node| {
            let ts = node.timestamp()?;
            let depth = graph.height(node)?;
            Some((node, Bucket::from_depth(depth), ts))
        })
    }
}

impl Retention for CalendarPolicy {
    fn best_parent(&self, view: &LineageView, now: NaiveDateTime) -> Result<Node> {
        for bucket in PARENT_SEARCH_ORDER {
            let newest = Self::classified(view)
                .filter(|(_, b, ts)| *b == Some(bucket) && bucket.accepts_child(*ts, now))
                .max_by_key(|(_, _, ts)| *ts);

            if let Some((node, _, _)) = newest {
                return Ok(node.clone());
            }
        }

        if self.allow_root_fallback || view.graph().is_empty() {
            Ok(Node::root())
        } else {
            Err(BackupError::RetentionPolicyExhausted)
        }
    }

    /// Unparseable names and nodes the server has never seen are left alone.
    fn prunable(&self, view: &LineageView, now: NaiveDateTime) -> BTreeSet<Node> {
        Self::classified(view)
            .filter(|(_, bucket, ts)| match bucket {
                Some(bucket) => !bucket.keeps(*ts, now),
                None => true,
            })
            .map(|(node, _, _)| node.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lineage::graph::LineageGraph;
    use crate::lineage::node::Edge;
    use chrono::NaiveDate;

    fn at(y: i32, m: u32, d: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    fn view(edges: &[(&str, &str)], local: &[&str]) -> LineageView {
        let graph =
            LineageGraph::new(edges.iter().map(|(f, t)| Edge::parse(f, t).unwrap())).unwrap();
        let local = local.iter().map(|n| Node::new(*n).unwrap()).collect();
        LineageView::new(graph, local)
    }

    /// Monthly 07-01, weekly 07-02, daily 07-08, hourly 07-08T05.
    fn rotation() -> Vec<(&'static str, &'static str)> {
        vec![
            ("FULL", "2013-07-01"),
            ("2013-07-01", "2013-07-02"),
            ("2013-07-02", "2013-07-08"),
            ("2013-07-08", "2013-07-08T05:00:00"),
        ]
    }

    #[test]
    fn test_prefers_daily_in_same_week() {
        // 2013-07-10 is a Wednesday; 07-08 is the Monday of that week
        let v = view(&rotation(), &["2013-07-01", "2013-07-08"]);
        let parent = CalendarPolicy::default()
            .best_parent(&v, at(2013, 7, 10))
            .unwrap();
        assert_eq!(parent.as_str(), "2013-07-08");
    }

    #[test]
    fn test_falls_back_to_weekly_then_monthly() {
        let v = view(&rotation(), &["2013-07-01", "2013-07-02", "2013-07-08"]);
        let policy = CalendarPolicy::default();

        // Next week: the daily is stale, the weekly is still this month
        assert_eq!(
            policy.best_parent(&v, at(2013, 7, 17)).unwrap().as_str(),
            "2013-07-02"
        );

        // Next month: only the monthly remains eligible
        assert_eq!(
            policy.best_parent(&v, at(2013, 8, 14)).unwrap().as_str(),
            "2013-07-01"
        );
    }

    #[test]
    fn test_hourly_never_parents() {
        let v = view(&rotation(), &["2013-07-08T05:00:00"]);
        let parent = CalendarPolicy::default()
            .best_parent(&v, at(2013, 7, 8))
            .unwrap();
        assert!(parent.is_root());
    }

    #[test]
    fn test_newest_within_bucket_wins() {
        let v = view(
            &[
                ("FULL", "2013-07-01"),
                ("2013-07-01", "2013-07-02"),
                ("2013-07-01", "2013-07-03T08:00:00.250000"),
            ],
            &["2013-07-01", "2013-07-02", "2013-07-03T08:00:00.250000"],
        );
        let parent = CalendarPolicy::default()
            .best_parent(&v, at(2013, 7, 4))
            .unwrap();
        assert_eq!(parent.as_str(), "2013-07-03T08:00:00.250000");
    }

    #[test]
    fn test_no_candidates_means_full() {
        let v = view(&[], &[]);
        let policy = CalendarPolicy {
            allow_root_fallback: false,
        };
        assert!(policy.best_parent(&v, at(2013, 7, 10)).unwrap().is_root());

        let v = view(&rotation(), &["2013-07-08T05:00:00"]);
        let err = policy.best_parent(&v, at(2013, 7, 10)).unwrap_err();
        assert!(matches!(err, BackupError::RetentionPolicyExhausted));
    }

    #[test]
    fn test_prune_keeps_current_buckets() {
        let v = view(
            &rotation(),
            &[
                "FULL",
                "2013-07-01",
                "2013-07-02",
                "2013-07-08",
                "2013-07-08T05:00:00",
                "use_for_incr",
            ],
        );
        let doomed = CalendarPolicy::default().prunable(&v, at(2013, 7, 10));
        let names: Vec<_> = doomed.iter().map(Node::as_str).collect();
        // Weekly 07-02 belongs to the previous ISO week; hourlies never stay
        assert_eq!(names, vec!["2013-07-02", "2013-07-08T05:00:00"]);
    }

    #[test]
    fn test_prune_after_month_rollover() {
        let v = view(&rotation(), &["2013-07-01", "2013-07-02", "2013-07-08"]);
        let doomed = CalendarPolicy::default().prunable(&v, at(2013, 8, 5));
        assert_eq!(doomed.len(), 3);
    }

    #[test]
    fn test_prune_leaves_nodes_unknown_to_server() {
        let v = view(&rotation(), &["2013-07-09"]);
        assert!(CalendarPolicy::default()
            .prunable(&v, at(2013, 9, 1))
            .is_empty());
    }

    #[test]
    fn test_iso_week_spans_year_boundary() {
        // 2013-12-30 and 2014-01-01 share ISO week 1 of 2014
        assert!(same_iso_week(at(2013, 12, 30), at(2014, 1, 1)));
        assert!(!same_month(at(2013, 12, 30), at(2014, 1, 1)));
        assert!(!same_iso_week(at(2013, 7, 7), at(2013, 7, 8)));
    }
}
