//! Node and edge identifiers.
//!
//! A node names one backup point. Managed names are local timestamps with
//! six fractional digits, so lexicographic order is chronological order.

use chrono::{NaiveDate, NaiveDateTime};
use serde::Serialize;
use std::borrow::Borrow;
use std::fmt;
use std::str::FromStr;

use crate::error::{BackupError, Result};

/// Sentinel node meaning "no parent": the edge carries a full snapshot.
pub const ROOT_NODE: &str = "FULL";

/// Format used for newly generated node names.
pub const NODE_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

/// Separator between the two nodes in a repository filename.
pub const EDGE_SEPARATOR: &str = "__";

/// Longest node name in bytes; one path component on common filesystems.
pub const MAX_NODE_NAME_LEN: usize = 255;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct Node(String);

impl Node {
    /// Validate and wrap a node name.
    ///
    /// Names end up as path components on both hosts and as one half of a
    /// `from__to.btrfs` filename, so separators and traversal are rejected.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let reason = if name.is_empty() {
            Some("empty name")
        } else if name.len() > MAX_NODE_NAME_LEN {
            Some("longer than 255 bytes")
        } else if name == "." || name == ".." {
            Some("reserved path component")
        } else if name.contains('/') || name.contains('\\') {
            Some("contains a path separator")
        } else if name.contains('\0') {
            Some("contains a NUL byte")
        } else if name.contains(EDGE_SEPARATOR) {
            Some("contains the edge separator \"__\"")
        } else {
            None
        };

        match reason {
            Some(reason) => Err(BackupError::InvalidNode { name, reason }),
            None => Ok(Self(name)),
        }
    }

    pub fn root() -> Self {
        Self(ROOT_NODE.to_string())
    }

    pub fn is_root(&self) -> bool {
        self.0 == ROOT_NODE
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name a node after the moment its snapshot is taken.
    pub fn from_timestamp(ts: NaiveDateTime) -> Self {
        Self(ts.format(NODE_TIME_FORMAT).to_string())
    }

    /// Timestamp encoded in the name, if this is a managed node.
    pub fn timestamp(&self) -> Option<NaiveDateTime> {
        parse_node_time(&self.0)
    }
}

/// Parse the timestamp forms a node name may carry.
///
/// Accepts full precision, whole seconds and a bare date.
pub fn parse_node_time(s: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S"))
        .ok()
        .or_else(|| {
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Node {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        Node::new(s)
    }
}

impl AsRef<str> for Node {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for Node {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// `to` was produced as an incremental diff against `from`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Edge {
    pub from: Node,
    pub to: Node,
}

impl Edge {
    pub fn new(from: Node, to: Node) -> Self {
        Self { from, to }
    }

    /// Build an edge from raw names, validating both.
    pub fn parse(from: &str, to: &str) -> Result<Self> {
        Ok(Self {
            from: Node::new(from)?,
            to: Node::new(to)?,
        })
    }

    /// Edge carries a full (non-incremental) snapshot.
    pub fn is_full(&self) -> bool {
        self.from.is_root()
    }
}

impl fmt::Display for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.from, self.to)
    }
}
