//! Backup lineage: the edge graph and the retention policies that read it.

pub mod calendar;
pub mod graph;
pub mod node;
pub mod policy;
pub mod threshold;

pub use calendar::{Bucket, CalendarPolicy};
pub use graph::LineageGraph;
pub use node::{Edge, Node, MAX_NODE_NAME_LEN, ROOT_NODE};
pub use policy::{LineageView, PolicyKind, Retention, RetentionPolicy};
pub use threshold::{ThresholdPolicy, MAX_HEIGHT};
