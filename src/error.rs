use std::path::PathBuf;
use thiserror::Error;

use crate::lineage::Node;

/// Errors that abort a backup session.
///
/// None of these are retried by the library; an outer scheduler re-runs the
/// whole session if it wants another attempt.
#[derive(Error, Debug)]
pub enum BackupError {
    /// Magic number mismatch, piece hash mismatch, missing end sentinel or
    /// a poisoned stream.
    #[error("Protocol integrity failure: {0}")]
    Integrity(String),

    #[error("No ancestry path from {from} to {to}")]
    PathNotFound { from: Node, to: Node },

    /// The repository already holds a backup for this edge.
    #[error("Destination already exists: {}", .0.display())]
    FileExists(PathBuf),

    #[error("{tool} failed: {status}")]
    ExternalTool { tool: String, status: String },

    #[error("No eligible parent snapshot and full-backup fallback is disabled")]
    RetentionPolicyExhausted,

    #[error("Lineage graph contains a cycle through {0}")]
    GraphCycle(Node),

    #[error("Invalid node name {name:?}: {reason}")]
    InvalidNode { name: String, reason: &'static str },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl BackupError {
    pub fn integrity(msg: impl Into<String>) -> Self {
        BackupError::Integrity(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        BackupError::Protocol(msg.into())
    }

    pub fn external(tool: impl Into<String>, status: impl std::fmt::Display) -> Self {
        BackupError::ExternalTool {
            tool: tool.into(),
            status: status.to_string(),
        }
    }

    /// True for failures that mean the bytes on the wire cannot be trusted.
    pub fn is_integrity(&self) -> bool {
        matches!(self, BackupError::Integrity(_))
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
