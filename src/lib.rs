//! Incremental btrfs snapshot backup.
//!
//! A client snapshots a subvolume, asks the repository server which backups
//! it already holds, diffs the new snapshot against the best local parent and
//! streams it over a verified byte pipe. The server stores one file per edge
//! of the backup lineage.

pub mod config;
pub mod error;
pub mod lineage;
pub mod server;
pub mod storage;
pub mod streaming;
pub mod sync;
pub mod temp_file;
pub mod transport;

pub use error::{BackupError, Result};
