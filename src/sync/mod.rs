//! Backup sessions from the client's point of view.

pub mod client;
pub mod server_mode;

pub use client::{BackupClient, BackupReport};
pub use server_mode::{backup_over, backup_remote};
