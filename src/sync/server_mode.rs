//! Server mode backup - runs a client session against a spawned peer.
//!
//! Supports SSH (remote), a local subprocess, and arbitrary commands.

use anyhow::Result;
use std::time::Duration;

use crate::storage::ClientStorage;
use crate::sync::client::{BackupClient, BackupReport};
use crate::transport::{ServerSession, SessionTarget};

/// How long a failed session waits for the peer to exit on its own before
/// killing it. The peer removes its temporary file when it sees the pipe close.
const PEER_EXIT_GRACE: Duration = Duration::from_secs(10);

/// Back up through a `snapback --server` peer reached via `target`.
pub async fn backup_remote<S: ClientStorage>(
    client: &BackupClient<S>,
    target: &SessionTarget,
) -> Result<BackupReport> {
    let session = ServerSession::connect(target).await?;
    backup_over(client, session).await
}

/// Run the session over an already spawned peer. If the session fails the
/// peer gets [`PEER_EXIT_GRACE`] to exit and is killed after that.
pub async fn backup_over<S: ClientStorage>(
    client: &BackupClient<S>,
    session: ServerSession,
) -> Result<BackupReport> {
    let (stdin, stdout, mut peer) = session.split();

    let result = client
        .backup(stdout, stdin, async { Ok(peer.wait().await?) })
        .await;

    if result.is_err() && tokio::time::timeout(PEER_EXIT_GRACE, peer.wait()).await.is_err() {
        tracing::warn!("Server peer did not exit, killing it");
        peer.kill().await;
    }
    result
}
