//! Server session - spawns the peer that runs `snapback --server`
//!
//! Provides raw stdin/stdout streams. Protocol handling is done by BackupClient.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use crate::config::RemoteConfig;
use crate::error::BackupError;

/// Where the server side of a session runs.
#[derive(Debug, Clone)]
pub enum SessionTarget {
    /// `ssh host <program> --server <repository>`
    Ssh(RemoteConfig),
    /// This executable, serving a local repository
    Local(PathBuf),
    /// Any command that speaks the protocol on stdin/stdout
    Command(Vec<String>),
}

/// Manages connection to a server instance
pub struct ServerSession {
    child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
    label: String,
}

impl ServerSession {
    pub async fn connect(target: &SessionTarget) -> Result<Self> {
        match target {
            SessionTarget::Ssh(remote) => Self::connect_ssh(remote).await,
            SessionTarget::Local(repository) => Self::connect_local(repository).await,
            SessionTarget::Command(argv) => Self::connect_command(argv).await,
        }
    }

    /// Connect to remote server via SSH
    pub async fn connect_ssh(config: &RemoteConfig) -> Result<Self> {
        if config.host.is_empty() {
            anyhow::bail!("No remote host configured");
        }

        let mut cmd = Command::new("ssh");

        cmd.arg(&config.host);

        if let Some(user) = config.user.as_deref().filter(|u| !u.is_empty()) {
            cmd.arg("-l").arg(user);
        }

        if config.port != 22 {
            cmd.arg("-p").arg(config.port.to_string());
        }

        for key in &config.identity_file {
            cmd.arg("-i").arg(key);
        }

        // Remote command: snapback --server <repository>
        cmd.arg(&config.program);
        cmd.arg("--server");
        cmd.arg(&config.repository);

        Self::spawn(cmd, format!("ssh {}", config.host))
    }

    /// Connect to local server (this executable)
    pub async fn connect_local(repository: &Path) -> Result<Self> {
        let exe = std::env::current_exe()?;
        let mut cmd = Command::new(exe);
        cmd.arg("--server");
        cmd.arg(repository);

        Self::spawn(cmd, "local server".to_string())
    }

    /// Connect through an arbitrary command line
    pub async fn connect_command(argv: &[String]) -> Result<Self> {
        let (program, args) = argv.split_first().context("Empty server command")?;
        let mut cmd = Command::new(program);
        cmd.args(args);

        Self::spawn(cmd, program.clone())
    }

    fn spawn(mut cmd: Command, label: String) -> Result<Self> {
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::inherit());
        cmd.kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn {}", label))?;

        let stdin = child.stdin.take().context("Failed to open stdin")?;
        let stdout = child.stdout.take().context("Failed to open stdout")?;

        tracing::debug!("Spawned {}", label);
        Ok(Self {
            child,
            stdin,
            stdout,
            label,
        })
    }

    /// Split into stdin/stdout for protocol handling, plus the process
    /// handle to wait on once the client is done writing.
    pub fn split(self) -> (ChildStdin, ChildStdout, PeerProcess) {
        (
            self.stdin,
            self.stdout,
            PeerProcess {
                child: self.child,
                label: self.label,
            },
        )
    }
}

/// The spawned server process.
pub struct PeerProcess {
    child: Child,
    label: String,
}

impl PeerProcess {
    /// Wait for exit; non-zero is an `ExternalTool` error.
    pub async fn wait(&mut self) -> crate::error::Result<()> {
        let status = self.child.wait().await?;
        check_status(&self.label, status)
    }

    /// Terminate and reap. Already exited is not an error.
    pub async fn kill(&mut self) {
        match self.child.try_wait() {
            Ok(Some(_)) => return,
            Ok(None) => {}
            Err(e) => tracing::debug!("Could not poll {}: {}", self.label, e),
        }
        if let Err(e) = self.child.kill().await {
            tracing::debug!("{} already gone: {}", self.label, e);
        }
    }
}

fn check_status(label: &str, status: ExitStatus) -> crate::error::Result<()> {
    if status.success() {
        Ok(())
    } else {
        Err(BackupError::external(label, status))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    #[tokio::test]
    async fn test_command_session_pipes() {
        let session = ServerSession::connect(&SessionTarget::Command(sh("cat")))
            .await
            .unwrap();
        let (mut stdin, mut stdout, mut peer) = session.split();

        stdin.write_all(b"echo through the peer").await.unwrap();
        drop(stdin);

        let mut out = String::new();
        stdout.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "echo through the peer");
        peer.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_external_tool_error() {
        let session = ServerSession::connect_command(&sh("exit 7")).await.unwrap();
        let (_stdin, _stdout, mut peer) = session.split();

        let err = peer.wait().await.unwrap_err();
        assert!(matches!(err, BackupError::ExternalTool { .. }));
    }

    #[tokio::test]
    async fn test_kill_tolerates_exited_child() {
        let session = ServerSession::connect_command(&sh("true")).await.unwrap();
        let (_stdin, _stdout, mut peer) = session.split();

        peer.wait().await.unwrap();
        peer.kill().await;
        peer.kill().await;
    }

    #[tokio::test]
    async fn test_empty_command_rejected() {
        assert!(ServerSession::connect_command(&[]).await.is_err());
    }

    #[tokio::test]
    async fn test_ssh_requires_host() {
        assert!(ServerSession::connect_ssh(&RemoteConfig::default()).await.is_err());
    }
}
