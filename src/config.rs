//! Configuration file (`$XDG_CONFIG_HOME/snapback/config.toml`).
//!
//! Every key is optional; command-line flags override what is loaded here.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{BackupError, Result};
use crate::lineage::PolicyKind;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub policy: PolicyConfig,
    pub btrfs: BtrfsConfig,
    pub remote: Option<RemoteConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub kind: PolicyKind,
    /// Take a full snapshot when no parent qualifies. The threshold policy
    /// additionally requires the root to be listed among the local nodes.
    pub allow_root_fallback: bool,
    /// Threshold policy only: skip parents that reached their child cap.
    pub enforce_depth_caps: bool,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            kind: PolicyKind::default(),
            allow_root_fallback: true,
            enforce_depth_caps: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BtrfsConfig {
    pub binary: PathBuf,
}

impl Default for BtrfsConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("btrfs"),
        }
    }
}

/// Repository host reached through ssh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub host: String,
    pub user: Option<String>,
    pub port: u16,
    pub identity_file: Vec<PathBuf>,
    /// Repository directory on the remote host.
    pub repository: PathBuf,
    /// Name of the snapback executable on the remote host.
    pub program: String,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            user: None,
            port: 22,
            identity_file: Vec::new(),
            repository: PathBuf::from("~/backups"),
            program: "snapback".to_string(),
        }
    }
}

impl Config {
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("snapback").join("config.toml"))
    }

    /// Load from `path`, or from the default location when `None`.
    ///
    /// An explicit path must exist; a missing default file yields defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, required) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => match Self::default_path() {
                Some(p) => (p, false),
                None => return Ok(Self::default()),
            },
        };

        if !path.exists() {
            if required {
                return Err(BackupError::Config(format!(
                    "config file not found: {}",
                    path.display()
                )));
            }
            return Ok(Self::default());
        }

        let text = std::fs::read_to_string(&path)?;
        Self::from_toml(&text)
            .map_err(|e| BackupError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| BackupError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_empty_config_is_default() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.policy.kind, PolicyKind::Calendar);
        assert!(config.policy.allow_root_fallback);
        assert_eq!(config.btrfs.binary, PathBuf::from("btrfs"));
        assert!(config.remote.is_none());
    }

    #[test]
    fn test_parse_full_config() {
        let config = Config::from_toml(
            r#"
            [policy]
            kind = "threshold"
            allow_root_fallback = false
            enforce_depth_caps = true

            [btrfs]
            binary = "/usr/sbin/btrfs"

            [remote]
            host = "vault.example.net"
            user = "backup"
            repository = "/srv/snapback"
            "#,
        )
        .unwrap();

        assert_eq!(config.policy.kind, PolicyKind::Threshold);
        assert!(!config.policy.allow_root_fallback);
        assert!(config.policy.enforce_depth_caps);
        assert_eq!(config.btrfs.binary, PathBuf::from("/usr/sbin/btrfs"));

        let remote = config.remote.unwrap();
        assert_eq!(remote.host, "vault.example.net");
        assert_eq!(remote.user.as_deref(), Some("backup"));
        assert_eq!(remote.port, 22);
        assert_eq!(remote.program, "snapback");
    }

    #[test]
    fn test_unknown_policy_kind_rejected() {
        let err = Config::from_toml("[policy]\nkind = \"fifo\"\n").unwrap_err();
        assert!(matches!(err, BackupError::Config(_)));
    }

    #[test]
    fn test_load_explicit_path() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");

        assert!(Config::load(Some(&path)).is_err());

        std::fs::write(&path, "[policy]\nkind = \"threshold\"\n").unwrap();
        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.policy.kind, PolicyKind::Threshold);
    }
}
