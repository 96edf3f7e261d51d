//! Centralized configuration for the node manager.
//!
//! Constant tables hold fixed names and tuning values; [`ManagerConfig`] holds
//! the settings a caller may change at startup (see `NodeManagerBuilder`).

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration for install/update/uninstall execution.
pub struct InstallationConfig;

impl InstallationConfig {
    pub const DEFAULT_MAX_CONCURRENT_OPERATIONS: usize = 4;
    pub const DEFAULT_ACQUISITION_TIMEOUT: Duration = Duration::from_secs(1800);
    pub const GIT_CLONE_DEPTH: u32 = 1;
    /// Terminal journal records kept for status polling.
    pub const JOURNAL_RETENTION: usize = 256;
}

/// Network-related configuration.
pub struct NetworkConfig;

impl NetworkConfig {
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
    pub const REGISTRY_TIMEOUT: Duration = Duration::from_secs(15);
    pub const HOST_QUERY_TIMEOUT: Duration = Duration::from_secs(5);
    pub const MAX_RETRIES: u32 = 3;
    pub const DOWNLOAD_TEMP_SUFFIX: &'static str = ".part";
    pub const USER_AGENT: &'static str = "node-manager/0.1";
    pub const DEFAULT_CHANNEL_URL: &'static str =
        "https://raw.githubusercontent.com/ltdrdata/ComfyUI-Manager/main";
    pub const CUSTOM_NODE_LIST: &'static str = "custom-node-list.json";
    pub const MODEL_LIST: &'static str = "model-list.json";
}

/// Directory and file names under the manager root.
pub struct PathsConfig;

impl PathsConfig {
    pub const CUSTOM_NODES_DIR_NAME: &'static str = "custom_nodes";
    pub const MODELS_DIR_NAME: &'static str = "models";
    pub const STATE_DIR_NAME: &'static str = ".manager";
    pub const MANIFEST_FILENAME: &'static str = "manifest.json";
    pub const MANIFEST_LOCK_FILENAME: &'static str = "manifest.lock";
    pub const INTENTS_DIR_NAME: &'static str = "intents";
    pub const STAGING_DIR_NAME: &'static str = "staging";
    pub const BACKUP_DIR_NAME: &'static str = "backup";
    pub const TRASH_DIR_NAME: &'static str = "trash";
}

/// What to do when an install or update would create a node-pattern conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictPolicy {
    /// Refuse the operation with `ConflictDetected`.
    #[default]
    Block,
    /// Proceed and report the conflicts as warnings on the outcome.
    Warn,
}

impl ConflictPolicy {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "block" => Some(ConflictPolicy::Block),
            "warn" => Some(ConflictPolicy::Warn),
            _ => None,
        }
    }
}

/// Runtime settings for a manager instance.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Root holding `custom_nodes/`, `models/` and the `.manager/` state dir.
    pub root: PathBuf,
    pub max_concurrent_operations: usize,
    pub conflict_policy: ConflictPolicy,
    /// Default deadline for network acquisition when the caller gives none.
    pub acquisition_timeout: Duration,
    pub journal_retention: usize,
}

impl ManagerConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            max_concurrent_operations: InstallationConfig::DEFAULT_MAX_CONCURRENT_OPERATIONS,
            conflict_policy: ConflictPolicy::default(),
            acquisition_timeout: InstallationConfig::DEFAULT_ACQUISITION_TIMEOUT,
            journal_retention: InstallationConfig::JOURNAL_RETENTION,
        }
    }

    pub fn layout(&self) -> Layout {
        Layout::new(&self.root)
    }
}

/// Resolved on-disk layout for a manager root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn custom_nodes_dir(&self) -> PathBuf {
        self.root.join(PathsConfig::CUSTOM_NODES_DIR_NAME)
    }

    pub fn models_dir(&self) -> PathBuf {
        self.root.join(PathsConfig::MODELS_DIR_NAME)
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join(PathsConfig::STATE_DIR_NAME)
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.state_dir().join(PathsConfig::MANIFEST_FILENAME)
    }

    pub fn manifest_lock_path(&self) -> PathBuf {
        self.state_dir().join(PathsConfig::MANIFEST_LOCK_FILENAME)
    }

    pub fn intents_dir(&self) -> PathBuf {
        self.state_dir().join(PathsConfig::INTENTS_DIR_NAME)
    }

    /// Scratch directory for one operation's staged artifacts.
    pub fn staging_dir(&self, operation_id: &str) -> PathBuf {
        self.state_dir()
            .join(PathsConfig::STAGING_DIR_NAME)
            .join(operation_id)
    }

    /// Where an update parks the previous version until the swap is committed.
    pub fn backup_dir(&self, operation_id: &str) -> PathBuf {
        self.state_dir()
            .join(PathsConfig::BACKUP_DIR_NAME)
            .join(operation_id)
    }

    /// Where an uninstall parks removed files until the manifest is committed.
    pub fn trash_dir(&self, operation_id: &str) -> PathBuf {
        self.state_dir()
            .join(PathsConfig::TRASH_DIR_NAME)
            .join(operation_id)
    }

    /// Absolute path for a root-relative install path.
    pub fn resolve(&self, relative: &Path) -> PathBuf {
        self.root.join(relative)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_policy_parse() {
        assert_eq!(ConflictPolicy::from_str("Block"), Some(ConflictPolicy::Block));
        assert_eq!(ConflictPolicy::from_str("warn"), Some(ConflictPolicy::Warn));
        assert_eq!(ConflictPolicy::from_str("ignore"), None);
    }

    #[test]
    fn test_layout_paths() {
        let layout = Layout::new("/srv/comfy");
        assert_eq!(layout.custom_nodes_dir(), PathBuf::from("/srv/comfy/custom_nodes"));
        assert_eq!(
            layout.manifest_path(),
            PathBuf::from("/srv/comfy/.manager/manifest.json")
        );
        assert_eq!(
            layout.staging_dir("op-1"),
            PathBuf::from("/srv/comfy/.manager/staging/op-1")
        );
    }

    #[test]
    fn test_defaults_are_reasonable() {
        let config = ManagerConfig::new("/tmp/x");
        assert!(config.max_concurrent_operations >= 1);
        assert!(config.acquisition_timeout > Duration::ZERO);
        assert_eq!(config.conflict_policy, ConflictPolicy::Block);
    }
}
