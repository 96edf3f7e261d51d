//! Builder for configuring NodeManager initialization.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::acquire::{ArtifactSource, DefaultArtifactSource};
use crate::api::ManagerState;
use crate::catalog::{CatalogStore, HttpRegistryProvider, RegistryProvider};
use crate::config::{ConflictPolicy, ManagerConfig, NetworkConfig};
use crate::error::{ManagerError, Result};
use crate::host::{HttpNodeTypeRegistry, NodeTypeRegistry, StaticNodeTypeRegistry};
use crate::journal::OperationJournal;
use crate::orchestrator::{Installer, InstallerSettings};
use crate::NodeManager;
use tracing::info;

/// Builder for configuring NodeManager initialization.
///
/// Every external capability can be injected; anything left unset gets the
/// network-backed default.
///
/// # Example
///
/// ```rust,ignore
/// use manager_core::{ConflictPolicy, NodeManager};
///
/// let manager = NodeManager::builder("./ComfyUI")
///     .auto_create_dirs(true)
///     .conflict_policy(ConflictPolicy::Warn)
///     .host_url("http://127.0.0.1:8188")
///     .build()
///     .await?;
/// ```
pub struct NodeManagerBuilder {
    config: ManagerConfig,
    auto_create_dirs: bool,
    channel_url: String,
    host_url: Option<String>,
    registry: Option<Arc<dyn RegistryProvider>>,
    source: Option<Arc<dyn ArtifactSource>>,
    host: Option<Arc<dyn NodeTypeRegistry>>,
}

impl NodeManagerBuilder {
    /// Create a new builder for the given manager root.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            config: ManagerConfig::new(root),
            auto_create_dirs: false,
            channel_url: NetworkConfig::DEFAULT_CHANNEL_URL.to_string(),
            host_url: None,
            registry: None,
            source: None,
            host: None,
        }
    }

    /// Create the root, `custom_nodes/` and `models/` if missing.
    ///
    /// Default: `false` (the root must exist)
    pub fn auto_create_dirs(mut self, enable: bool) -> Self {
        self.auto_create_dirs = enable;
        self
    }

    /// Upper bound on operations executing at once (at least 1).
    pub fn max_concurrent_operations(mut self, max: usize) -> Self {
        self.config.max_concurrent_operations = max;
        self
    }

    /// Default: [`ConflictPolicy::Block`]
    pub fn conflict_policy(mut self, policy: ConflictPolicy) -> Self {
        self.config.conflict_policy = policy;
        self
    }

    /// Acquisition deadline used when a call does not supply one.
    pub fn acquisition_timeout(mut self, timeout: Duration) -> Self {
        self.config.acquisition_timeout = timeout;
        self
    }

    /// Finished operation records kept for status queries.
    pub fn journal_retention(mut self, retention: usize) -> Self {
        self.config.journal_retention = retention;
        self
    }

    /// Channel serving `custom-node-list.json` and `model-list.json`.
    /// Ignored when a registry provider is injected.
    pub fn channel_url(mut self, url: impl Into<String>) -> Self {
        self.channel_url = url.into();
        self
    }

    /// Host editor base URL, queried for loaded node types. Ignored when a
    /// node-type registry is injected.
    pub fn host_url(mut self, url: impl Into<String>) -> Self {
        self.host_url = Some(url.into());
        self
    }

    pub fn registry_provider(mut self, provider: Arc<dyn RegistryProvider>) -> Self {
        self.registry = Some(provider);
        self
    }

    pub fn artifact_source(mut self, source: Arc<dyn ArtifactSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn node_type_registry(mut self, registry: Arc<dyn NodeTypeRegistry>) -> Self {
        self.host = Some(registry);
        self
    }

    fn prepare_root(&self) -> Result<()> {
        let root = &self.config.root;
        if !self.auto_create_dirs {
            if !root.is_dir() {
                return Err(ManagerError::Config {
                    message: format!("Manager root does not exist: {}", root.display()),
                });
            }
            return Ok(());
        }

        let layout = self.config.layout();
        for dir in [layout.root().to_path_buf(), layout.custom_nodes_dir(), layout.models_dir()] {
            std::fs::create_dir_all(&dir).map_err(|e| ManagerError::Io {
                message: format!("Failed to create directory: {}", dir.display()),
                path: Some(dir.clone()),
                source: Some(e),
            })?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.config.max_concurrent_operations == 0 {
            return Err(ManagerError::Config {
                message: "max_concurrent_operations must be at least 1".to_string(),
            });
        }
        if self.config.acquisition_timeout.is_zero() {
            return Err(ManagerError::Config {
                message: "acquisition_timeout must be non-zero".to_string(),
            });
        }
        if self.registry.is_none() {
            url::Url::parse(&self.channel_url).map_err(|e| ManagerError::Config {
                message: format!("Invalid channel URL '{}': {}", self.channel_url, e),
            })?;
        }
        if let (None, Some(host_url)) = (&self.host, &self.host_url) {
            url::Url::parse(host_url).map_err(|e| ManagerError::Config {
                message: format!("Invalid host URL '{}': {}", host_url, e),
            })?;
        }
        Ok(())
    }

    /// Build the NodeManager, loading (and recovering) local state.
    ///
    /// The registry is fetched lazily on first use.
    pub async fn build(self) -> Result<NodeManager> {
        self.validate()?;
        self.prepare_root()?;

        let registry = match self.registry {
            Some(provider) => provider,
            None => Arc::new(HttpRegistryProvider::new(self.channel_url.as_str())?),
        };
        let source = match self.source {
            Some(source) => source,
            None => Arc::new(DefaultArtifactSource::new()?),
        };
        let host: Arc<dyn NodeTypeRegistry> = match (self.host, self.host_url) {
            (Some(host), _) => host,
            (None, Some(url)) => Arc::new(HttpNodeTypeRegistry::new(url)?),
            (None, None) => Arc::new(StaticNodeTypeRegistry::default()),
        };

        let config = self.config;
        let journal = Arc::new(OperationJournal::new(config.journal_retention));
        let store = Arc::new(CatalogStore::new(
            config.layout(),
            registry,
            journal.state_lock(),
        ));

        let local = store.load_local_state().await?;
        journal.record_recovered(local.recovered());

        let installer = Installer::new(
            store.clone(),
            journal.clone(),
            source,
            host.clone(),
            InstallerSettings {
                max_concurrent_operations: config.max_concurrent_operations,
                conflict_policy: config.conflict_policy,
                acquisition_timeout: config.acquisition_timeout,
            },
        );

        info!(
            "Node manager ready at {} ({} installed records)",
            config.root.display(),
            local.records().len()
        );

        Ok(NodeManager {
            state: Arc::new(ManagerState {
                config,
                store,
                journal,
                installer,
                host,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{RegistryDocuments, StaticRegistryProvider};
    use tempfile::TempDir;

    fn offline(root: impl Into<PathBuf>) -> NodeManagerBuilder {
        NodeManagerBuilder::new(root)
            .registry_provider(Arc::new(StaticRegistryProvider::new(RegistryDocuments::default())))
    }

    #[tokio::test]
    async fn test_missing_root_is_config_error() {
        let dir = TempDir::new().unwrap();
        let result = offline(dir.path().join("absent")).build().await;
        assert!(matches!(result, Err(ManagerError::Config { .. })));
    }

    #[tokio::test]
    async fn test_auto_create_dirs() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("comfy");
        offline(&root).auto_create_dirs(true).build().await.unwrap();
        assert!(root.join("custom_nodes").is_dir());
        assert!(root.join("models").is_dir());
        assert!(root.join(".manager").is_dir());
    }

    #[tokio::test]
    async fn test_rejects_zero_concurrency_and_bad_urls() {
        let dir = TempDir::new().unwrap();
        let result = offline(dir.path()).max_concurrent_operations(0).build().await;
        assert!(matches!(result, Err(ManagerError::Config { .. })));

        let result = NodeManagerBuilder::new(dir.path())
            .channel_url("not a url")
            .build()
            .await;
        assert!(matches!(result, Err(ManagerError::Config { .. })));
    }
}
