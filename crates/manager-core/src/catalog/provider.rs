//! Registry providers and registry snapshot validation.
//!
//! Providers only fetch raw documents. Everything they return is untrusted:
//! [`RegistrySnapshot::from_documents`] parses entries one at a time, skips
//! malformed ones with a recorded warning, and rejects the whole load only
//! when an identity appears twice.

use crate::catalog::types::{Artifact, CatalogEntry, EntryId, Model, Package};
use crate::config::NetworkConfig;
use crate::network::HttpClient;
use crate::{ManagerError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

/// Raw registry documents as served by a channel.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryDocuments {
    /// Entries of `custom-node-list.json`.
    #[serde(default)]
    pub custom_nodes: Vec<Value>,
    /// Entries of `model-list.json`.
    #[serde(default)]
    pub models: Vec<Value>,
}

/// Source of registry documents.
#[async_trait]
pub trait RegistryProvider: Send + Sync {
    /// Fetch the current documents. Unreachable sources map to
    /// `RegistryUnavailable`.
    async fn fetch(&self) -> Result<RegistryDocuments>;
}

/// A registry entry skipped during validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryWarning {
    pub document: String,
    pub index: usize,
    pub message: String,
}

/// Validated registry contents.
#[derive(Debug, Clone, Default)]
pub struct RegistrySnapshot {
    entries: BTreeMap<EntryId, CatalogEntry>,
    warnings: Vec<RegistryWarning>,
    fetched_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl RegistrySnapshot {
    /// Validate raw documents into a snapshot.
    pub fn from_documents(documents: RegistryDocuments) -> Result<Self> {
        let mut entries = BTreeMap::new();
        let mut warnings = Vec::new();
        let mut seen_references: HashSet<String> = HashSet::new();
        let mut path_owners: HashMap<PathBuf, EntryId> = HashMap::new();

        for (index, raw) in documents.custom_nodes.into_iter().enumerate() {
            match serde_json::from_value::<Package>(raw) {
                Ok(package) => {
                    if !seen_references.insert(package.reference.clone()) {
                        return Err(ManagerError::RegistryMalformed {
                            message: format!(
                                "duplicate package reference '{}' at custom_nodes[{}]",
                                package.reference, index
                            ),
                        });
                    }
                    let artifacts = match package.artifacts() {
                        Ok(artifacts) => artifacts,
                        Err(message) => {
                            warn!("Skipping custom_nodes[{}]: {}", index, message);
                            warnings.push(RegistryWarning {
                                document: "custom_nodes".to_string(),
                                index,
                                message,
                            });
                            continue;
                        }
                    };
                    let id = package.id();
                    let shared = note_shared_paths(&mut path_owners, &id, &artifacts);
                    warnings.extend(shared.into_iter().map(|message| RegistryWarning {
                        document: "custom_nodes".to_string(),
                        index,
                        message,
                    }));
                    entries.insert(id, CatalogEntry::Package(package));
                }
                Err(e) => {
                    warn!("Skipping malformed custom_nodes[{}]: {}", index, e);
                    warnings.push(RegistryWarning {
                        document: "custom_nodes".to_string(),
                        index,
                        message: e.to_string(),
                    });
                }
            }
        }

        for (index, raw) in documents.models.into_iter().enumerate() {
            match serde_json::from_value::<Model>(raw) {
                Ok(mut model) => {
                    let normalized = model.normalize_save_path().and_then(|()| model.artifacts());
                    let artifacts = match normalized {
                        Ok(artifacts) => artifacts,
                        Err(message) => {
                            warn!("Skipping models[{}]: {}", index, message);
                            warnings.push(RegistryWarning {
                                document: "models".to_string(),
                                index,
                                message,
                            });
                            continue;
                        }
                    };
                    let id = model.id();
                    if entries.contains_key(&id) {
                        return Err(ManagerError::RegistryMalformed {
                            message: format!(
                                "duplicate model identity '{}' at models[{}]",
                                id, index
                            ),
                        });
                    }
                    let shared = note_shared_paths(&mut path_owners, &id, &artifacts);
                    warnings.extend(shared.into_iter().map(|message| RegistryWarning {
                        document: "models".to_string(),
                        index,
                        message,
                    }));
                    entries.insert(id, CatalogEntry::Model(model));
                }
                Err(e) => {
                    warn!("Skipping malformed models[{}]: {}", index, e);
                    warnings.push(RegistryWarning {
                        document: "models".to_string(),
                        index,
                        message: e.to_string(),
                    });
                }
            }
        }

        debug!(
            "Registry snapshot: {} entries, {} skipped",
            entries.len(),
            warnings.len()
        );

        Ok(Self {
            entries,
            warnings,
            fetched_at: Some(chrono::Utc::now()),
        })
    }

    pub fn get(&self, id: &EntryId) -> Option<&CatalogEntry> {
        self.entries.get(id)
    }

    pub fn entries(&self) -> impl Iterator<Item = &CatalogEntry> {
        self.entries.values()
    }

    pub fn packages(&self) -> impl Iterator<Item = &Package> {
        self.entries.values().filter_map(CatalogEntry::as_package)
    }

    pub fn models(&self) -> impl Iterator<Item = &Model> {
        self.entries.values().filter_map(|e| match e {
            CatalogEntry::Model(m) => Some(m),
            CatalogEntry::Package(_) => None,
        })
    }

    pub fn warnings(&self) -> &[RegistryWarning] {
        &self.warnings
    }

    pub fn fetched_at(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        self.fetched_at
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Fetches `custom-node-list.json` and `model-list.json` from a channel URL.
pub struct HttpRegistryProvider {
    http: Arc<HttpClient>,
    channel_url: String,
}

impl HttpRegistryProvider {
    pub fn new(channel_url: impl Into<String>) -> Result<Self> {
        Ok(Self {
            http: Arc::new(HttpClient::with_timeout(NetworkConfig::REGISTRY_TIMEOUT)?),
            channel_url: channel_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn with_client(http: Arc<HttpClient>, channel_url: impl Into<String>) -> Self {
        Self {
            http,
            channel_url: channel_url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn fetch_list(&self, file: &str, key: &str) -> Result<Vec<Value>> {
        let url = format!("{}/{}", self.channel_url, file);
        let response = self
            .http
            .get(&url)
            .await
            .map_err(|e| ManagerError::RegistryUnavailable {
                message: format!("{}: {}", url, e),
            })?;

        if !response.status().is_success() {
            return Err(ManagerError::RegistryUnavailable {
                message: format!("{} returned status {}", url, response.status()),
            });
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| ManagerError::RegistryMalformed {
                message: format!("{} is not valid JSON: {}", url, e),
            })?;
        extract_list(body, key, &url)
    }
}

#[async_trait]
impl RegistryProvider for HttpRegistryProvider {
    async fn fetch(&self) -> Result<RegistryDocuments> {
        let (custom_nodes, models) = futures::try_join!(
            self.fetch_list(NetworkConfig::CUSTOM_NODE_LIST, "custom_nodes"),
            self.fetch_list(NetworkConfig::MODEL_LIST, "models"),
        )?;
        Ok(RegistryDocuments {
            custom_nodes,
            models,
        })
    }
}

/// Reads the same two documents from a local directory.
pub struct FileRegistryProvider {
    dir: PathBuf,
}

impl FileRegistryProvider {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    async fn read_list(&self, file: &str, key: &str) -> Result<Vec<Value>> {
        let path = self.dir.join(file);
        if !path.exists() {
            debug!("Registry document {} absent, treating as empty", path.display());
            return Ok(Vec::new());
        }
        let contents =
            tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| ManagerError::RegistryUnavailable {
                    message: format!("{}: {}", path.display(), e),
                })?;
        let body: Value =
            serde_json::from_str(&contents).map_err(|e| ManagerError::RegistryMalformed {
                message: format!("{} is not valid JSON: {}", path.display(), e),
            })?;
        extract_list(body, key, &path.display().to_string())
    }
}

#[async_trait]
impl RegistryProvider for FileRegistryProvider {
    async fn fetch(&self) -> Result<RegistryDocuments> {
        Ok(RegistryDocuments {
            custom_nodes: self
                .read_list(NetworkConfig::CUSTOM_NODE_LIST, "custom_nodes")
                .await?,
            models: self.read_list(NetworkConfig::MODEL_LIST, "models").await?,
        })
    }
}

/// Serves fixed documents. Useful for embedding and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticRegistryProvider {
    documents: Arc<std::sync::RwLock<RegistryDocuments>>,
}

impl StaticRegistryProvider {
    pub fn new(documents: RegistryDocuments) -> Self {
        Self {
            documents: Arc::new(std::sync::RwLock::new(documents)),
        }
    }

    /// Replace the served documents (e.g. to publish a newer version).
    pub fn replace(&self, documents: RegistryDocuments) {
        if let Ok(mut guard) = self.documents.write() {
            *guard = documents;
        }
    }
}

#[async_trait]
impl RegistryProvider for StaticRegistryProvider {
    async fn fetch(&self) -> Result<RegistryDocuments> {
        self.documents
            .read()
            .map(|d| d.clone())
            .map_err(|_| ManagerError::RegistryUnavailable {
                message: "static registry lock poisoned".to_string(),
            })
    }
}

/// Accept either `{"<key>": [...]}` or a bare array.
fn extract_list(body: Value, key: &str, origin: &str) -> Result<Vec<Value>> {
    match body {
        Value::Array(items) => Ok(items),
        Value::Object(mut map) => match map.remove(key) {
            Some(Value::Array(items)) => Ok(items),
            _ => Err(ManagerError::RegistryMalformed {
                message: format!("{} has no '{}' array", origin, key),
            }),
        },
        _ => Err(ManagerError::RegistryMalformed {
            message: format!("{} is neither an object nor an array", origin),
        }),
    }
}

/// Record `id` as the owner of its derived paths. Returns a message for
/// every path an earlier entry already derives; both entries stay in the
/// catalog and installs refuse to write over each other's files.
fn note_shared_paths(
    owners: &mut HashMap<PathBuf, EntryId>,
    id: &EntryId,
    artifacts: &[Artifact],
) -> Vec<String> {
    let mut shared = Vec::new();
    for artifact in artifacts {
        match owners.get(&artifact.relative_path) {
            Some(first) => {
                let message = format!(
                    "{} shares {} with {}",
                    id,
                    artifact.relative_path.display(),
                    first
                );
                warn!("{}", message);
                shared.push(message);
            }
            None => {
                owners.insert(artifact.relative_path.clone(), id.clone());
            }
        }
    }
    shared
}
