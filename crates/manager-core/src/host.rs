//! Host node-type registry adapters.
//!
//! The host editor knows which node types are actually loaded and which
//! Python module registered each one. The manager only reads that list, to
//! cross-check package patterns against node types it did not install.

use crate::config::NetworkConfig;
use crate::network::HttpClient;
use crate::{ManagerError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// A node type currently loaded by the host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HostNodeType {
    pub name: String,
    /// Registering module, e.g. `custom_nodes.ComfyUI-Foo`; `None` or `nodes`
    /// for built-ins.
    #[serde(default)]
    pub provider: Option<String>,
}

impl HostNodeType {
    pub fn new(name: impl Into<String>, provider: Option<&str>) -> Self {
        Self {
            name: name.into(),
            provider: provider.map(String::from),
        }
    }

    /// Directory name under `custom_nodes/` that registered this type, if
    /// it came from an extension.
    pub fn provider_dir(&self) -> Option<&str> {
        let provider = self.provider.as_deref()?;
        let rest = provider.strip_prefix("custom_nodes.")?;
        // Nested modules ("custom_nodes.Foo.nodes") belong to the top-level dir.
        rest.split('.').next().filter(|s| !s.is_empty())
    }
}

/// Read-only view of the host's loaded node types.
#[async_trait]
pub trait NodeTypeRegistry: Send + Sync {
    async fn loaded_node_types(&self) -> Result<Vec<HostNodeType>>;
}

/// Reads `GET {host}/object_info`, keyed by node type with a
/// `python_module` field per entry.
pub struct HttpNodeTypeRegistry {
    http: Arc<HttpClient>,
    base_url: String,
}

impl HttpNodeTypeRegistry {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        Ok(Self {
            http: Arc::new(HttpClient::with_timeout(NetworkConfig::HOST_QUERY_TIMEOUT)?),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl NodeTypeRegistry for HttpNodeTypeRegistry {
    async fn loaded_node_types(&self) -> Result<Vec<HostNodeType>> {
        let url = format!("{}/object_info", self.base_url);
        let response = self.http.get(&url).await?;
        if !response.status().is_success() {
            return Err(ManagerError::Network {
                message: format!("{} returned status {}", url, response.status()),
                source: None,
            });
        }
        let body: Value = response.json().await?;
        let types = parse_object_info(&body);
        debug!("Host reports {} loaded node types", types.len());
        Ok(types)
    }
}

/// Serves a fixed list. Default when no host is configured.
#[derive(Debug, Clone, Default)]
pub struct StaticNodeTypeRegistry {
    types: Vec<HostNodeType>,
}

impl StaticNodeTypeRegistry {
    pub fn new(types: Vec<HostNodeType>) -> Self {
        Self { types }
    }
}

#[async_trait]
impl NodeTypeRegistry for StaticNodeTypeRegistry {
    async fn loaded_node_types(&self) -> Result<Vec<HostNodeType>> {
        Ok(self.types.clone())
    }
}

fn parse_object_info(body: &Value) -> Vec<HostNodeType> {
    let Some(map) = body.as_object() else {
        return Vec::new();
    };
    let mut types: Vec<HostNodeType> = map
        .iter()
        .map(|(name, info)| HostNodeType {
            name: name.clone(),
            provider: info
                .get("python_module")
                .and_then(Value::as_str)
                .map(String::from),
        })
        .collect();
    types.sort_by(|a, b| a.name.cmp(&b.name));
    types
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_object_info() {
        let body = json!({
            "KSampler": {"python_module": "nodes", "category": "sampling"},
            "ImpactWildcard": {"python_module": "custom_nodes.ComfyUI-Impact-Pack"},
            "Odd": {}
        });
        let types = parse_object_info(&body);
        assert_eq!(types.len(), 3);
        let impact = types.iter().find(|t| t.name == "ImpactWildcard").unwrap();
        assert_eq!(impact.provider_dir(), Some("ComfyUI-Impact-Pack"));
        let builtin = types.iter().find(|t| t.name == "KSampler").unwrap();
        assert_eq!(builtin.provider_dir(), None);
    }

    #[test]
    fn test_provider_dir_of_nested_module() {
        let t = HostNodeType::new("X", Some("custom_nodes.Foo.nodes.sub"));
        assert_eq!(t.provider_dir(), Some("Foo"));
        assert_eq!(HostNodeType::new("Y", None).provider_dir(), None);
    }

    #[tokio::test]
    async fn test_static_registry() {
        let registry = StaticNodeTypeRegistry::new(vec![HostNodeType::new("A", None)]);
        assert_eq!(registry.loaded_node_types().await.unwrap().len(), 1);
    }
}
