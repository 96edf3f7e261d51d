//! Shared state behind a `NodeManager`.

use crate::catalog::CatalogStore;
use crate::config::ManagerConfig;
use crate::host::{HostNodeType, NodeTypeRegistry};
use crate::journal::OperationJournal;
use crate::orchestrator::Installer;
use std::sync::Arc;
use tracing::warn;

pub(crate) struct ManagerState {
    pub config: ManagerConfig,
    pub store: Arc<CatalogStore>,
    pub journal: Arc<OperationJournal>,
    pub installer: Installer,
    pub host: Arc<dyn NodeTypeRegistry>,
}

impl ManagerState {
    /// Host node types for the read path; an unreachable host yields none.
    pub async fn host_types(&self) -> Vec<HostNodeType> {
        match self.host.loaded_node_types().await {
            Ok(types) => types,
            Err(e) => {
                warn!("Host node types unavailable: {}", e);
                Vec::new()
            }
        }
    }
}
