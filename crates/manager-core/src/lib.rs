//! Manager Core - Headless catalog reconciliation and install orchestration
//! for node-graph editor extensions (custom node packages) and models.
//!
//! Given a registry of available packages and models and what is on disk,
//! the manager computes each entry's install state, detects packages whose
//! node identifiers overlap, and drives install, update and uninstall with
//! staged, recoverable swaps. It has no HTTP surface of its own; see the
//! `manager-rpc` crate for that.
//!
//! # Example
//!
//! ```rust,ignore
//! use manager_core::{EntryId, NodeManager};
//!
//! #[tokio::main]
//! async fn main() -> manager_core::Result<()> {
//!     let manager = NodeManager::builder("/path/to/ComfyUI")
//!         .auto_create_dirs(true)
//!         .build()
//!         .await?;
//!
//!     let catalog = manager.catalog().await?;
//!     println!("{} catalog entries", catalog.items.len());
//!
//!     let outcome = manager
//!         .install(EntryId::package("https://github.com/ltdrdata/ComfyUI-Impact-Pack"))
//!         .await;
//!     println!("install succeeded: {}", outcome.is_success());
//!     Ok(())
//! }
//! ```

pub mod acquire;
pub mod cancel;
pub mod catalog;
pub mod config;
pub mod error;
pub mod host;
pub mod journal;
pub mod metadata;
pub mod network;
pub mod orchestrator;
pub mod reconcile;

mod api;

// Re-export commonly used types
pub use acquire::{ArtifactSource, DefaultArtifactSource, FetchReceipt, FetchRequest};
pub use cancel::{CancellationToken, CancelledError};
pub use catalog::{
    CatalogEntry, EntryId, FileRegistryProvider, HttpRegistryProvider, LocalSnapshot, Model,
    NodePattern, OperationKind, Package, RecoveryNote, RegistryDocuments, RegistryProvider,
    RegistryWarning, ResourceKind, StaticRegistryProvider,
};
pub use config::{ConflictPolicy, ManagerConfig};
pub use error::{ErrorKind, ManagerError, Result};
pub use host::{HostNodeType, HttpNodeTypeRegistry, NodeTypeRegistry, StaticNodeTypeRegistry};
pub use journal::{OperationRecord, OperationStatus};
pub use orchestrator::{ExecuteOptions, OperationRequest, Outcome, OutcomeError, OutcomeResult};
pub use reconcile::{Classification, Conflict, EntryState};

// Re-export builder and views from api module
pub use api::{CatalogItem, CatalogView, LocalStateSummary, NodeManagerBuilder, RegistrySummary};

use api::ManagerState;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Main entry point for catalog queries and install operations.
///
/// Cloning is cheap; clones share the same store, journal and in-flight
/// operations.
#[derive(Clone)]
pub struct NodeManager {
    state: Arc<ManagerState>,
}

impl NodeManager {
    /// Create a builder for NodeManager.
    pub fn builder(root: impl Into<PathBuf>) -> NodeManagerBuilder {
        NodeManagerBuilder::new(root)
    }

    /// Create a manager over an existing root with network-backed defaults.
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self> {
        NodeManagerBuilder::new(root).build().await
    }

    /// Root holding `custom_nodes/`, `models/` and the manager's state.
    pub fn root(&self) -> &Path {
        &self.state.config.root
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.state.config
    }
}
