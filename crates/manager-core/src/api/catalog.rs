//! Read-path methods on NodeManager: registry, local state, classification.

use crate::catalog::{CatalogEntry, EntryId, LocalSnapshot, RecoveryNote, RegistryWarning};
use crate::error::Result;
use crate::reconcile::{Classification, Reconciler};
use crate::NodeManager;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Result of a registry refresh.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrySummary {
    pub packages: usize,
    pub models: usize,
    pub warnings: Vec<RegistryWarning>,
    pub fetched_at: Option<DateTime<Utc>>,
}

/// Result of a local state refresh.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalStateSummary {
    pub records: usize,
    pub present_paths: usize,
    pub recovered: Vec<RecoveryNote>,
    pub dropped: Vec<EntryId>,
}

/// A registry entry together with its reconciled state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogItem {
    pub entry: CatalogEntry,
    pub classification: Classification,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogView {
    pub items: Vec<CatalogItem>,
    pub warnings: Vec<RegistryWarning>,
}

impl NodeManager {
    // ========================================
    // Registry & Local State
    // ========================================

    /// Re-fetch the registry. On failure the previous snapshot stays in use.
    pub async fn refresh_registry(&self) -> Result<RegistrySummary> {
        let snapshot = self.state.store.load_registry().await?;
        Ok(RegistrySummary {
            packages: snapshot.packages().count(),
            models: snapshot.models().count(),
            warnings: snapshot.warnings().to_vec(),
            fetched_at: snapshot.fetched_at(),
        })
    }

    /// Re-read local state from disk, recovering interrupted operations.
    pub async fn refresh_local_state(&self) -> Result<LocalStateSummary> {
        let local = self.state.store.load_local_state().await?;
        self.state.journal.record_recovered(local.recovered());
        Ok(LocalStateSummary {
            records: local.records().len(),
            present_paths: local.present().len(),
            recovered: local.recovered().to_vec(),
            dropped: local.dropped().to_vec(),
        })
    }

    /// The current local install snapshot.
    pub fn local_state(&self) -> Arc<LocalSnapshot> {
        self.state.store.local()
    }

    /// Warnings from the last registry load (skipped entries).
    pub fn registry_warnings(&self) -> Vec<RegistryWarning> {
        self.state
            .store
            .registry()
            .map(|r| r.warnings().to_vec())
            .unwrap_or_default()
    }

    // ========================================
    // Classification
    // ========================================

    /// Every registry entry with its state, in identity order.
    pub async fn catalog(&self) -> Result<CatalogView> {
        let registry = self.state.store.require_registry().await?;
        let host = self.state.host_types().await;
        let local = self.state.store.local();
        let reconciler = Reconciler::with_host_types(&registry, &local, &host);

        let items = registry
            .entries()
            .map(|entry| CatalogItem {
                classification: reconciler.classify_entry(entry),
                entry: entry.clone(),
            })
            .collect();

        Ok(CatalogView {
            items,
            warnings: registry.warnings().to_vec(),
        })
    }

    /// Classify one entry against the current snapshots.
    pub async fn classify(&self, id: &EntryId) -> Result<Classification> {
        let registry = self.state.store.require_registry().await?;
        let host = self.state.host_types().await;
        let local = self.state.store.local();
        Reconciler::with_host_types(&registry, &local, &host).classify(id)
    }
}
