//! Reconciliation of registry entries against the local install snapshot.
//!
//! Everything here is pure: the same snapshots always produce the same
//! classifications, and nothing touches the filesystem or network.

mod classify;
mod conflict;

pub use conflict::Conflict;

use crate::catalog::{CatalogEntry, EntryId, LocalSnapshot, NodePattern, Package, RegistrySnapshot};
use crate::host::HostNodeType;
use crate::{ManagerError, Result};
use conflict::{owned_dirs, ConflictDetector, InstalledPattern};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Install state of a catalog entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    NotInstalled,
    InstalledCurrent,
    UpdateAvailable,
    InstalledUnmanaged,
    Conflicted,
}

impl EntryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryState::NotInstalled => "not_installed",
            EntryState::InstalledCurrent => "installed_current",
            EntryState::UpdateAvailable => "update_available",
            EntryState::InstalledUnmanaged => "installed_unmanaged",
            EntryState::Conflicted => "conflicted",
        }
    }

    pub fn is_installed(&self) -> bool {
        !matches!(self, EntryState::NotInstalled)
    }
}

impl fmt::Display for EntryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reconciliation result for one entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub entry: EntryId,
    pub state: EntryState,
    /// The version-based state before conflicts are considered.
    pub base_state: EntryState,
    /// For installed packages, what makes them `conflicted`; for packages
    /// not yet installed, what an install would collide with.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflicts: Vec<Conflict>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry_version: Option<String>,
}

/// Classifies entries of one registry snapshot against one local snapshot.
pub struct Reconciler<'a> {
    registry: &'a RegistrySnapshot,
    local: &'a LocalSnapshot,
    detector: ConflictDetector,
}

impl<'a> Reconciler<'a> {
    pub fn new(registry: &'a RegistrySnapshot, local: &'a LocalSnapshot) -> Self {
        Self::with_host_types(registry, local, &[])
    }

    /// Also cross-check patterns against node types the host has loaded.
    pub fn with_host_types(
        registry: &'a RegistrySnapshot,
        local: &'a LocalSnapshot,
        host: &[HostNodeType],
    ) -> Self {
        let mut installed = Vec::new();
        let mut owners = HashMap::new();

        for package in registry.packages() {
            let id = package.id();
            for dir in owned_dirs(package) {
                owners.entry(dir).or_insert_with(|| id.clone());
            }
            let entry = CatalogEntry::Package(package.clone());
            if classify::base_state(&entry, local).is_installed() {
                if let Some(pattern) = effective_pattern(package, local) {
                    installed.push(InstalledPattern {
                        id,
                        pattern: pattern.clone(),
                    });
                }
            }
        }

        Self {
            registry,
            local,
            detector: ConflictDetector::new(installed, owners, host.to_vec()),
        }
    }

    /// Classify one entry by identity.
    pub fn classify(&self, id: &EntryId) -> Result<Classification> {
        let entry = self
            .registry
            .get(id)
            .ok_or_else(|| ManagerError::EntryNotFound {
                entry: id.to_string(),
            })?;
        Ok(self.classify_entry(entry))
    }

    pub fn classify_entry(&self, entry: &CatalogEntry) -> Classification {
        let id = entry.id();
        let base_state = classify::base_state(entry, self.local);

        let conflicts = match entry {
            CatalogEntry::Package(package) => self
                .detector
                .detect(&id, effective_pattern(package, self.local)),
            CatalogEntry::Model(_) => Vec::new(),
        };

        let state = if base_state.is_installed() && !conflicts.is_empty() {
            EntryState::Conflicted
        } else {
            base_state
        };

        Classification {
            local_version: self
                .local
                .record(&id)
                .and_then(|r| r.version.clone()),
            registry_version: entry.version().map(String::from),
            entry: id,
            state,
            base_state,
            conflicts,
        }
    }

    /// Classify every registry entry, in identity order.
    pub fn reconcile(&self) -> Vec<Classification> {
        self.registry
            .entries()
            .map(|entry| self.classify_entry(entry))
            .collect()
    }

    /// Conflicts the package would have after switching to `pattern`.
    pub fn conflicts_for_pattern(
        &self,
        package: &Package,
        pattern: Option<&NodePattern>,
    ) -> Vec<Conflict> {
        self.detector.detect(&package.id(), pattern)
    }
}

/// Pattern in force for a package: what was recorded at install time, else
/// what the registry publishes now.
fn effective_pattern<'p>(
    package: &'p Package,
    local: &'p LocalSnapshot,
) -> Option<&'p NodePattern> {
    local
        .record(&package.id())
        .and_then(|r| r.nodename_pattern.as_ref())
        .or(package.nodename_pattern.as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{InstallType, RegistryDocuments, ResourceKind};
    use crate::metadata::LocalRecord;
    use chrono::Utc;
    use serde_json::json;
    use std::collections::{BTreeMap, BTreeSet};
    use std::path::PathBuf;

    fn registry() -> RegistrySnapshot {
        RegistrySnapshot::from_documents(RegistryDocuments {
            custom_nodes: vec![
                json!({
                    "title": "P1", "reference": "https://github.com/x/P1",
                    "files": ["https://github.com/x/P1"], "install_type": "git-clone",
                    "nodename_pattern": "foo.*", "version": "1.0"
                }),
                json!({
                    "title": "P2", "reference": "https://github.com/x/P2",
                    "files": ["https://github.com/x/P2"], "install_type": "git-clone",
                    "nodename_pattern": "foo.bar", "version": "1.0"
                }),
                json!({
                    "title": "P3", "reference": "https://github.com/x/P3",
                    "files": ["https://github.com/x/P3"], "install_type": "git-clone"
                }),
            ],
            models: vec![json!({
                "name": "v1", "type": "checkpoint", "save_path": "checkpoints",
                "filename": "v1.safetensors", "url": "https://example.com/v1.safetensors"
            })],
        })
        .unwrap()
    }

    fn record(path: &str, version: Option<&str>) -> LocalRecord {
        LocalRecord {
            kind: ResourceKind::Package,
            version: version.map(String::from),
            hash: None,
            files: vec![PathBuf::from(path)],
            install_type: Some(InstallType::SourceCheckout),
            nodename_pattern: None,
            installed_at: Utc::now(),
            size: None,
        }
    }

    fn local(installed: &[(&str, &str, Option<&str>)]) -> LocalSnapshot {
        let mut records = BTreeMap::new();
        let mut present = BTreeSet::new();
        for (reference, path, version) in installed {
            records.insert(EntryId::package(*reference), record(path, *version));
            present.insert(PathBuf::from(path));
        }
        LocalSnapshot::new(records, present)
    }

    #[test]
    fn test_everything_absent_is_not_installed() {
        let registry = registry();
        let local = LocalSnapshot::empty();
        let results = Reconciler::new(&registry, &local).reconcile();
        assert_eq!(results.len(), 4);
        assert!(results.iter().all(|c| c.state == EntryState::NotInstalled));
    }

    #[test]
    fn test_overlapping_installed_packages_are_conflicted() {
        let registry = registry();
        let local = local(&[
            ("https://github.com/x/P1", "custom_nodes/P1", Some("1.0")),
            ("https://github.com/x/P2", "custom_nodes/P2", Some("1.0")),
        ]);
        let reconciler = Reconciler::new(&registry, &local);

        let p1 = reconciler.classify(&EntryId::package("https://github.com/x/P1")).unwrap();
        let p2 = reconciler.classify(&EntryId::package("https://github.com/x/P2")).unwrap();
        assert_eq!(p1.state, EntryState::Conflicted);
        assert_eq!(p1.base_state, EntryState::InstalledCurrent);
        assert_eq!(
            p1.conflicts,
            vec![Conflict::Package { entry: EntryId::package("https://github.com/x/P2") }]
        );
        assert_eq!(p2.state, EntryState::Conflicted);
        assert_eq!(
            p2.conflicts,
            vec![Conflict::Package { entry: EntryId::package("https://github.com/x/P1") }]
        );
    }

    #[test]
    fn test_prospective_conflicts_do_not_change_state() {
        let registry = registry();
        let local = local(&[("https://github.com/x/P1", "custom_nodes/P1", Some("1.0"))]);
        let p2 = Reconciler::new(&registry, &local)
            .classify(&EntryId::package("https://github.com/x/P2"))
            .unwrap();
        assert_eq!(p2.state, EntryState::NotInstalled);
        assert_eq!(p2.conflicts.len(), 1);
    }

    #[test]
    fn test_unmanaged_and_update_states() {
        let registry = registry();
        let mut snapshot = local(&[("https://github.com/x/P1", "custom_nodes/P1", Some("0.9"))]);
        let mut present = snapshot.present().clone();
        present.insert(PathBuf::from("custom_nodes/P3"));
        snapshot = snapshot.with_present(present);

        let reconciler = Reconciler::new(&registry, &snapshot);
        let p1 = reconciler.classify(&EntryId::package("https://github.com/x/P1")).unwrap();
        let p3 = reconciler.classify(&EntryId::package("https://github.com/x/P3")).unwrap();
        assert_eq!(p1.state, EntryState::UpdateAvailable);
        assert_eq!(p3.state, EntryState::InstalledUnmanaged);
    }

    #[test]
    fn test_classification_is_deterministic() {
        let registry = registry();
        let local = local(&[
            ("https://github.com/x/P1", "custom_nodes/P1", Some("1.0")),
            ("https://github.com/x/P2", "custom_nodes/P2", None),
        ]);
        let first = Reconciler::new(&registry, &local).reconcile();
        let second = Reconciler::new(&registry, &local).reconcile();
        assert_eq!(first, second);
    }

    #[test]
    fn test_unknown_entry_is_not_found() {
        let registry = registry();
        let local = LocalSnapshot::empty();
        let err = Reconciler::new(&registry, &local)
            .classify(&EntryId::package("https://github.com/x/none"))
            .unwrap_err();
        assert!(matches!(err, ManagerError::EntryNotFound { .. }));
    }
}
