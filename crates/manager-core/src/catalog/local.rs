//! Local install snapshot: manifest records verified against disk, plus the
//! set of paths found under the node and model directories.

use crate::catalog::{EntryId, OperationKind};
use crate::config::{Layout, NetworkConfig, PathsConfig};
use crate::metadata::LocalRecord;
use crate::{ManagerError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// An interrupted operation that was rolled back or completed during load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryNote {
    pub entry: Option<EntryId>,
    pub operation_id: Option<String>,
    pub kind: Option<OperationKind>,
    pub message: String,
}

impl RecoveryNote {
    /// The note as the error a caller inspecting recovery would see.
    pub fn to_error(&self) -> ManagerError {
        ManagerError::PartialWriteRecovered {
            entry: self
                .entry
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_else(|| "manifest".to_string()),
            message: self.message.clone(),
        }
    }
}

/// Immutable view of what is installed locally.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LocalSnapshot {
    records: BTreeMap<EntryId, LocalRecord>,
    present: BTreeSet<PathBuf>,
    recovered: Vec<RecoveryNote>,
    dropped: Vec<EntryId>,
}

impl LocalSnapshot {
    pub fn new(records: BTreeMap<EntryId, LocalRecord>, present: BTreeSet<PathBuf>) -> Self {
        Self {
            records,
            present,
            recovered: Vec::new(),
            dropped: Vec::new(),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn records(&self) -> &BTreeMap<EntryId, LocalRecord> {
        &self.records
    }

    pub fn record(&self, id: &EntryId) -> Option<&LocalRecord> {
        self.records.get(id)
    }

    /// Root-relative paths found on disk at load time.
    pub fn present(&self) -> &BTreeSet<PathBuf> {
        &self.present
    }

    pub fn is_present(&self, relative: &Path) -> bool {
        self.present.contains(relative)
    }

    /// True when every path exists on disk (and there is at least one).
    pub fn all_present<'a>(&self, mut paths: impl Iterator<Item = &'a Path>) -> bool {
        let mut any = false;
        let all = paths.all(|p| {
            any = true;
            self.is_present(p)
        });
        any && all
    }

    /// The entry, other than `id`, whose record covers `relative`. Paths
    /// overlap when one equals or contains the other.
    pub fn owner_other_than(&self, id: &EntryId, relative: &Path) -> Option<&EntryId> {
        self.records.iter().find_map(|(owner, record)| {
            let covers = owner != id && record.files.iter().any(|f| paths_overlap(f, relative));
            covers.then_some(owner)
        })
    }

    /// Operations recovered while this snapshot was loaded.
    pub fn recovered(&self) -> &[RecoveryNote] {
        &self.recovered
    }

    /// Manifest records discarded because their files were gone or changed.
    pub fn dropped(&self) -> &[EntryId] {
        &self.dropped
    }

    /// Copy of this snapshot with one record set or removed.
    pub fn with_record(&self, id: &EntryId, record: Option<LocalRecord>) -> Self {
        let mut next = self.clone();
        match record {
            Some(record) => {
                next.records.insert(id.clone(), record);
            }
            None => {
                next.records.remove(id);
            }
        }
        next
    }

    pub(crate) fn with_present(mut self, present: BTreeSet<PathBuf>) -> Self {
        self.present = present;
        self
    }

    pub(crate) fn with_notes(
        mut self,
        recovered: Vec<RecoveryNote>,
        dropped: Vec<EntryId>,
    ) -> Self {
        self.recovered = recovered;
        self.dropped = dropped;
        self
    }

    pub(crate) fn into_records(self) -> BTreeMap<EntryId, LocalRecord> {
        self.records
    }
}

/// Collect the root-relative paths an install could own.
///
/// Under `custom_nodes/` that is each top-level entry; under `models/` every
/// regular file at any depth. Hidden names and in-progress downloads are
/// ignored.
pub(crate) fn scan_present(layout: &Layout) -> Result<BTreeSet<PathBuf>> {
    let mut present = BTreeSet::new();

    let nodes_dir = layout.custom_nodes_dir();
    if nodes_dir.is_dir() {
        let entries =
            std::fs::read_dir(&nodes_dir).map_err(|e| ManagerError::filesystem(e, &nodes_dir))?;
        for entry in entries.flatten() {
            let name = entry.file_name();
            if is_scannable(&name.to_string_lossy()) {
                present.insert(PathBuf::from(PathsConfig::CUSTOM_NODES_DIR_NAME).join(name));
            }
        }
    }

    let models_dir = layout.models_dir();
    if models_dir.is_dir() {
        for entry in WalkDir::new(&models_dir)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || is_scannable(&e.file_name().to_string_lossy()))
        {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Skipping unreadable path under {}: {}", models_dir.display(), e);
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            if let Ok(relative) = entry.path().strip_prefix(layout.root()) {
                present.insert(relative.to_path_buf());
            }
        }
    }

    debug!("Scanned {} present paths", present.len());
    Ok(present)
}

/// Keep only records whose files still exist (and match the recorded size).
pub(crate) fn verify_records(
    layout: &Layout,
    records: BTreeMap<EntryId, LocalRecord>,
) -> (BTreeMap<EntryId, LocalRecord>, Vec<EntryId>) {
    let mut kept = BTreeMap::new();
    let mut dropped = Vec::new();

    for (id, record) in records {
        match verify_record(layout, &record) {
            Ok(()) => {
                kept.insert(id, record);
            }
            Err(reason) => {
                warn!("Dropping stale record for {}: {}", id, reason);
                dropped.push(id);
            }
        }
    }

    (kept, dropped)
}

fn verify_record(layout: &Layout, record: &LocalRecord) -> std::result::Result<(), String> {
    if record.files.is_empty() {
        return Err("record lists no files".to_string());
    }
    for relative in &record.files {
        let path = layout.resolve(relative);
        let metadata = std::fs::symlink_metadata(&path)
            .map_err(|_| format!("{} is missing", relative.display()))?;
        if let (Some(expected), true) = (record.size, record.files.len() == 1) {
            if metadata.is_file() && metadata.len() != expected {
                return Err(format!(
                    "{} is {} bytes, recorded {}",
                    relative.display(),
                    metadata.len(),
                    expected
                ));
            }
        }
    }
    Ok(())
}

/// True when one root-relative path equals or contains the other.
pub(crate) fn paths_overlap(a: &Path, b: &Path) -> bool {
    a.starts_with(b) || b.starts_with(a)
}

fn is_scannable(name: &str) -> bool {
    !name.starts_with('.')
        && !name.ends_with(NetworkConfig::DOWNLOAD_TEMP_SUFFIX)
        && name != "__pycache__"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ResourceKind;
    use chrono::Utc;
    use tempfile::TempDir;

    fn model_record(path: &str, size: Option<u64>) -> LocalRecord {
        LocalRecord {
            kind: ResourceKind::Model,
            version: None,
            hash: None,
            files: vec![PathBuf::from(path)],
            install_type: None,
            nodename_pattern: None,
            installed_at: Utc::now(),
            size,
        }
    }

    #[test]
    fn test_scan_finds_nodes_and_model_files() {
        let dir = TempDir::new().unwrap();
        let layout = Layout::new(dir.path());
        std::fs::create_dir_all(layout.custom_nodes_dir().join("ComfyUI-Foo")).unwrap();
        std::fs::write(layout.custom_nodes_dir().join("single.py"), "x").unwrap();
        std::fs::create_dir_all(layout.custom_nodes_dir().join(".git")).unwrap();
        std::fs::create_dir_all(layout.models_dir().join("checkpoints")).unwrap();
        std::fs::write(layout.models_dir().join("checkpoints/v1.safetensors"), "abc").unwrap();
        std::fs::write(layout.models_dir().join("checkpoints/v2.safetensors.part"), "a").unwrap();

        let present = scan_present(&layout).unwrap();
        assert!(present.contains(Path::new("custom_nodes/ComfyUI-Foo")));
        assert!(present.contains(Path::new("custom_nodes/single.py")));
        assert!(present.contains(Path::new("models/checkpoints/v1.safetensors")));
        assert!(!present.contains(Path::new("custom_nodes/.git")));
        assert_eq!(present.len(), 3);
    }

    #[test]
    fn test_scan_of_empty_root_is_empty() {
        let dir = TempDir::new().unwrap();
        assert!(scan_present(&Layout::new(dir.path())).unwrap().is_empty());
    }

    #[test]
    fn test_verify_drops_missing_and_resized_files() {
        let dir = TempDir::new().unwrap();
        let layout = Layout::new(dir.path());
        std::fs::create_dir_all(layout.models_dir().join("checkpoints")).unwrap();
        std::fs::write(layout.models_dir().join("checkpoints/a.safetensors"), "abcd").unwrap();
        std::fs::write(layout.models_dir().join("checkpoints/b.safetensors"), "abcd").unwrap();

        let mut records = BTreeMap::new();
        let ok = EntryId::model("checkpoints", "a.safetensors");
        let resized = EntryId::model("checkpoints", "b.safetensors");
        let missing = EntryId::model("checkpoints", "c.safetensors");
        records.insert(ok.clone(), model_record("models/checkpoints/a.safetensors", Some(4)));
        records.insert(resized.clone(), model_record("models/checkpoints/b.safetensors", Some(9)));
        records.insert(missing.clone(), model_record("models/checkpoints/c.safetensors", None));

        let (kept, dropped) = verify_records(&layout, records);
        assert!(kept.contains_key(&ok));
        assert_eq!(kept.len(), 1);
        assert!(dropped.contains(&resized));
        assert!(dropped.contains(&missing));
    }

    #[test]
    fn test_owner_other_than_matches_overlapping_paths() {
        let owner = EntryId::package("https://github.com/alice/Utils");
        let mut record = model_record("custom_nodes/Utils", None);
        record.kind = ResourceKind::Package;
        let snapshot = LocalSnapshot::new(
            [(owner.clone(), record)].into_iter().collect(),
            BTreeSet::new(),
        );
        let fork = EntryId::package("https://github.com/bob/Utils");

        assert_eq!(snapshot.owner_other_than(&fork, Path::new("custom_nodes/Utils")), Some(&owner));
        assert_eq!(
            snapshot.owner_other_than(&fork, Path::new("custom_nodes/Utils/nodes.py")),
            Some(&owner)
        );
        assert_eq!(snapshot.owner_other_than(&fork, Path::new("custom_nodes/Utils2")), None);
        assert_eq!(snapshot.owner_other_than(&owner, Path::new("custom_nodes/Utils")), None);
    }

    #[test]
    fn test_all_present_requires_at_least_one_path() {
        let snapshot = LocalSnapshot::new(
            BTreeMap::new(),
            [PathBuf::from("custom_nodes/a")].into_iter().collect(),
        );
        assert!(snapshot.all_present([Path::new("custom_nodes/a")].into_iter()));
        assert!(!snapshot.all_present(std::iter::empty()));
        assert!(!snapshot.all_present(
            [Path::new("custom_nodes/a"), Path::new("custom_nodes/b")].into_iter()
        ));
    }
}
