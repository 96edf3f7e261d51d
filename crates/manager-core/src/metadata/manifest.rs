//! Install manifest and operation intent records.
//!
//! The manifest (`.manager/manifest.json`) is the persisted half of the local
//! install snapshot: what the manager itself installed, and where. Intents
//! (`.manager/intents/<operation id>.json`) describe a mutation in flight so
//! an interrupted one can be rolled back on the next load.

use crate::catalog::{EntryId, InstallType, NodePattern, OperationKind, ResourceKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

pub const MANIFEST_FORMAT_VERSION: u32 = 1;

/// What the manager knows about one installed entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalRecord {
    pub kind: ResourceKind,
    /// Registry version the entry was installed from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// SHA-256 of a single-file artifact, or the checked-out revision.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    /// Root-relative paths this entry wrote.
    pub files: Vec<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install_type: Option<InstallType>,
    /// Pattern in force when installed; the registry may change it later.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodename_pattern: Option<NodePattern>,
    pub installed_at: DateTime<Utc>,
    /// Byte size of a single-file artifact, verified on load.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

/// On-disk manifest document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    #[serde(default)]
    pub entries: BTreeMap<EntryId, LocalRecord>,
}

impl Default for Manifest {
    fn default() -> Self {
        Self {
            version: MANIFEST_FORMAT_VERSION,
            entries: BTreeMap::new(),
        }
    }
}

impl Manifest {
    pub fn from_entries(entries: BTreeMap<EntryId, LocalRecord>) -> Self {
        Self {
            version: MANIFEST_FORMAT_VERSION,
            entries,
        }
    }
}

/// How far a mutation got before the intent was last rewritten.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentPhase {
    /// Artifacts are being acquired into the staging area; live files untouched.
    Staging,
    /// Live files are being moved. The manifest decides which side won.
    Swapping,
    /// Manifest committed; only scratch directories remain.
    Committed,
}

/// Persisted description of an in-flight mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationIntent {
    pub operation_id: String,
    pub entry: EntryId,
    pub kind: OperationKind,
    pub phase: IntentPhase,
    /// Root-relative live paths the operation touches.
    pub targets: Vec<PathBuf>,
    pub staging_dir: PathBuf,
    pub backup_dir: PathBuf,
    pub trash_dir: PathBuf,
    #[serde(default)]
    pub previous_record: Option<LocalRecord>,
    #[serde(default)]
    pub committed_record: Option<LocalRecord>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> LocalRecord {
        LocalRecord {
            kind: ResourceKind::Model,
            version: Some("1.0".to_string()),
            hash: Some("ab".repeat(32)),
            files: vec![PathBuf::from("models/checkpoints/v1.safetensors")],
            install_type: None,
            nodename_pattern: None,
            installed_at: Utc::now(),
            size: Some(4),
        }
    }

    #[test]
    fn test_manifest_keys_are_identity_strings() {
        let mut entries = BTreeMap::new();
        entries.insert(EntryId::model("checkpoints", "v1.safetensors"), record());
        let manifest = Manifest::from_entries(entries);

        let json = serde_json::to_value(&manifest).unwrap();
        assert!(json["entries"]
            .get("model:checkpoints/v1.safetensors")
            .is_some());

        let back: Manifest = serde_json::from_value(json).unwrap();
        assert_eq!(back, manifest);
    }

    #[test]
    fn test_manifest_tolerates_missing_entries() {
        let manifest: Manifest = serde_json::from_str(r#"{"version": 1}"#).unwrap();
        assert!(manifest.entries.is_empty());
    }
}
