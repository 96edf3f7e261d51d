//! Rollback of operations interrupted mid-mutation.
//!
//! Every mutation persists an [`OperationIntent`] before touching live files.
//! The swap of each target is two renames: live to backup (or trash), then
//! staged to live. The manifest is the commit point. Given an intent left on
//! disk, the manifest tells whether the operation committed; if it did, only
//! scratch directories are cleared, otherwise each target is put back.

use crate::catalog::{EntryId, OperationKind, RecoveryNote};
use crate::config::Layout;
use crate::metadata::{atomic_read_json, IntentPhase, LocalRecord, OperationIntent};
use crate::{ManagerError, Result};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Load all intent files, skipping those whose operation is still running
/// in this process.
pub(crate) fn pending_intents(
    layout: &Layout,
    active: &HashSet<String>,
) -> Result<Vec<(PathBuf, OperationIntent)>> {
    let dir = layout.intents_dir();
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut intents = Vec::new();
    let entries = std::fs::read_dir(&dir).map_err(|e| ManagerError::filesystem(e, &dir))?;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        match atomic_read_json::<OperationIntent>(&path) {
            Ok(Some(intent)) if active.contains(&intent.operation_id) => {}
            Ok(Some(intent)) => intents.push((path, intent)),
            Ok(None) => {}
            Err(e) => {
                // Unreadable intent: nothing can be inferred, only discard it.
                warn!("Discarding unreadable intent {}: {}", path.display(), e);
                let _ = std::fs::remove_file(&path);
            }
        }
    }
    intents.sort_by(|a, b| a.1.created_at.cmp(&b.1.created_at));
    Ok(intents)
}

/// Resolve one leftover intent against the manifest entries and remove it.
pub(crate) fn recover_intent(
    layout: &Layout,
    intent_path: &Path,
    intent: &OperationIntent,
    entries: &BTreeMap<EntryId, LocalRecord>,
) -> Result<RecoveryNote> {
    let committed = entries.get(&intent.entry).cloned() == intent.committed_record
        && intent.committed_record != intent.previous_record;

    let message = match intent.phase {
        IntentPhase::Staging => {
            format!("discarded staged artifacts of interrupted {}", intent.kind)
        }
        IntentPhase::Committed => format!("finished cleanup of committed {}", intent.kind),
        IntentPhase::Swapping if committed => {
            format!("interrupted {} had committed; cleaned up", intent.kind)
        }
        IntentPhase::Swapping => {
            roll_back(layout, intent)?;
            format!("rolled back interrupted {}", intent.kind)
        }
    };

    for dir in [&intent.staging_dir, &intent.backup_dir, &intent.trash_dir] {
        remove_path(&layout.resolve(dir))?;
    }
    std::fs::remove_file(intent_path).map_err(|e| ManagerError::filesystem(e, intent_path))?;

    info!("Recovered operation {} on {}: {}", intent.operation_id, intent.entry, message);
    Ok(RecoveryNote {
        entry: Some(intent.entry.clone()),
        operation_id: Some(intent.operation_id.clone()),
        kind: Some(intent.kind),
        message,
    })
}

/// Put every target back the way it was before the intent's swap began.
pub(crate) fn roll_back(layout: &Layout, intent: &OperationIntent) -> Result<()> {
    let staging = layout.resolve(&intent.staging_dir);
    let backup = layout.resolve(&intent.backup_dir);
    let trash = layout.resolve(&intent.trash_dir);

    for target in &intent.targets {
        let live = layout.resolve(target);
        match intent.kind {
            OperationKind::Install | OperationKind::Update => {
                let parked = backup.join(target);
                // A staged copy still in place means this target was never swapped.
                if !staging.join(target).exists() {
                    remove_path(&live)?;
                }
                if parked.exists() {
                    remove_path(&live)?;
                    move_path(&parked, &live)?;
                }
            }
            OperationKind::Uninstall => {
                let parked = trash.join(target);
                if parked.exists() {
                    remove_path(&live)?;
                    move_path(&parked, &live)?;
                }
            }
        }
    }
    Ok(())
}

/// Rename `from` to `to`, creating the destination's parent.
pub(crate) fn move_path(from: &Path, to: &Path) -> Result<()> {
    if let Some(parent) = to.parent() {
        std::fs::create_dir_all(parent).map_err(|e| ManagerError::filesystem(e, parent))?;
    }
    std::fs::rename(from, to).map_err(|e| ManagerError::filesystem(e, from))
}

/// Remove a file or directory tree; absent paths are fine.
pub(crate) fn remove_path(path: &Path) -> Result<()> {
    let metadata = match std::fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(ManagerError::filesystem(e, path)),
    };
    let result = if metadata.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    };
    result.map_err(|e| ManagerError::filesystem(e, path))
}
