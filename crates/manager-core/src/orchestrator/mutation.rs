//! The disk side of an operation: staging, the swap, and the manifest commit.
//!
//! Order of events for install/update:
//! 1. intent written (phase `staging`), artifacts fetched into staging
//! 2. intent rewritten (phase `swapping`) with the record about to commit
//! 3. per target: live -> backup, staged -> live
//! 4. manifest commit, then scratch directories removed
//!
//! Uninstall skips staging and moves targets into the trash instead. A
//! failure before the commit rolls every target back; a failure of the commit
//! itself leaves the intent for recovery, which asks the manifest who won.

use super::{cancelled, Inner, RunContext};
use crate::acquire::{FetchReceipt, FetchRequest};
use crate::catalog::recovery::{move_path, remove_path, roll_back};
use crate::catalog::{Artifact, CatalogEntry};
use crate::config::Layout;
use crate::metadata::{IntentPhase, LocalRecord, OperationIntent};
use crate::{ManagerError, Result};
use chrono::Utc;
use std::path::{Path, PathBuf};
use tracing::{debug, error, warn};

impl Inner {
    /// Install or update: stage every artifact, then swap them in.
    pub(super) async fn replace(&self, ctx: &RunContext<'_>) -> Result<()> {
        let layout = self.store.layout().clone();
        let artifacts = entry_artifacts(ctx.entry)?;
        let targets: Vec<PathBuf> = artifacts.iter().map(|a| a.relative_path.clone()).collect();

        // Claim before reading ownership: a finished operation commits its
        // record before releasing its claim.
        let id = ctx.entry.id();
        let _claim = self.claim_paths(&id, &targets)?;
        let local = self.store.local();
        let owned: Vec<String> = targets
            .iter()
            .filter_map(|target| {
                local
                    .owner_other_than(&id, target)
                    .map(|owner| format!("{} (owned by {})", target.display(), owner))
            })
            .collect();
        if !owned.is_empty() {
            return Err(ManagerError::ConflictDetected {
                entry: id.to_string(),
                conflicts: owned,
            });
        }

        let mut intent = self.new_intent(ctx, &layout, targets, IntentPhase::Staging);
        self.begin(&intent)?;

        let receipts = match self.stage(ctx, &layout, &intent, &artifacts).await {
            Ok(receipts) => receipts,
            Err(e) => {
                self.abandon(&layout, &intent);
                return Err(e);
            }
        };
        if ctx.cancel.is_cancelled() {
            self.abandon(&layout, &intent);
            return Err(cancelled(&intent.entry));
        }

        let staging = layout.resolve(&intent.staging_dir);
        let record = build_record(ctx.entry, &artifacts, &receipts, &staging);
        intent.phase = IntentPhase::Swapping;
        intent.committed_record = Some(record.clone());
        if let Err(e) = self.store.write_intent(&intent) {
            self.abandon(&layout, &intent);
            return Err(e);
        }

        if let Err(e) = swap_in(&layout, &intent) {
            return Err(self.undo(&layout, &intent, e));
        }

        self.commit(&layout, &mut intent, Some(record)).await
    }

    /// Uninstall: park the entry's own paths in the trash, then commit.
    pub(super) async fn remove(&self, ctx: &RunContext<'_>) -> Result<()> {
        let layout = self.store.layout().clone();
        let artifacts = entry_artifacts(ctx.entry)?;
        let id = ctx.entry.id();
        let derived: Vec<PathBuf> = artifacts.into_iter().map(|a| a.relative_path).collect();

        let _claim = self.claim_paths(&id, &derived)?;
        let local = self.store.local();
        let record = local.record(&id);
        // Never another entry's files, whatever this entry derives.
        let targets: Vec<PathBuf> = derived
            .into_iter()
            .filter(|p| local.owner_other_than(&id, p).is_none())
            .filter(|p| match record {
                // Only paths the manager wrote and the entry still claims.
                Some(record) => record.files.contains(p),
                // Unmanaged installs: whatever the entry's paths resolve to on disk.
                None => layout.resolve(p).exists(),
            })
            .collect();
        debug!("Uninstalling {}: {} target(s)", id, targets.len());

        let mut intent = self.new_intent(ctx, &layout, targets, IntentPhase::Swapping);
        self.begin(&intent)?;

        if ctx.cancel.is_cancelled() {
            self.abandon(&layout, &intent);
            return Err(cancelled(&intent.entry));
        }

        if let Err(e) = move_to_trash(&layout, &intent) {
            return Err(self.undo(&layout, &intent, e));
        }

        self.commit(&layout, &mut intent, None).await
    }

    fn new_intent(
        &self,
        ctx: &RunContext<'_>,
        layout: &Layout,
        targets: Vec<PathBuf>,
        phase: IntentPhase,
    ) -> OperationIntent {
        let id = ctx.entry.id();
        OperationIntent {
            operation_id: ctx.operation_id.to_string(),
            previous_record: self.store.local().record(&id).cloned(),
            entry: id,
            kind: ctx.kind,
            phase,
            targets,
            staging_dir: root_relative(layout, &layout.staging_dir(ctx.operation_id)),
            backup_dir: root_relative(layout, &layout.backup_dir(ctx.operation_id)),
            trash_dir: root_relative(layout, &layout.trash_dir(ctx.operation_id)),
            committed_record: None,
            created_at: Utc::now(),
        }
    }

    fn begin(&self, intent: &OperationIntent) -> Result<()> {
        self.store.begin_intent(intent).inspect_err(|_| {
            self.store.finish_intent(&intent.operation_id);
        })
    }

    /// Fetch each artifact into the staging directory.
    async fn stage(
        &self,
        ctx: &RunContext<'_>,
        layout: &Layout,
        intent: &OperationIntent,
        artifacts: &[Artifact],
    ) -> Result<Vec<FetchReceipt>> {
        let staging = layout.resolve(&intent.staging_dir);
        let until = tokio::time::Instant::now() + ctx.deadline;
        let version = ctx.entry.version().map(String::from);
        let mut receipts = Vec::with_capacity(artifacts.len());

        for artifact in artifacts {
            ctx.cancel.check().map_err(|_| cancelled(&intent.entry))?;

            let dest = staging.join(&artifact.relative_path);
            let request = FetchRequest {
                entry: intent.entry.clone(),
                artifact: artifact.clone(),
                version: version.clone(),
            };

            let fetch = self.source.fetch(&request, &dest, ctx.cancel);
            let fetched = tokio::select! {
                fetched = tokio::time::timeout_at(until, fetch) => fetched,
                _ = ctx.cancel.cancelled() => return Err(cancelled(&intent.entry)),
            };
            let receipt = fetched.map_err(|_| ManagerError::OperationTimedOut {
                entry: intent.entry.to_string(),
                after: ctx.deadline,
            })??;

            if std::fs::symlink_metadata(&dest).is_err() {
                return Err(ManagerError::AcquisitionFailed {
                    url: artifact.source.clone(),
                    message: "source reported success but wrote nothing".to_string(),
                });
            }
            debug!("Staged {} ({} bytes)", artifact.relative_path.display(), receipt.bytes);
            receipts.push(receipt);
        }

        Ok(receipts)
    }

    /// Commit the manifest change and clear scratch space.
    async fn commit(
        &self,
        layout: &Layout,
        intent: &mut OperationIntent,
        record: Option<LocalRecord>,
    ) -> Result<()> {
        if let Err(e) = self.store.apply_local_change(&intent.entry, record).await {
            // The manifest may or may not have been written; recovery decides.
            error!(
                "Commit of {} for {} failed, leaving intent {} for recovery: {}",
                intent.kind, intent.entry, intent.operation_id, e
            );
            self.store.release_intent(&intent.operation_id);
            return Err(e);
        }

        intent.phase = IntentPhase::Committed;
        if let Err(e) = self.store.write_intent(intent) {
            warn!("Failed to mark intent {} committed: {}", intent.operation_id, e);
        }
        self.abandon(layout, intent);
        Ok(())
    }

    /// Roll back a failed swap. Returns the error to report.
    fn undo(&self, layout: &Layout, intent: &OperationIntent, cause: ManagerError) -> ManagerError {
        match roll_back(layout, intent) {
            Ok(()) => {
                debug!("Rolled back {} of {}", intent.kind, intent.entry);
                self.abandon(layout, intent);
            }
            Err(e) => {
                error!(
                    "Rollback of {} for {} failed, leaving intent {} for recovery: {}",
                    intent.kind, intent.entry, intent.operation_id, e
                );
                self.store.release_intent(&intent.operation_id);
            }
        }
        cause
    }

    /// Remove scratch directories and the intent.
    fn abandon(&self, layout: &Layout, intent: &OperationIntent) {
        for dir in [&intent.staging_dir, &intent.backup_dir, &intent.trash_dir] {
            if let Err(e) = remove_path(&layout.resolve(dir)) {
                warn!("Failed to clean up {}: {}", dir.display(), e);
            }
        }
        self.store.finish_intent(&intent.operation_id);
    }
}

fn entry_artifacts(entry: &CatalogEntry) -> Result<Vec<Artifact>> {
    entry
        .artifacts()
        .map_err(|message| ManagerError::RegistryMalformed { message })
}

/// Per target: park the live copy in the backup area, then move the staged
/// copy in.
fn swap_in(layout: &Layout, intent: &OperationIntent) -> Result<()> {
    let staging = layout.resolve(&intent.staging_dir);
    let backup = layout.resolve(&intent.backup_dir);

    for target in &intent.targets {
        let live = layout.resolve(target);
        if std::fs::symlink_metadata(&live).is_ok() {
            move_path(&live, &backup.join(target))?;
        }
        move_path(&staging.join(target), &live)?;
    }
    Ok(())
}

fn move_to_trash(layout: &Layout, intent: &OperationIntent) -> Result<()> {
    let trash = layout.resolve(&intent.trash_dir);
    for target in &intent.targets {
        let live = layout.resolve(target);
        if std::fs::symlink_metadata(&live).is_ok() {
            move_path(&live, &trash.join(target))?;
        }
    }
    Ok(())
}

fn build_record(
    entry: &CatalogEntry,
    artifacts: &[Artifact],
    receipts: &[FetchReceipt],
    staging: &Path,
) -> LocalRecord {
    let (hash, size) = match (artifacts, receipts) {
        ([artifact], [receipt]) => {
            let size = std::fs::metadata(staging.join(&artifact.relative_path))
                .ok()
                .filter(|m| m.is_file())
                .map(|m| m.len());
            (receipt.sha256.clone().or_else(|| receipt.revision.clone()), size)
        }
        _ => (None, None),
    };

    LocalRecord {
        kind: entry.id().resource_kind(),
        version: entry.version().map(String::from),
        hash,
        files: artifacts.iter().map(|a| a.relative_path.clone()).collect(),
        install_type: entry.as_package().map(|p| p.install_type),
        nodename_pattern: entry.nodename_pattern().cloned(),
        installed_at: Utc::now(),
        size,
    }
}

fn root_relative(layout: &Layout, path: &Path) -> PathBuf {
    path.strip_prefix(layout.root())
        .map(Path::to_path_buf)
        .unwrap_or_else(|_| path.to_path_buf())
}
