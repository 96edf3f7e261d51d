//! Installation orchestrator: install, update and uninstall with coalescing,
//! bounded concurrency and crash-safe swaps.
//!
//! Every call goes through the [`OperationJournal`]. The first caller for a
//! `(kind, entry)` key spawns the operation; later callers join it and all of
//! them receive the same [`Outcome`]. The spawned task runs to completion even
//! if every caller stops waiting, so cleanup is never skipped.

mod mutation;
mod outcome;

pub use outcome::{ExecuteOptions, OperationRequest, Outcome, OutcomeError, OutcomeResult};

use crate::acquire::ArtifactSource;
use crate::cancel::CancellationToken;
use crate::catalog::{paths_overlap, CatalogEntry, CatalogStore, EntryId, OperationKind};
use crate::config::ConflictPolicy;
use crate::host::{HostNodeType, NodeTypeRegistry};
use crate::journal::{OperationJournal, OperationKey};
use crate::reconcile::{Classification, Conflict, EntryState, Reconciler};
use crate::{ManagerError, Result};
use futures::future::join_all;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tracing::{error, info, warn};

/// Settings the orchestrator needs from the manager configuration.
#[derive(Debug, Clone)]
pub struct InstallerSettings {
    pub max_concurrent_operations: usize,
    pub conflict_policy: ConflictPolicy,
    pub acquisition_timeout: Duration,
}

/// Executes mutating operations. Cheap to clone.
#[derive(Clone)]
pub struct Installer {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<CatalogStore>,
    journal: Arc<OperationJournal>,
    source: Arc<dyn ArtifactSource>,
    host: Arc<dyn NodeTypeRegistry>,
    permits: Semaphore,
    entry_locks: StdMutex<HashMap<EntryId, Arc<Mutex<()>>>>,
    /// Root-relative paths that in-flight operations are writing or removing.
    path_claims: StdMutex<Vec<(EntryId, PathBuf)>>,
    settings: InstallerSettings,
}

/// Releases an entry's path claims when the operation is done with disk.
struct PathClaim<'a> {
    claims: &'a StdMutex<Vec<(EntryId, PathBuf)>>,
    entry: EntryId,
}

impl Drop for PathClaim<'_> {
    fn drop(&mut self) {
        self.claims
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(owner, _)| *owner != self.entry);
    }
}

/// Per-run context shared by the mutation steps.
struct RunContext<'a> {
    operation_id: &'a str,
    kind: OperationKind,
    entry: &'a CatalogEntry,
    cancel: &'a CancellationToken,
    deadline: Duration,
}

impl Installer {
    pub fn new(
        store: Arc<CatalogStore>,
        journal: Arc<OperationJournal>,
        source: Arc<dyn ArtifactSource>,
        host: Arc<dyn NodeTypeRegistry>,
        settings: InstallerSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                journal,
                source,
                host,
                permits: Semaphore::new(settings.max_concurrent_operations.max(1)),
                entry_locks: StdMutex::new(HashMap::new()),
                path_claims: StdMutex::new(Vec::new()),
                settings,
            }),
        }
    }

    /// Run `kind` on `entry`, or join the identical operation already running.
    pub async fn execute(&self, kind: OperationKind, entry: EntryId) -> Outcome {
        self.execute_with(kind, entry, ExecuteOptions::default()).await
    }

    pub async fn execute_with(
        &self,
        kind: OperationKind,
        entry: EntryId,
        options: ExecuteOptions,
    ) -> Outcome {
        let key = OperationKey::new(kind, entry);
        let (is_new, handle) = self.inner.journal.begin_or_join(key.clone());

        if is_new {
            let inner = self.inner.clone();
            let cancel = handle.cancel_token().clone();
            let operation_id = handle.operation_id.clone();
            tokio::spawn(async move {
                let outcome = inner.run(&key, &operation_id, &cancel, &options).await;
                inner.journal.complete(&key, outcome);
            });
        }

        handle.wait().await
    }

    /// Run several operations in parallel. One failing never stops the
    /// others; outcomes come back in request order. `options` applies to
    /// every operation the batch starts.
    pub async fn execute_batch(
        &self,
        requests: Vec<OperationRequest>,
        options: ExecuteOptions,
    ) -> Vec<Outcome> {
        join_all(requests.into_iter().map(|request| {
            self.execute_with(request.kind, request.entry, options.clone())
        }))
        .await
    }

    /// Request cancellation of the live operation for `(kind, entry)`.
    pub fn cancel(&self, kind: OperationKind, entry: EntryId) -> bool {
        self.inner.journal.cancel(&OperationKey::new(kind, entry))
    }
}

impl Inner {
    async fn run(
        &self,
        key: &OperationKey,
        operation_id: &str,
        cancel: &CancellationToken,
        options: &ExecuteOptions,
    ) -> Outcome {
        let mut warnings = Vec::new();
        let result = self
            .perform(key, operation_id, cancel, options, &mut warnings)
            .await;

        let result = match result {
            Ok(classification) => {
                info!("{} of {} succeeded: {}", key.kind, key.entry, classification.state);
                OutcomeResult::Success { classification }
            }
            Err(e) => {
                error!("{} of {} failed: {}", key.kind, key.entry, e);
                OutcomeResult::Failure {
                    error: OutcomeError::from(&e),
                }
            }
        };

        Outcome {
            operation_id: operation_id.to_string(),
            entry: key.entry.clone(),
            kind: key.kind,
            result,
            warnings,
        }
    }

    async fn perform(
        &self,
        key: &OperationKey,
        operation_id: &str,
        cancel: &CancellationToken,
        options: &ExecuteOptions,
        warnings: &mut Vec<String>,
    ) -> Result<Classification> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| ManagerError::Other("operation semaphore closed".to_string()))?;
        let entry_lock = self.entry_lock(&key.entry);
        let _entry_guard = entry_lock.lock().await;

        cancel.check().map_err(|_| cancelled(&key.entry))?;
        self.journal.mark_running(key);
        info!("Starting {} of {} ({})", key.kind, key.entry, operation_id);

        let registry = self.store.require_registry().await?;
        let entry = registry
            .get(&key.entry)
            .cloned()
            .ok_or_else(|| ManagerError::EntryNotFound {
                entry: key.entry.to_string(),
            })?;
        let host = self.host_types(warnings).await;

        // Preconditions are checked against the local state as it is now,
        // after any other operation on this entry has released the lock.
        {
            let local = self.store.local();
            let reconciler = Reconciler::with_host_types(&registry, &local, &host);
            let current = reconciler.classify_entry(&entry);
            check_transition(key.kind, &current)?;

            if key.kind != OperationKind::Uninstall {
                let introduced = introduced_conflicts(key.kind, &reconciler, &entry, &current);
                self.apply_conflict_policy(&key.entry, &introduced, warnings)?;
            }
        }

        let ctx = RunContext {
            operation_id,
            kind: key.kind,
            entry: &entry,
            cancel,
            deadline: options
                .deadline
                .unwrap_or(self.settings.acquisition_timeout),
        };
        match key.kind {
            OperationKind::Install | OperationKind::Update => self.replace(&ctx).await?,
            OperationKind::Uninstall => self.remove(&ctx).await?,
        }

        let local = self.store.local();
        Ok(Reconciler::with_host_types(&registry, &local, &host).classify_entry(&entry))
    }

    fn apply_conflict_policy(
        &self,
        entry: &EntryId,
        conflicts: &[Conflict],
        warnings: &mut Vec<String>,
    ) -> Result<()> {
        if conflicts.is_empty() {
            return Ok(());
        }
        match self.settings.conflict_policy {
            ConflictPolicy::Block => Err(ManagerError::ConflictDetected {
                entry: entry.to_string(),
                conflicts: conflicts.iter().map(ToString::to_string).collect(),
            }),
            ConflictPolicy::Warn => {
                for conflict in conflicts {
                    warn!("{} conflicts with {}", entry, conflict);
                    warnings.push(format!("conflicts with {}", conflict));
                }
                Ok(())
            }
        }
    }

    /// Loaded host node types; an unreachable host only costs the cross-check.
    async fn host_types(&self, warnings: &mut Vec<String>) -> Vec<HostNodeType> {
        match self.host.loaded_node_types().await {
            Ok(types) => types,
            Err(e) => {
                warn!("Host node types unavailable, skipping host cross-check: {}", e);
                warnings.push(format!("host node types unavailable: {}", e));
                Vec::new()
            }
        }
    }

    /// Reserve `targets` for `entry`. Fails when an operation on another
    /// entry is touching an overlapping path. Entries are serialized by
    /// their own lock, so one entry never holds two claims.
    fn claim_paths(&self, entry: &EntryId, targets: &[PathBuf]) -> Result<PathClaim<'_>> {
        let mut claims = self.path_claims.lock().unwrap_or_else(|e| e.into_inner());
        let busy: Vec<String> = targets
            .iter()
            .filter_map(|target| {
                claims
                    .iter()
                    .find(|(owner, path)| owner != entry && paths_overlap(path, target))
                    .map(|(owner, path)| format!("{} (in use by {})", path.display(), owner))
            })
            .collect();
        if !busy.is_empty() {
            return Err(ManagerError::ConflictDetected {
                entry: entry.to_string(),
                conflicts: busy,
            });
        }
        claims.extend(targets.iter().map(|t| (entry.clone(), t.clone())));
        Ok(PathClaim {
            claims: &self.path_claims,
            entry: entry.clone(),
        })
    }

    fn entry_lock(&self, entry: &EntryId) -> Arc<Mutex<()>> {
        self.entry_locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(entry.clone())
            .or_default()
            .clone()
    }
}

fn check_transition(kind: OperationKind, current: &Classification) -> Result<()> {
    let allowed = match kind {
        OperationKind::Install => current.base_state == EntryState::NotInstalled,
        OperationKind::Update => current.base_state == EntryState::UpdateAvailable,
        OperationKind::Uninstall => current.state.is_installed(),
    };
    if allowed {
        Ok(())
    } else {
        Err(ManagerError::InvalidTransition {
            entry: current.entry.to_string(),
            operation: kind.to_string(),
            state: current.state.to_string(),
        })
    }
}

/// Conflicts the operation would add. An install brings in everything its
/// pattern overlaps; an update only what the registry's new pattern adds
/// beyond the conflicts already in force.
fn introduced_conflicts(
    kind: OperationKind,
    reconciler: &Reconciler<'_>,
    entry: &CatalogEntry,
    current: &Classification,
) -> Vec<Conflict> {
    let Some(package) = entry.as_package() else {
        return Vec::new();
    };
    match kind {
        OperationKind::Install => current.conflicts.clone(),
        OperationKind::Update => reconciler
            .conflicts_for_pattern(package, package.nodename_pattern.as_ref())
            .into_iter()
            .filter(|c| !current.conflicts.contains(c))
            .collect(),
        OperationKind::Uninstall => Vec::new(),
    }
}

fn cancelled(entry: &EntryId) -> ManagerError {
    ManagerError::OperationCancelled {
        entry: entry.to_string(),
    }
}
