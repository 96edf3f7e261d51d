//! Catalog store: owns the registry snapshot and the local install snapshot.
//!
//! Readers get cheap `Arc` clones of immutable snapshots. Every write of the
//! manifest happens under the process-wide state lock (shared with the
//! operation journal) and an exclusive file lock against other processes.

use crate::catalog::local::{scan_present, verify_records, LocalSnapshot, RecoveryNote};
use crate::catalog::provider::{RegistryProvider, RegistrySnapshot};
use crate::catalog::recovery::{pending_intents, recover_intent};
use crate::catalog::EntryId;
use crate::config::Layout;
use crate::metadata::{
    atomic_write_json, read_json_with_backup, BackedRead, FileLockGuard, LocalRecord, Manifest,
    OperationIntent,
};
use crate::{ManagerError, Result};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub struct CatalogStore {
    layout: Layout,
    provider: Arc<dyn RegistryProvider>,
    registry: RwLock<Option<Arc<RegistrySnapshot>>>,
    local: RwLock<Arc<LocalSnapshot>>,
    state_lock: Arc<Mutex<()>>,
    /// Operations of this process whose intents must not be recovered.
    active_intents: StdMutex<HashSet<String>>,
}

impl CatalogStore {
    pub fn new(
        layout: Layout,
        provider: Arc<dyn RegistryProvider>,
        state_lock: Arc<Mutex<()>>,
    ) -> Self {
        Self {
            layout,
            provider,
            registry: RwLock::new(None),
            local: RwLock::new(Arc::new(LocalSnapshot::empty())),
            state_lock,
            active_intents: StdMutex::new(HashSet::new()),
        }
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    // ========================================
    // Registry
    // ========================================

    /// Fetch and validate the registry, replacing the cached snapshot.
    ///
    /// On failure the previous snapshot stays cached.
    pub async fn load_registry(&self) -> Result<Arc<RegistrySnapshot>> {
        let documents = self.provider.fetch().await?;
        let snapshot = Arc::new(RegistrySnapshot::from_documents(documents)?);
        info!(
            "Loaded registry: {} packages, {} models, {} skipped",
            snapshot.packages().count(),
            snapshot.models().count(),
            snapshot.warnings().len()
        );
        *self.registry.write().unwrap_or_else(|e| e.into_inner()) = Some(snapshot.clone());
        Ok(snapshot)
    }

    /// The cached registry snapshot, if one has been loaded.
    pub fn registry(&self) -> Option<Arc<RegistrySnapshot>> {
        self.registry
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// The cached registry snapshot, loading it on first use.
    pub async fn require_registry(&self) -> Result<Arc<RegistrySnapshot>> {
        match self.registry() {
            Some(snapshot) => Ok(snapshot),
            None => self.load_registry().await,
        }
    }

    // ========================================
    // Local state
    // ========================================

    /// The current local snapshot.
    pub fn local(&self) -> Arc<LocalSnapshot> {
        self.local.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Re-read the manifest, recover interrupted operations, verify records
    /// against disk, and rescan the install directories.
    pub async fn load_local_state(&self) -> Result<Arc<LocalSnapshot>> {
        let _state = self.state_lock.lock().await;
        self.ensure_state_dir()?;
        let _file_lock =
            FileLockGuard::acquire(&self.layout.manifest_lock_path()).map_err(unavailable)?;

        let mut notes = Vec::new();
        let mut dirty = false;
        let manifest_path = self.layout.manifest_path();

        let manifest = match read_json_with_backup::<Manifest>(&manifest_path) {
            Ok(BackedRead::Missing) => Manifest::default(),
            Ok(BackedRead::Primary(manifest)) => manifest,
            Ok(BackedRead::Backup {
                data,
                primary_error,
            }) => {
                warn!("Manifest corrupt, restored backup: {}", primary_error);
                notes.push(RecoveryNote {
                    entry: None,
                    operation_id: None,
                    kind: None,
                    message: format!(
                        "manifest was unreadable ({}); restored last known-good copy",
                        primary_error
                    ),
                });
                dirty = true;
                data
            }
            Err(ManagerError::Json { message, .. }) => {
                warn!("Manifest and backup unreadable, rebuilding from disk: {}", message);
                notes.push(RecoveryNote {
                    entry: None,
                    operation_id: None,
                    kind: None,
                    message: format!(
                        "manifest and backup unreadable ({}); installs read as unmanaged",
                        message
                    ),
                });
                dirty = true;
                Manifest::default()
            }
            Err(e) => return Err(unavailable(e)),
        };

        let active = self.active_snapshot();
        for (path, intent) in pending_intents(&self.layout, &active).map_err(unavailable)? {
            let note = recover_intent(&self.layout, &path, &intent, &manifest.entries)
                .map_err(unavailable)?;
            notes.push(note);
        }

        let (records, dropped) = verify_records(&self.layout, manifest.entries);
        dirty |= !dropped.is_empty();

        if dirty {
            atomic_write_json(&manifest_path, &Manifest::from_entries(records.clone()), true)
                .map_err(unavailable)?;
        }

        let present = scan_present(&self.layout)?;
        let snapshot = Arc::new(
            LocalSnapshot::new(records, present).with_notes(notes, dropped),
        );
        for note in snapshot.recovered() {
            warn!("{}", note.to_error());
        }
        debug!(
            "Local state: {} records, {} present paths",
            snapshot.records().len(),
            snapshot.present().len()
        );

        *self.local.write().unwrap_or_else(|e| e.into_inner()) = snapshot.clone();
        Ok(snapshot)
    }

    /// Atomically persist `snapshot`'s records as the new local state.
    pub async fn commit_local_state(&self, snapshot: LocalSnapshot) -> Result<Arc<LocalSnapshot>> {
        let _state = self.state_lock.lock().await;
        self.ensure_state_dir()?;
        let _file_lock =
            FileLockGuard::acquire(&self.layout.manifest_lock_path()).map_err(unavailable)?;

        self.persist(snapshot.into_records())
    }

    /// Set or remove one record, reading the manifest under the lock so
    /// concurrent commits never lose each other's changes.
    pub async fn apply_local_change(
        &self,
        id: &EntryId,
        record: Option<LocalRecord>,
    ) -> Result<Arc<LocalSnapshot>> {
        let _state = self.state_lock.lock().await;
        self.ensure_state_dir()?;
        let _file_lock =
            FileLockGuard::acquire(&self.layout.manifest_lock_path()).map_err(unavailable)?;

        let mut records = match read_json_with_backup::<Manifest>(&self.layout.manifest_path()) {
            Ok(BackedRead::Primary(manifest)) | Ok(BackedRead::Backup { data: manifest, .. }) => {
                manifest.entries
            }
            Ok(BackedRead::Missing) => BTreeMap::new(),
            Err(e) => {
                warn!("Manifest unreadable during commit, using cached state: {}", e);
                self.local().records().clone()
            }
        };
        match record {
            Some(record) => {
                records.insert(id.clone(), record);
            }
            None => {
                records.remove(id);
            }
        }

        self.persist(records)
    }

    /// Write records, rescan disk, and publish the new snapshot. Caller holds
    /// both locks.
    fn persist(&self, records: BTreeMap<EntryId, LocalRecord>) -> Result<Arc<LocalSnapshot>> {
        atomic_write_json(
            &self.layout.manifest_path(),
            &Manifest::from_entries(records.clone()),
            true,
        )
        .map_err(unavailable)?;

        let present = scan_present(&self.layout)?;
        let previous = self.local();
        let snapshot = Arc::new(
            LocalSnapshot::new(records, present)
                .with_notes(previous.recovered().to_vec(), previous.dropped().to_vec()),
        );
        *self.local.write().unwrap_or_else(|e| e.into_inner()) = snapshot.clone();
        Ok(snapshot)
    }

    fn ensure_state_dir(&self) -> Result<()> {
        let root = self.layout.root();
        if !root.is_dir() {
            return Err(ManagerError::FilesystemUnavailable {
                message: "manager root does not exist".to_string(),
                path: Some(root.to_path_buf()),
                source: None,
            });
        }
        let state_dir = self.layout.state_dir();
        std::fs::create_dir_all(&state_dir).map_err(|e| ManagerError::filesystem(e, &state_dir))
    }

    // ========================================
    // Intents
    // ========================================

    /// Persist a new intent and mark its operation live in this process.
    pub fn begin_intent(&self, intent: &OperationIntent) -> Result<()> {
        self.active_intents
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(intent.operation_id.clone());
        self.write_intent(intent)
    }

    /// Rewrite an intent after its phase advanced.
    pub fn write_intent(&self, intent: &OperationIntent) -> Result<()> {
        atomic_write_json(&self.intent_path(&intent.operation_id), intent, false)
            .map_err(unavailable)
    }

    /// Remove a finished operation's intent.
    pub fn finish_intent(&self, operation_id: &str) {
        let path = self.intent_path(operation_id);
        if let Err(e) = std::fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove intent {}: {}", path.display(), e);
            }
        }
        self.active_intents
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(operation_id);
    }

    /// Stop shielding an intent from recovery without removing it, so the
    /// next `load_local_state` settles it against the manifest.
    pub fn release_intent(&self, operation_id: &str) {
        self.active_intents
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(operation_id);
    }

    fn intent_path(&self, operation_id: &str) -> std::path::PathBuf {
        self.layout
            .intents_dir()
            .join(format!("{}.json", operation_id))
    }

    fn active_snapshot(&self) -> HashSet<String> {
        self.active_intents
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

/// Report plumbing IO failures on local state as `FilesystemUnavailable`.
fn unavailable(err: ManagerError) -> ManagerError {
    match err {
        ManagerError::Io {
            message,
            path,
            source,
        } => ManagerError::FilesystemUnavailable {
            message,
            path,
            source,
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::provider::{RegistryDocuments, StaticRegistryProvider};
    use crate::catalog::ResourceKind;
    use chrono::Utc;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn new_store(dir: &TempDir) -> CatalogStore {
        CatalogStore::new(
            Layout::new(dir.path()),
            Arc::new(StaticRegistryProvider::new(RegistryDocuments::default())),
            Arc::new(Mutex::new(())),
        )
    }

    fn write_model(dir: &TempDir, name: &str, contents: &str) -> LocalRecord {
        let relative = PathBuf::from("models/checkpoints").join(name);
        let path = dir.path().join(&relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, contents).unwrap();
        LocalRecord {
            kind: ResourceKind::Model,
            version: None,
            hash: None,
            files: vec![relative],
            install_type: None,
            nodename_pattern: None,
            installed_at: Utc::now(),
            size: Some(contents.len() as u64),
        }
    }

    #[tokio::test]
    async fn test_missing_root_is_filesystem_unavailable() {
        let dir = TempDir::new().unwrap();
        let store = CatalogStore::new(
            Layout::new(dir.path().join("absent")),
            Arc::new(StaticRegistryProvider::default()),
            Arc::new(Mutex::new(())),
        );
        let err = store.load_local_state().await.unwrap_err();
        assert!(matches!(err, ManagerError::FilesystemUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_apply_change_persists_and_reloads() {
        let dir = TempDir::new().unwrap();
        let store = new_store(&dir);
        store.load_local_state().await.unwrap();

        let id = EntryId::model("checkpoints", "v1.safetensors");
        let record = write_model(&dir, "v1.safetensors", "weights");
        let snapshot = store.apply_local_change(&id, Some(record.clone())).await.unwrap();
        assert_eq!(snapshot.record(&id), Some(&record));
        assert!(snapshot.is_present(&record.files[0]));

        let reloaded = new_store(&dir).load_local_state().await.unwrap();
        assert_eq!(reloaded.record(&id), Some(&record));
        assert!(reloaded.recovered().is_empty());
    }

    #[tokio::test]
    async fn test_commit_replaces_records() {
        let dir = TempDir::new().unwrap();
        let store = new_store(&dir);
        let a = EntryId::model("checkpoints", "a.safetensors");
        let b = EntryId::model("checkpoints", "b.safetensors");
        store
            .apply_local_change(&a, Some(write_model(&dir, "a.safetensors", "a")))
            .await
            .unwrap();

        let next = store
            .local()
            .with_record(&a, None)
            .with_record(&b, Some(write_model(&dir, "b.safetensors", "b")));
        let committed = store.commit_local_state(next).await.unwrap();
        assert!(committed.record(&a).is_none());
        assert!(committed.record(&b).is_some());
    }

    #[tokio::test]
    async fn test_corrupt_manifest_recovers_from_backup() {
        let dir = TempDir::new().unwrap();
        let store = new_store(&dir);
        let a = EntryId::model("checkpoints", "a.safetensors");
        let b = EntryId::model("checkpoints", "b.safetensors");
        store
            .apply_local_change(&a, Some(write_model(&dir, "a.safetensors", "a")))
            .await
            .unwrap();
        store
            .apply_local_change(&b, Some(write_model(&dir, "b.safetensors", "b")))
            .await
            .unwrap();
        std::fs::write(store.layout().manifest_path(), "{ torn").unwrap();

        let snapshot = store.load_local_state().await.unwrap();
        assert!(snapshot.record(&a).is_some());
        assert_eq!(snapshot.recovered().len(), 1);
        assert!(matches!(
            snapshot.recovered()[0].to_error(),
            ManagerError::PartialWriteRecovered { .. }
        ));
    }

    #[tokio::test]
    async fn test_stale_record_is_dropped() {
        let dir = TempDir::new().unwrap();
        let store = new_store(&dir);
        let id = EntryId::model("checkpoints", "gone.safetensors");
        let record = write_model(&dir, "gone.safetensors", "x");
        store.apply_local_change(&id, Some(record.clone())).await.unwrap();
        std::fs::remove_file(dir.path().join(&record.files[0])).unwrap();

        let snapshot = store.load_local_state().await.unwrap();
        assert!(snapshot.record(&id).is_none());
        assert_eq!(snapshot.dropped(), &[id]);
    }
}
