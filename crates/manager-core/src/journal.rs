//! Operation journal: coalesces in-flight operations and keeps their status.
//!
//! At most one operation runs per `(entry, kind)` key. A second request for
//! the same key joins the running one and receives the same outcome through
//! a `watch` channel. Finished records are kept for status polling up to a
//! retention count.

use crate::cancel::CancellationToken;
use crate::catalog::{EntryId, OperationKind, RecoveryNote};
use crate::orchestrator::{Outcome, OutcomeError, OutcomeResult};
use crate::ErrorKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{watch, Mutex};
use tracing::debug;

/// Coalescing key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationKey {
    pub entry: EntryId,
    pub kind: OperationKind,
}

impl OperationKey {
    pub fn new(kind: OperationKind, entry: EntryId) -> Self {
        Self { entry, kind }
    }
}

impl fmt::Display for OperationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.entry)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl OperationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OperationStatus::Succeeded | OperationStatus::Failed)
    }
}

/// Status of one operation, live or finished.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub operation_id: String,
    pub entry: EntryId,
    pub kind: OperationKind,
    pub status: OperationStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<OutcomeError>,
    /// Callers that joined this operation after it started.
    pub join_count: u32,
}

/// A caller's stake in an operation.
#[derive(Debug, Clone)]
pub struct OperationHandle {
    pub operation_id: String,
    pub key: OperationKey,
    cancel: CancellationToken,
    outcome: watch::Receiver<Option<Outcome>>,
}

impl OperationHandle {
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Wait for the operation's outcome.
    pub async fn wait(mut self) -> Outcome {
        loop {
            if let Some(outcome) = self.outcome.borrow().clone() {
                return outcome;
            }
            if self.outcome.changed().await.is_err() {
                // Sender dropped without an outcome: the worker died.
                return self.abandoned();
            }
        }
    }

    fn abandoned(&self) -> Outcome {
        if let Some(outcome) = self.outcome.borrow().clone() {
            return outcome;
        }
        Outcome {
            operation_id: self.operation_id.clone(),
            entry: self.key.entry.clone(),
            kind: self.key.kind,
            result: OutcomeResult::Failure {
                error: OutcomeError {
                    kind: ErrorKind::Internal,
                    message: "operation ended without an outcome".to_string(),
                    retryable: true,
                },
            },
            warnings: Vec::new(),
        }
    }
}

struct LiveOperation {
    record: OperationRecord,
    cancel: CancellationToken,
    sender: watch::Sender<Option<Outcome>>,
}

#[derive(Default)]
struct JournalState {
    live: HashMap<OperationKey, LiveOperation>,
    finished: VecDeque<OperationRecord>,
}

pub struct OperationJournal {
    state: StdMutex<JournalState>,
    retention: usize,
    /// Serializes local snapshot commits; shared with the catalog store.
    state_lock: Arc<Mutex<()>>,
}

impl OperationJournal {
    pub fn new(retention: usize) -> Self {
        Self {
            state: StdMutex::new(JournalState::default()),
            retention,
            state_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn state_lock(&self) -> Arc<Mutex<()>> {
        self.state_lock.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, JournalState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start an operation for `key`, or join the one already in flight.
    ///
    /// Returns `true` when the caller is the one that must run it.
    pub fn begin_or_join(&self, key: OperationKey) -> (bool, OperationHandle) {
        let mut state = self.lock();

        if let Some(live) = state.live.get_mut(&key) {
            live.record.join_count += 1;
            debug!("Joining in-flight operation {} ({})", live.record.operation_id, key);
            let handle = OperationHandle {
                operation_id: live.record.operation_id.clone(),
                key,
                cancel: live.cancel.clone(),
                outcome: live.sender.subscribe(),
            };
            return (false, handle);
        }

        let operation_id = uuid::Uuid::new_v4().to_string();
        let (sender, receiver) = watch::channel(None);
        let cancel = CancellationToken::new();
        let record = OperationRecord {
            operation_id: operation_id.clone(),
            entry: key.entry.clone(),
            kind: key.kind,
            status: OperationStatus::Pending,
            started_at: Utc::now(),
            completed_at: None,
            error: None,
            join_count: 0,
        };
        state.live.insert(
            key.clone(),
            LiveOperation {
                record,
                cancel: cancel.clone(),
                sender,
            },
        );
        debug!("Began operation {} ({})", operation_id, key);

        (
            true,
            OperationHandle {
                operation_id,
                key,
                cancel,
                outcome: receiver,
            },
        )
    }

    pub fn mark_running(&self, key: &OperationKey) {
        if let Some(live) = self.lock().live.get_mut(key) {
            live.record.status = OperationStatus::Running;
        }
    }

    /// Record the outcome and release every waiting caller.
    pub fn complete(&self, key: &OperationKey, outcome: Outcome) {
        let mut state = self.lock();
        let Some(live) = state.live.remove(key) else {
            return;
        };

        let mut record = live.record;
        record.completed_at = Some(Utc::now());
        match &outcome.result {
            OutcomeResult::Success { .. } => record.status = OperationStatus::Succeeded,
            OutcomeResult::Failure { error } => {
                record.status = OperationStatus::Failed;
                record.error = Some(error.clone());
            }
        }
        state.finished.push_back(record);
        Self::prune(&mut state, self.retention);
        drop(state);

        // Receivers may all be gone if callers stopped waiting.
        let _ = live.sender.send(Some(outcome));
    }

    /// Latest record for `key`: the live one, else the most recent finished.
    pub fn status(&self, key: &OperationKey) -> Option<OperationRecord> {
        let state = self.lock();
        if let Some(live) = state.live.get(key) {
            return Some(live.record.clone());
        }
        state
            .finished
            .iter()
            .rev()
            .find(|r| r.entry == key.entry && r.kind == key.kind)
            .cloned()
    }

    /// Record by operation id.
    pub fn get(&self, operation_id: &str) -> Option<OperationRecord> {
        let state = self.lock();
        state
            .live
            .values()
            .map(|l| &l.record)
            .chain(state.finished.iter())
            .find(|r| r.operation_id == operation_id)
            .cloned()
    }

    /// All live and retained records, oldest first.
    pub fn list(&self) -> Vec<OperationRecord> {
        let state = self.lock();
        let mut records: Vec<OperationRecord> = state
            .finished
            .iter()
            .cloned()
            .chain(state.live.values().map(|l| l.record.clone()))
            .collect();
        records.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        records
    }

    /// Request cooperative cancellation of the live operation for `key`.
    pub fn cancel(&self, key: &OperationKey) -> bool {
        match self.lock().live.get(key) {
            Some(live) => {
                live.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Surface operations recovered at load as failed records.
    pub fn record_recovered(&self, notes: &[RecoveryNote]) {
        let mut state = self.lock();
        for note in notes {
            let (Some(entry), Some(operation_id), Some(kind)) =
                (&note.entry, &note.operation_id, note.kind)
            else {
                continue;
            };
            let now = Utc::now();
            state.finished.push_back(OperationRecord {
                operation_id: operation_id.clone(),
                entry: entry.clone(),
                kind,
                status: OperationStatus::Failed,
                started_at: now,
                completed_at: Some(now),
                error: Some(OutcomeError::from(&note.to_error())),
                join_count: 0,
            });
        }
        Self::prune(&mut state, self.retention);
    }

    /// Drop the oldest finished records beyond the retention count.
    fn prune(state: &mut JournalState, retention: usize) {
        while state.finished.len() > retention {
            state.finished.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::{Classification, EntryState};

    fn key() -> OperationKey {
        OperationKey::new(
            OperationKind::Install,
            EntryId::model("checkpoints", "v1.safetensors"),
        )
    }

    fn success(handle: &OperationHandle) -> Outcome {
        Outcome {
            operation_id: handle.operation_id.clone(),
            entry: handle.key.entry.clone(),
            kind: handle.key.kind,
            result: OutcomeResult::Success {
                classification: Classification {
                    entry: handle.key.entry.clone(),
                    state: EntryState::InstalledCurrent,
                    base_state: EntryState::InstalledCurrent,
                    conflicts: vec![],
                    local_version: None,
                    registry_version: None,
                },
            },
            warnings: vec![],
        }
    }

    #[tokio::test]
    async fn test_join_shares_outcome() {
        let journal = OperationJournal::new(8);
        let (first_new, first) = journal.begin_or_join(key());
        let (second_new, second) = journal.begin_or_join(key());
        assert!(first_new);
        assert!(!second_new);
        assert_eq!(first.operation_id, second.operation_id);
        assert_eq!(journal.status(&key()).unwrap().join_count, 1);

        let outcome = success(&first);
        journal.complete(&key(), outcome.clone());

        assert_eq!(first.wait().await, outcome);
        assert_eq!(second.wait().await, outcome);
        assert_eq!(
            journal.status(&key()).unwrap().status,
            OperationStatus::Succeeded
        );
    }

    #[tokio::test]
    async fn test_new_operation_after_completion() {
        let journal = OperationJournal::new(8);
        let (_, first) = journal.begin_or_join(key());
        journal.complete(&key(), success(&first));

        let (is_new, second) = journal.begin_or_join(key());
        assert!(is_new);
        assert_ne!(first.operation_id, second.operation_id);
    }

    #[test]
    fn test_mark_running_and_cancel() {
        let journal = OperationJournal::new(8);
        let (_, handle) = journal.begin_or_join(key());
        journal.mark_running(&key());
        assert_eq!(journal.status(&key()).unwrap().status, OperationStatus::Running);

        assert!(journal.cancel(&key()));
        assert!(handle.cancel_token().is_cancelled());
        assert!(!journal.cancel(&OperationKey::new(
            OperationKind::Uninstall,
            key().entry
        )));
    }

    #[test]
    fn test_prune_keeps_retention() {
        let journal = OperationJournal::new(2);
        for i in 0..5 {
            let key = OperationKey::new(
                OperationKind::Install,
                EntryId::package(format!("https://github.com/x/{}", i)),
            );
            let (_, handle) = journal.begin_or_join(key.clone());
            journal.complete(&key, success(&handle));
        }
        assert_eq!(journal.list().len(), 2);
    }

    #[tokio::test]
    async fn test_dropped_sender_yields_failure() {
        let journal = OperationJournal::new(8);
        let (_, handle) = journal.begin_or_join(key());
        // Removing the live entry without completing drops the sender.
        journal.lock().live.clear();
        let outcome = handle.wait().await;
        assert_eq!(outcome.error_kind(), Some(ErrorKind::Internal));
    }
}
