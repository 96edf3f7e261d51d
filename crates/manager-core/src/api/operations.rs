//! Command methods on NodeManager: install, update, uninstall and the
//! operation journal.

use crate::catalog::{EntryId, OperationKind};
use crate::journal::{OperationKey, OperationRecord};
use crate::orchestrator::{ExecuteOptions, OperationRequest, Outcome};
use crate::NodeManager;

impl NodeManager {
    // ========================================
    // Operations
    // ========================================

    pub async fn install(&self, entry: EntryId) -> Outcome {
        self.execute(OperationKind::Install, entry).await
    }

    pub async fn update(&self, entry: EntryId) -> Outcome {
        self.execute(OperationKind::Update, entry).await
    }

    pub async fn uninstall(&self, entry: EntryId) -> Outcome {
        self.execute(OperationKind::Uninstall, entry).await
    }

    /// Run an operation, joining an identical one already in flight.
    pub async fn execute(&self, kind: OperationKind, entry: EntryId) -> Outcome {
        self.state.installer.execute(kind, entry).await
    }

    pub async fn execute_with(
        &self,
        kind: OperationKind,
        entry: EntryId,
        options: ExecuteOptions,
    ) -> Outcome {
        self.state.installer.execute_with(kind, entry, options).await
    }

    /// Run operations in parallel; outcomes are returned in request order.
    pub async fn execute_batch(&self, requests: Vec<OperationRequest>) -> Vec<Outcome> {
        self.execute_batch_with(requests, ExecuteOptions::default()).await
    }

    pub async fn execute_batch_with(
        &self,
        requests: Vec<OperationRequest>,
        options: ExecuteOptions,
    ) -> Vec<Outcome> {
        self.state.installer.execute_batch(requests, options).await
    }

    // ========================================
    // Journal
    // ========================================

    /// Latest record for `(kind, entry)`: the live one, else the most recent
    /// finished one.
    pub fn operation_status(&self, kind: OperationKind, entry: EntryId) -> Option<OperationRecord> {
        self.state.journal.status(&OperationKey::new(kind, entry))
    }

    pub fn get_operation(&self, operation_id: &str) -> Option<OperationRecord> {
        self.state.journal.get(operation_id)
    }

    pub fn list_operations(&self) -> Vec<OperationRecord> {
        self.state.journal.list()
    }

    /// Request cancellation of the live operation for `(kind, entry)`.
    pub fn cancel(&self, kind: OperationKind, entry: EntryId) -> bool {
        self.state.installer.cancel(kind, entry)
    }

    /// Request cancellation by operation id. False if it is not running.
    pub fn cancel_operation(&self, operation_id: &str) -> bool {
        match self.state.journal.get(operation_id) {
            Some(record) if !record.status.is_terminal() => {
                self.cancel(record.kind, record.entry)
            }
            _ => false,
        }
    }
}
