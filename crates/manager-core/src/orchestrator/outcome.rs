//! Requests and outcomes of mutating operations.

use crate::catalog::{EntryId, OperationKind};
use crate::reconcile::Classification;
use crate::{ErrorKind, ManagerError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One operation to execute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationRequest {
    pub kind: OperationKind,
    pub entry: EntryId,
}

impl OperationRequest {
    pub fn new(kind: OperationKind, entry: EntryId) -> Self {
        Self { kind, entry }
    }
}

/// Per-call execution options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecuteOptions {
    /// Bound on acquisition time; the configured default applies when unset.
    ///
    /// Only the call that starts an operation sets its deadline; joiners
    /// share the running operation as-is.
    pub deadline: Option<Duration>,
}

impl ExecuteOptions {
    pub fn with_deadline(deadline: Duration) -> Self {
        Self {
            deadline: Some(deadline),
        }
    }
}

/// Cloneable error detail carried by a failed outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeError {
    pub kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
}

impl From<&ManagerError> for OutcomeError {
    fn from(err: &ManagerError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
            retryable: err.is_retryable(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OutcomeResult {
    Success { classification: Classification },
    Failure { error: OutcomeError },
}

/// Result of one operation, shared by every coalesced caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub operation_id: String,
    pub entry: EntryId,
    pub kind: OperationKind,
    #[serde(flatten)]
    pub result: OutcomeResult,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self.result, OutcomeResult::Success { .. })
    }

    pub fn classification(&self) -> Option<&Classification> {
        match &self.result {
            OutcomeResult::Success { classification } => Some(classification),
            OutcomeResult::Failure { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&OutcomeError> {
        match &self.result {
            OutcomeResult::Success { .. } => None,
            OutcomeResult::Failure { error } => Some(error),
        }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error().map(|e| e.kind)
    }
}
