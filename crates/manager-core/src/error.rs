//! Error types for the node manager.
//!
//! `ManagerError` is the library-wide error. Operation outcomes are shared
//! between coalesced callers and must be cloneable, so they carry the
//! lightweight [`ErrorKind`] plus a rendered message instead of the error
//! itself.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Main error type for the node manager.
#[derive(Debug, Error)]
pub enum ManagerError {
    // Registry errors
    #[error("Registry unavailable: {message}")]
    RegistryUnavailable { message: String },

    #[error("Registry malformed: {message}")]
    RegistryMalformed { message: String },

    // Local state errors
    #[error("Filesystem unavailable at {path:?}: {message}")]
    FilesystemUnavailable {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Recovered interrupted operation for {entry}: {message}")]
    PartialWriteRecovered { entry: String, message: String },

    // Operation errors
    #[error("Cannot {operation} {entry}: entry is {state}")]
    InvalidTransition {
        entry: String,
        operation: String,
        state: String,
    },

    #[error("Installing {entry} would conflict with {}", conflicts.join(", "))]
    ConflictDetected {
        entry: String,
        conflicts: Vec<String>,
    },

    #[error("Acquisition failed for {url}: {message}")]
    AcquisitionFailed { url: String, message: String },

    #[error("Operation on {entry} timed out after {after:?}")]
    OperationTimedOut { entry: String, after: Duration },

    #[error("Operation on {entry} was cancelled")]
    OperationCancelled { entry: String },

    #[error("Entry not found in registry: {entry}")]
    EntryNotFound { entry: String },

    // Plumbing errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("Network error: {message}")]
    Network {
        message: String,
        #[source]
        source: Option<reqwest::Error>,
    },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Invalid parameters: {message}")]
    InvalidParams { message: String },

    #[error("{0}")]
    Other(String),
}

/// Result type alias for node manager operations.
pub type Result<T> = std::result::Result<T, ManagerError>;

/// Cloneable classification of a [`ManagerError`], reported in outcomes and
/// journal records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    RegistryUnavailable,
    RegistryMalformed,
    FilesystemUnavailable,
    InvalidTransition,
    ConflictDetected,
    AcquisitionFailed,
    OperationTimedOut,
    OperationCancelled,
    PartialWriteRecovered,
    EntryNotFound,
    InvalidParams,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::RegistryUnavailable => "registry_unavailable",
            ErrorKind::RegistryMalformed => "registry_malformed",
            ErrorKind::FilesystemUnavailable => "filesystem_unavailable",
            ErrorKind::InvalidTransition => "invalid_transition",
            ErrorKind::ConflictDetected => "conflict_detected",
            ErrorKind::AcquisitionFailed => "acquisition_failed",
            ErrorKind::OperationTimedOut => "operation_timed_out",
            ErrorKind::OperationCancelled => "operation_cancelled",
            ErrorKind::PartialWriteRecovered => "partial_write_recovered",
            ErrorKind::EntryNotFound => "entry_not_found",
            ErrorKind::InvalidParams => "invalid_params",
            ErrorKind::Internal => "internal",
        };
        f.write_str(s)
    }
}

impl From<std::io::Error> for ManagerError {
    fn from(err: std::io::Error) -> Self {
        ManagerError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for ManagerError {
    fn from(err: serde_json::Error) -> Self {
        ManagerError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<reqwest::Error> for ManagerError {
    fn from(err: reqwest::Error) -> Self {
        ManagerError::Network {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl ManagerError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        ManagerError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Create a filesystem-unavailable error with path context.
    pub fn filesystem(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        ManagerError::FilesystemUnavailable {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Classify this error for outcome reporting.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ManagerError::RegistryUnavailable { .. } => ErrorKind::RegistryUnavailable,
            ManagerError::RegistryMalformed { .. } => ErrorKind::RegistryMalformed,
            ManagerError::FilesystemUnavailable { .. } | ManagerError::Io { .. } => {
                ErrorKind::FilesystemUnavailable
            }
            ManagerError::PartialWriteRecovered { .. } => ErrorKind::PartialWriteRecovered,
            ManagerError::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            ManagerError::ConflictDetected { .. } => ErrorKind::ConflictDetected,
            ManagerError::AcquisitionFailed { .. } | ManagerError::Network { .. } => {
                ErrorKind::AcquisitionFailed
            }
            ManagerError::OperationTimedOut { .. } => ErrorKind::OperationTimedOut,
            ManagerError::OperationCancelled { .. } => ErrorKind::OperationCancelled,
            ManagerError::EntryNotFound { .. } => ErrorKind::EntryNotFound,
            ManagerError::InvalidParams { .. } => ErrorKind::InvalidParams,
            ManagerError::Json { .. } | ManagerError::Config { .. } | ManagerError::Other(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Convert to a JSON-RPC error code.
    ///
    /// Custom error codes (application-defined, -32000 to -32099):
    /// - -32000: Registry or network unavailable
    /// - -32001: Entry not found
    /// - -32002: Invalid transition
    /// - -32003: Acquisition / installation failed
    /// - -32004: Cancelled or timed out
    /// - -32005: Conflict detected
    /// - -32006: Local state problem (filesystem, recovery)
    /// - -32602: Invalid params
    pub fn to_rpc_error_code(&self) -> i32 {
        match self.kind() {
            ErrorKind::RegistryUnavailable | ErrorKind::RegistryMalformed => -32000,
            ErrorKind::EntryNotFound => -32001,
            ErrorKind::InvalidTransition => -32002,
            ErrorKind::AcquisitionFailed => -32003,
            ErrorKind::OperationCancelled | ErrorKind::OperationTimedOut => -32004,
            ErrorKind::ConflictDetected => -32005,
            ErrorKind::FilesystemUnavailable | ErrorKind::PartialWriteRecovered => -32006,
            ErrorKind::InvalidParams => -32602,
            ErrorKind::Internal => -32603,
        }
    }

    /// Check if this error should trigger a retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            ManagerError::Network { .. }
            | ManagerError::RegistryUnavailable { .. }
            | ManagerError::AcquisitionFailed { .. }
            | ManagerError::OperationTimedOut { .. } => true,
            _ => false,
        }
    }
}
