//! Metadata persistence.
//!
//! This module provides:
//! - Atomic JSON file operations with `.bak` fallback
//! - Cross-process file locking
//! - The install manifest and operation intent records

mod atomic;
mod manifest;

pub use atomic::{
    atomic_read_json, atomic_write_json, read_json_with_backup, BackedRead, FileLockGuard,
};
pub use manifest::{IntentPhase, LocalRecord, Manifest, OperationIntent, MANIFEST_FORMAT_VERSION};
