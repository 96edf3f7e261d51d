//! Atomic file operations for safe JSON persistence.
//!
//! Writes go to a temp file with a PID+TID suffix, are fsynced, optionally
//! back up the previous version to `.bak`, and are renamed over the target.
//! Readers therefore only ever observe a complete old or complete new file.

use crate::{ManagerError, Result};
use fs2::FileExt;
use serde::{de::DeserializeOwned, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process;
use std::thread;
use tracing::{debug, warn};

/// Read and parse a JSON file.
///
/// Returns `None` if the file doesn't exist, or an error if parsing fails.
pub fn atomic_read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }

    let contents = fs::read_to_string(path).map_err(|e| ManagerError::Io {
        message: format!("Failed to read {}", path.display()),
        path: Some(path.to_path_buf()),
        source: Some(e),
    })?;

    let data: T = serde_json::from_str(&contents).map_err(|e| ManagerError::Json {
        message: format!("Failed to parse {}: {}", path.display(), e),
        source: Some(e),
    })?;

    Ok(Some(data))
}

/// Outcome of reading a file that may need to fall back to its backup.
#[derive(Debug)]
pub enum BackedRead<T> {
    Missing,
    Primary(T),
    /// The primary was unreadable; the last known-good backup was used.
    Backup { data: T, primary_error: String },
}

/// Read a JSON file, falling back to its `.bak` sibling when the primary is
/// corrupt. Errors only when both are unusable.
pub fn read_json_with_backup<T: DeserializeOwned>(path: &Path) -> Result<BackedRead<T>> {
    match atomic_read_json::<T>(path) {
        Ok(Some(data)) => Ok(BackedRead::Primary(data)),
        Ok(None) => Ok(BackedRead::Missing),
        Err(primary) => {
            let backup_path = backup_path(path);
            warn!(
                "Primary {} unreadable ({}), trying {}",
                path.display(),
                primary,
                backup_path.display()
            );
            match atomic_read_json::<T>(&backup_path)? {
                Some(data) => Ok(BackedRead::Backup {
                    data,
                    primary_error: primary.to_string(),
                }),
                None => Err(primary),
            }
        }
    }
}

/// Write data to a JSON file atomically.
pub fn atomic_write_json<T: Serialize>(path: &Path, data: &T, keep_backup: bool) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            fs::create_dir_all(parent).map_err(|e| ManagerError::Io {
                message: format!("Failed to create directory {}", parent.display()),
                path: Some(parent.to_path_buf()),
                source: Some(e),
            })?;
        }
    }

    let pid = process::id();
    let tid = thread_id();
    let temp_path = path.with_extension(format!("json.{}.{}.tmp", pid, tid));

    let serialized = serde_json::to_string_pretty(data).map_err(|e| ManagerError::Json {
        message: format!("Failed to serialize data: {}", e),
        source: Some(e),
    })?;

    let write_result = (|| -> std::io::Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)?;
        file.write_all(serialized.as_bytes())?;
        file.flush()?;
        file.sync_all()
    })();

    if let Err(e) = write_result {
        let _ = fs::remove_file(&temp_path);
        return Err(ManagerError::Io {
            message: format!("Failed to write temp file {}", temp_path.display()),
            path: Some(temp_path),
            source: Some(e),
        });
    }

    if keep_backup && path.exists() {
        let backup = backup_path(path);
        if let Err(e) = fs::copy(path, &backup) {
            // Backup failure is not fatal.
            warn!("Failed to create backup {}: {}", backup.display(), e);
        } else {
            debug!("Created backup: {}", backup.display());
        }
    }

    fs::rename(&temp_path, path).map_err(|e| {
        let _ = fs::remove_file(&temp_path);
        ManagerError::Io {
            message: format!(
                "Failed to rename {} to {}",
                temp_path.display(),
                path.display()
            ),
            path: Some(path.to_path_buf()),
            source: Some(e),
        }
    })?;

    debug!("Atomically wrote {}", path.display());
    Ok(())
}

/// Exclusive advisory lock on a lock file, released on drop.
///
/// Guards the manifest against writers in other processes; in-process
/// writers are already serialized by the shared state lock.
pub struct FileLockGuard {
    file: File,
    path: PathBuf,
}

impl FileLockGuard {
    /// Block until the exclusive lock on `path` is acquired.
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| ManagerError::io_with_path(e, parent))?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| ManagerError::io_with_path(e, path))?;
        file.lock_exclusive()
            .map_err(|e| ManagerError::io_with_path(e, path))?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }
}

impl Drop for FileLockGuard {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!("Failed to release lock {}: {}", self.path.display(), e);
        }
    }
}

fn backup_path(path: &Path) -> PathBuf {
    path.with_extension("json.bak")
}

fn thread_id() -> u64 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut hasher = DefaultHasher::new();
    format!("{:?}", thread::current().id()).hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use tempfile::TempDir;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct TestData {
        name: String,
        value: i32,
    }

    #[test]
    fn test_atomic_write_and_read() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("test.json");

        let data = TestData {
            name: "test".to_string(),
            value: 42,
        };

        atomic_write_json(&path, &data, false).unwrap();
        let read_data: Option<TestData> = atomic_read_json(&path).unwrap();
        assert_eq!(read_data, Some(data));
    }

    #[test]
    fn test_atomic_write_leaves_no_temp_files() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("state.json");

        atomic_write_json(&path, &TestData { name: "a".into(), value: 1 }, true).unwrap();
        atomic_write_json(&path, &TestData { name: "b".into(), value: 2 }, true).unwrap();

        let names: Vec<String> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert!(names.iter().all(|n| !n.ends_with(".tmp")), "{:?}", names);
        assert!(names.contains(&"state.json.bak".to_string()));
    }

    #[test]
    fn test_read_with_backup_falls_back_on_corruption() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("state.json");

        atomic_write_json(&path, &TestData { name: "good".into(), value: 1 }, true).unwrap();
        atomic_write_json(&path, &TestData { name: "newer".into(), value: 2 }, true).unwrap();
        fs::write(&path, "{ truncated").unwrap();

        match read_json_with_backup::<TestData>(&path).unwrap() {
            BackedRead::Backup { data, .. } => assert_eq!(data.name, "good"),
            other => panic!("expected backup read, got {:?}", other),
        }
    }

    #[test]
    fn test_read_with_backup_missing() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("absent.json");
        assert!(matches!(
            read_json_with_backup::<TestData>(&path).unwrap(),
            BackedRead::Missing
        ));
    }

    #[test]
    fn test_file_lock_is_reacquirable_after_drop() {
        let temp_dir = TempDir::new().unwrap();
        let lock_path = temp_dir.path().join("state").join("manifest.lock");

        {
            let _guard = FileLockGuard::acquire(&lock_path).unwrap();
        }
        let _again = FileLockGuard::acquire(&lock_path).unwrap();
        assert!(lock_path.exists());
    }
}
