//! Source checkout via the `git` command line.

use crate::cancel::CancellationToken;
use crate::config::InstallationConfig;
use crate::{ManagerError, Result};
use std::path::Path;
use tokio::process::Command;
use tracing::{debug, error, info};

/// Shallow-clone `url` into `dest`, optionally at `reference` (tag or
/// branch). Returns the checked-out commit.
pub(crate) async fn clone_repository(
    url: &str,
    reference: Option<&str>,
    dest: &Path,
    cancel: &CancellationToken,
) -> Result<String> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent).map_err(|e| ManagerError::io_with_path(e, parent))?;
    }

    let depth = InstallationConfig::GIT_CLONE_DEPTH.to_string();
    let dest_arg = dest.to_string_lossy().to_string();
    let mut args = vec!["clone", "--depth", depth.as_str(), "--quiet"];
    if let Some(reference) = reference {
        args.extend(["--branch", reference]);
    }
    args.extend(["--", url, dest_arg.as_str()]);

    info!("Cloning {} into {}", url, dest.display());
    let mut command = Command::new("git");
    command
        .args(&args)
        .env("GIT_TERMINAL_PROMPT", "0")
        .kill_on_drop(true);

    let output = tokio::select! {
        output = command.output() => output.map_err(|e| ManagerError::AcquisitionFailed {
            url: url.to_string(),
            message: format!("Failed to execute git clone: {}", e),
        })?,
        _ = cancel.cancelled() => {
            return Err(ManagerError::OperationCancelled { entry: url.to_string() });
        }
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        error!("git clone of {} failed: {}", url, stderr.trim());
        return Err(ManagerError::AcquisitionFailed {
            url: url.to_string(),
            message: format!("git clone failed: {}", stderr.trim()),
        });
    }

    head_commit(dest).await
}

async fn head_commit(repo: &Path) -> Result<String> {
    let output = Command::new("git")
        .args(["rev-parse", "HEAD"])
        .current_dir(repo)
        .output()
        .await
        .map_err(|e| ManagerError::io_with_path(e, repo))?;

    if !output.status.success() {
        return Err(ManagerError::AcquisitionFailed {
            url: repo.display().to_string(),
            message: "cloned repository has no HEAD".to_string(),
        });
    }
    let commit = String::from_utf8_lossy(&output.stdout).trim().to_string();
    debug!("Checked out {} at {}", repo.display(), commit);
    Ok(commit)
}
