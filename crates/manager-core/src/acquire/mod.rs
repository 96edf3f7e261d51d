//! Artifact acquisition: turning a catalog artifact into bytes on disk.
//!
//! The orchestrator only ever asks a source to write into a staging
//! directory; moving staged content into the live tree is its job.

mod archive;
mod git;

use crate::cancel::CancellationToken;
use crate::catalog::{AcquireMethod, Artifact, EntryId};
use crate::network::Downloader;
use crate::{ManagerError, Result};
use archive::{extract_archive, ArchiveFormat};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// One artifact to acquire.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    pub entry: EntryId,
    pub artifact: Artifact,
    /// Registry version being installed, if published.
    pub version: Option<String>,
}

/// What a source produced for one artifact.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchReceipt {
    /// Checked-out commit for source checkouts.
    pub revision: Option<String>,
    /// SHA-256 of the downloaded file or archive.
    pub sha256: Option<String>,
    pub bytes: u64,
}

/// Fetches artifacts into a destination path.
///
/// `dest` does not exist when called; on success it holds the artifact (a
/// file or a directory), on failure the caller discards whatever is left.
#[async_trait]
pub trait ArtifactSource: Send + Sync {
    async fn fetch(
        &self,
        request: &FetchRequest,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<FetchReceipt>;
}

/// Network-backed source: HTTP downloads, archives and `git` checkouts.
pub struct DefaultArtifactSource {
    downloader: Arc<Downloader>,
}

impl DefaultArtifactSource {
    pub fn new() -> Result<Self> {
        Ok(Self::with_downloader(Arc::new(Downloader::new()?)))
    }

    pub fn with_downloader(downloader: Arc<Downloader>) -> Self {
        Self { downloader }
    }

    async fn fetch_file(
        &self,
        url: &str,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<FetchReceipt> {
        let receipt = self.downloader.download(url, dest, cancel).await?;
        Ok(FetchReceipt {
            revision: None,
            sha256: Some(receipt.sha256),
            bytes: receipt.bytes,
        })
    }

    async fn fetch_archive(
        &self,
        url: &str,
        format: ArchiveFormat,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<FetchReceipt> {
        let parent = dest.parent().unwrap_or(dest);
        std::fs::create_dir_all(parent).map_err(|e| ManagerError::io_with_path(e, parent))?;
        let scratch =
            tempfile::tempdir_in(parent).map_err(|e| ManagerError::io_with_path(e, parent))?;
        let archive_path = scratch.path().join(match format {
            ArchiveFormat::Zip => "artifact.zip",
            ArchiveFormat::TarGz => "artifact.tar.gz",
        });

        let receipt = self.downloader.download(url, &archive_path, cancel).await?;
        cancel
            .check()
            .map_err(|_| ManagerError::OperationCancelled { entry: url.to_string() })?;

        let dest_owned = dest.to_path_buf();
        tokio::task::spawn_blocking(move || extract_archive(&archive_path, format, &dest_owned))
            .await
            .map_err(|e| ManagerError::Other(format!("Archive extraction task failed: {}", e)))??;
        debug!("Extracted {} into {}", url, dest.display());

        Ok(FetchReceipt {
            revision: None,
            sha256: Some(receipt.sha256),
            bytes: receipt.bytes,
        })
    }

    async fn fetch_checkout(
        &self,
        url: &str,
        reference: Option<&str>,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<FetchReceipt> {
        let revision = git::clone_repository(url, reference, dest, cancel).await?;
        Ok(FetchReceipt {
            revision: Some(revision),
            sha256: None,
            bytes: 0,
        })
    }
}

#[async_trait]
impl ArtifactSource for DefaultArtifactSource {
    async fn fetch(
        &self,
        request: &FetchRequest,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<FetchReceipt> {
        let url = request.artifact.source.as_str();
        info!(
            "Fetching {} for {} ({:?})",
            url, request.entry, request.artifact.method
        );

        match request.artifact.method {
            AcquireMethod::Download => self.fetch_file(url, dest, cancel).await,
            AcquireMethod::Archive => {
                let format = ArchiveFormat::from_url(url).ok_or_else(|| {
                    ManagerError::AcquisitionFailed {
                        url: url.to_string(),
                        message: "unsupported archive format".to_string(),
                    }
                })?;
                self.fetch_archive(url, format, dest, cancel).await
            }
            AcquireMethod::GitCheckout => self.fetch_checkout(url, None, dest, cancel).await,
            // Registry-managed packages are published either as an archive
            // or as a repository tagged with the registry version.
            AcquireMethod::Registry => match ArchiveFormat::from_url(url) {
                Some(format) => self.fetch_archive(url, format, dest, cancel).await,
                None => {
                    self.fetch_checkout(url, request.version.as_deref(), dest, cancel)
                        .await
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Package;

    fn package(install_type: &str, files: &[&str]) -> Package {
        serde_json::from_value(serde_json::json!({
            "reference": "https://github.com/user/Bar",
            "title": "Bar",
            "files": files,
            "install_type": install_type,
        }))
        .unwrap()
    }

    #[test]
    fn test_planned_archives_have_a_known_format() {
        let urls = [
            "https://example.com/bar.zip?raw=true",
            "https://example.com/releases/bar.tar.gz?token=abc#x",
            "https://example.com/BAR.ZIP",
        ];
        for url in urls {
            let artifacts = package("copy", &[url]).artifacts().unwrap();
            assert_eq!(artifacts[0].method, AcquireMethod::Archive, "{}", url);
            assert!(ArchiveFormat::from_url(&artifacts[0].source).is_some(), "{}", url);
        }
    }

    #[test]
    fn test_registry_archive_with_query_is_not_cloned() {
        let url = "https://example.com/bar.zip?raw=true";
        let artifacts = package("cnr", &[url]).artifacts().unwrap();
        assert_eq!(artifacts[0].method, AcquireMethod::Registry);
        assert_eq!(artifacts[0].relative_path, Path::new("custom_nodes/bar"));
        assert_eq!(ArchiveFormat::from_url(url), Some(ArchiveFormat::Zip));
    }
}
