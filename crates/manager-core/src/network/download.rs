//! Streamed downloads into a `.part` file, hashed as they arrive.
//!
//! A download is only visible under its final name once every byte has been
//! written and flushed; failures and cancellation remove the partial file.

use crate::cancel::CancellationToken;
use crate::config::NetworkConfig;
use crate::network::client::HttpClient;
use crate::network::retry::{retry_async, RetryConfig};
use crate::{ManagerError, Result};
use futures::StreamExt;
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// What a completed download produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadReceipt {
    pub bytes: u64,
    /// Hex SHA-256 of the downloaded content.
    pub sha256: String,
}

/// Downloads single files with retry and cancellation.
pub struct Downloader {
    http: Arc<HttpClient>,
    retry: RetryConfig,
}

impl Downloader {
    pub fn new() -> Result<Self> {
        Ok(Self::with_client(Arc::new(HttpClient::new()?)))
    }

    pub fn with_client(http: Arc<HttpClient>) -> Self {
        Self {
            http,
            retry: RetryConfig::new()
                .with_max_attempts(NetworkConfig::MAX_RETRIES)
                .with_base_delay(Duration::from_secs(2)),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Download `url` to `destination`, retrying transient failures.
    pub async fn download(
        &self,
        url: &str,
        destination: &Path,
        cancel: &CancellationToken,
    ) -> Result<DownloadReceipt> {
        if let Some(parent) = destination.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ManagerError::io_with_path(e, parent))?;
        }

        let temp_path = PathBuf::from(format!(
            "{}{}",
            destination.display(),
            NetworkConfig::DOWNLOAD_TEMP_SUFFIX
        ));

        let (result, stats) = retry_async(
            &self.retry,
            cancel,
            || self.download_once(url, &temp_path, cancel),
            // Only transport errors and retryable statuses are worth another try.
            |e| matches!(e, ManagerError::Network { .. }),
        )
        .await;

        let receipt = match result {
            Ok(receipt) => receipt,
            Err(e) => {
                let _ = std::fs::remove_file(&temp_path);
                return Err(e);
            }
        };

        std::fs::rename(&temp_path, destination).map_err(|e| {
            let _ = std::fs::remove_file(&temp_path);
            ManagerError::io_with_path(e, destination)
        })?;

        if stats.attempts > 1 {
            debug!(
                "Download of {} succeeded after {} attempts",
                url, stats.attempts
            );
        }
        info!(
            "Downloaded {} bytes to {}",
            receipt.bytes,
            destination.display()
        );
        Ok(receipt)
    }

    async fn download_once(
        &self,
        url: &str,
        temp_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<DownloadReceipt> {
        let response = self.http.get(url).await?;
        let status = response.status();

        if !status.is_success() {
            let message = format!("Download failed with status {}", status);
            return Err(if HttpClient::is_retryable_status(status) {
                ManagerError::Network {
                    message,
                    source: None,
                }
            } else {
                ManagerError::AcquisitionFailed {
                    url: url.to_string(),
                    message,
                }
            });
        }

        let mut file =
            std::fs::File::create(temp_path).map_err(|e| ManagerError::io_with_path(e, temp_path))?;
        let mut hasher = Sha256::new();
        let mut bytes: u64 = 0;
        let mut stream = response.bytes_stream();

        loop {
            let next = tokio::select! {
                chunk = stream.next() => chunk,
                _ = cancel.cancelled() => {
                    return Err(ManagerError::OperationCancelled { entry: url.to_string() });
                }
            };
            let Some(chunk) = next else { break };

            let chunk = chunk.map_err(|e| ManagerError::Network {
                message: format!("Error reading download stream: {}", e),
                source: Some(e),
            })?;
            file.write_all(&chunk)
                .map_err(|e| ManagerError::io_with_path(e, temp_path))?;
            hasher.update(&chunk);
            bytes += chunk.len() as u64;
        }

        file.flush()
            .and_then(|_| file.sync_all())
            .map_err(|e| ManagerError::io_with_path(e, temp_path))?;

        Ok(DownloadReceipt {
            bytes,
            sha256: hex::encode(hasher.finalize()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_unreachable_host_leaves_no_partial_file() {
        let dir = TempDir::new().unwrap();
        let destination = dir.path().join("models").join("x.bin");
        let downloader = Downloader::new()
            .unwrap()
            .with_retry(RetryConfig::new().with_max_attempts(1));

        // Port 9 on localhost is the discard service and is normally closed.
        let result = downloader
            .download(
                "http://127.0.0.1:9/x.bin",
                &destination,
                &CancellationToken::new(),
            )
            .await;

        assert!(result.is_err());
        assert!(!destination.exists());
        assert!(!dir.path().join("models").join("x.bin.part").exists());
    }
}
