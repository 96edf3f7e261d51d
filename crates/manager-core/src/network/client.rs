//! Thin wrapper around `reqwest` with the manager's timeouts and user agent.

use crate::config::NetworkConfig;
use crate::{ManagerError, Result};
use reqwest::{Client, Response, StatusCode};
use std::time::Duration;

/// HTTP client shared by registry fetches, host queries, and downloads.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
}

impl HttpClient {
    pub fn new() -> Result<Self> {
        Self::with_timeout(NetworkConfig::REQUEST_TIMEOUT)
    }

    /// Create a client whose requests each time out after `timeout`.
    ///
    /// For downloads this bounds the wait for response headers and each
    /// read; the overall deadline comes from the orchestrator.
    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(timeout)
            .read_timeout(timeout)
            .user_agent(NetworkConfig::USER_AGENT)
            .build()
            .map_err(|e| ManagerError::Network {
                message: format!("Failed to create HTTP client: {}", e),
                source: Some(e),
            })?;

        Ok(Self { client })
    }

    /// GET `url`. Non-success statuses are returned, not turned into errors.
    pub async fn get(&self, url: &str) -> Result<Response> {
        self.client
            .get(url)
            .send()
            .await
            .map_err(|e| ManagerError::Network {
                message: format!("GET {} failed: {}", url, e),
                source: Some(e),
            })
    }

    /// Check if an HTTP status code indicates a transient failure.
    pub fn is_retryable_status(status: StatusCode) -> bool {
        matches!(status.as_u16(), 408 | 429 | 500 | 502 | 503 | 504)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_status_codes() {
        assert!(HttpClient::is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(HttpClient::is_retryable_status(StatusCode::BAD_GATEWAY));
        assert!(!HttpClient::is_retryable_status(StatusCode::NOT_FOUND));
        assert!(!HttpClient::is_retryable_status(StatusCode::OK));
    }
}
