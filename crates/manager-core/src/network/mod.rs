//! Network utilities: HTTP client, retries, and streamed downloads.

mod client;
mod download;
mod retry;

pub use client::HttpClient;
pub use download::{DownloadReceipt, Downloader};
pub use retry::{retry_async, RetryConfig, RetryStats};
