//! HTTP fetching and artifact download.
//!
//! Redirects are never followed by the client itself: each request
//! follows exactly one hop explicitly, so a redirect chain surfaces as an
//! unexpected status instead of looping.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use reqwest::header::{CONTENT_LENGTH, LOCATION};
use reqwest::{Response, StatusCode, Url};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::config::NetworkConfig;
use crate::error::UpdateError;

/// Minimum spacing between progress reports.
const PROGRESS_INTERVAL: Duration = Duration::from_millis(250);

/// Fixed artifact file name under the writable data directory.
pub const ARTIFACT_FILE_NAME: &str = "update.zip";

/// Progress callback type for download progress reporting.
pub type ProgressCallback = Arc<dyn Fn(DownloadProgress) + Send + Sync>;

/// HTTP downloader with single-hop redirect handling, bounded timeouts,
/// and retry for transient failures.
pub struct Downloader {
    /// HTTP client with redirects disabled.
    client: reqwest::Client,
    /// Network settings.
    config: NetworkConfig,
    /// Optional progress callback for reporting download progress.
    progress_callback: Option<ProgressCallback>,
}

impl Downloader {
    /// Create a new downloader with default network settings.
    pub fn new() -> Result<Self, UpdateError> {
        Self::with_config(NetworkConfig::default())
    }

    /// Create a new downloader with custom configuration.
    pub fn with_config(config: NetworkConfig) -> Result<Self, UpdateError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.timeout_seconds))
            .read_timeout(Duration::from_secs(config.read_timeout_seconds))
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(&config.user_agent)
            .build()
            .map_err(|e| UpdateError::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            config,
            progress_callback: None,
        })
    }

    /// Set the progress callback.
    pub fn set_progress_callback<F>(&mut self, callback: F)
    where
        F: Fn(DownloadProgress) + Send + Sync + 'static,
    {
        self.progress_callback = Some(Arc::new(callback));
    }

    /// Clear the progress callback.
    pub fn clear_progress_callback(&mut self) {
        self.progress_callback = None;
    }

    /// Fetch a small document (the manifest) into memory.
    ///
    /// The whole exchange, including the redirect hop and body read, is
    /// bounded by the request timeout.
    pub async fn fetch(&self, url: &str) -> Result<Vec<u8>, UpdateError> {
        let timeout = Duration::from_secs(self.config.timeout_seconds);
        self.with_retry("fetch", move || async move {
            let exchange = async {
                let response = self.get_following_one_redirect(url).await?;
                let bytes = response.bytes().await?;
                Ok::<_, UpdateError>(bytes.to_vec())
            };
            match tokio::time::timeout(timeout, exchange).await {
                Ok(result) => result,
                Err(_) => Err(UpdateError::Network(format!(
                    "request to {} timed out after {}s",
                    url, self.config.timeout_seconds
                ))),
            }
        })
        .await
        .map(|bytes| {
            debug!("Fetched {} bytes from {}", bytes.len(), url);
            bytes
        })
    }

    /// Download `url` into `dest`, truncating any previous file.
    ///
    /// Returns once the file has been flushed and synced, so callers can
    /// verify it immediately.
    pub async fn download(&self, url: &str, dest: &Path) -> Result<DownloadTask, UpdateError> {
        self.with_retry("download", move || self.download_once(url, dest))
            .await
    }

    async fn download_once(&self, url: &str, dest: &Path) -> Result<DownloadTask, UpdateError> {
        info!("Starting download: {} -> {:?}", url, dest);

        let response = self.get_following_one_redirect(url).await?;
        let total = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok());

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(dest).await?;

        let mut task = DownloadTask {
            source_url: url.to_string(),
            destination: dest.to_path_buf(),
            bytes_written: 0,
            total_bytes_hint: total,
        };

        let started = Instant::now();
        let mut last_report: Option<Instant> = None;
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    warn!(
                        "Download stream failed after {} bytes: {}",
                        task.bytes_written, e
                    );
                    return Err(UpdateError::PartialDownload {
                        received: task.bytes_written,
                        expected: total,
                    });
                }
            };
            file.write_all(&chunk).await?;
            task.bytes_written += chunk.len() as u64;

            if last_report.map_or(true, |t| t.elapsed() >= PROGRESS_INTERVAL) {
                last_report = Some(Instant::now());
                self.report_progress(&task, started.elapsed());
            }
        }

        // Completion is only observed once the data is on disk.
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        if let Some(expected) = total {
            if task.bytes_written != expected {
                warn!(
                    "Download size mismatch: expected {}, got {}",
                    expected, task.bytes_written
                );
                return Err(UpdateError::PartialDownload {
                    received: task.bytes_written,
                    expected: total,
                });
            }
        }

        self.report_progress(&task, started.elapsed());
        info!("Download complete: {} bytes", task.bytes_written);
        Ok(task)
    }

    /// Issue a GET and follow at most one redirect hop.
    ///
    /// A second redirect, or any other non-2xx terminal status, is returned
    /// as [`UpdateError::HttpStatus`] without reading the body.
    async fn get_following_one_redirect(&self, url: &str) -> Result<Response, UpdateError> {
        debug!("GET {}", url);
        let response = self.client.get(url).send().await?;

        let response = match redirect_target(&response)? {
            Some(target) => {
                debug!("Following redirect {} -> {}", url, target);
                self.client.get(target).send().await?
            }
            None => response,
        };

        let status = response.status();
        if !status.is_success() {
            return Err(UpdateError::HttpStatus {
                status: status.as_u16(),
                url: response.url().to_string(),
            });
        }
        Ok(response)
    }

    async fn with_retry<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, UpdateError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, UpdateError>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.config.max_retries => {
                    let delay = Duration::from_millis(
                        self.config.retry_backoff_ms.saturating_mul(1u64 << attempt.min(16)),
                    );
                    attempt += 1;
                    warn!(
                        "{} failed ({}), retrying in {:?} (attempt {}/{})",
                        what, e, delay, attempt, self.config.max_retries
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Report download progress via the callback if set.
    fn report_progress(&self, task: &DownloadTask, elapsed: Duration) {
        let progress = DownloadProgress::new(task.bytes_written, task.total_bytes_hint, elapsed);
        debug!("Download progress: {}", progress);
        if let Some(callback) = &self.progress_callback {
            callback(progress);
        }
    }
}

/// Resolve the `Location` of a redirect response, relative to its URL.
fn redirect_target(response: &Response) -> Result<Option<Url>, UpdateError> {
    if !is_redirect(response.status()) {
        return Ok(None);
    }
    let location = response
        .headers()
        .get(LOCATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| UpdateError::HttpStatus {
            status: response.status().as_u16(),
            url: response.url().to_string(),
        })?;
    let target = response
        .url()
        .join(location)
        .map_err(|e| UpdateError::Network(format!("invalid redirect location {:?}: {}", location, e)))?;
    Ok(Some(target))
}

fn is_redirect(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::MOVED_PERMANENTLY
            | StatusCode::FOUND
            | StatusCode::SEE_OTHER
            | StatusCode::TEMPORARY_REDIRECT
            | StatusCode::PERMANENT_REDIRECT
    )
}

/// A download in progress or just completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadTask {
    /// URL originally requested (before the redirect hop).
    pub source_url: String,
    /// File the body was streamed into.
    pub destination: PathBuf,
    /// Bytes written so far.
    pub bytes_written: u64,
    /// Total size announced by the server, if any.
    pub total_bytes_hint: Option<u64>,
}

/// Download progress information.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DownloadProgress {
    /// Bytes downloaded so far.
    pub downloaded: u64,
    /// Total bytes to download, when the server announced it.
    pub total: Option<u64>,
    /// Average transfer rate since the download started.
    pub bytes_per_second: u64,
}

impl DownloadProgress {
    /// Create a new progress instance.
    pub fn new(downloaded: u64, total: Option<u64>, elapsed: Duration) -> Self {
        let secs = elapsed.as_secs_f64();
        let bytes_per_second = if secs > 0.0 {
            (downloaded as f64 / secs) as u64
        } else {
            downloaded
        };
        Self {
            downloaded,
            total,
            bytes_per_second,
        }
    }

    /// Download progress as a percentage (0.0 to 100.0), if the total is known.
    pub fn percentage(&self) -> Option<f64> {
        match self.total {
            Some(0) | None => None,
            Some(total) => Some((self.downloaded as f64 / total as f64 * 100.0).min(100.0)),
        }
    }
}

impl std::fmt::Display for DownloadProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.total, self.percentage()) {
            (Some(total), Some(pct)) => write!(
                f,
                "{}/{} bytes ({:.1}%) at {} B/s",
                self.downloaded, total, pct, self.bytes_per_second
            ),
            _ => write!(f, "{} bytes at {} B/s", self.downloaded, self.bytes_per_second),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_percentage() {
        let p = DownloadProgress::new(50, Some(200), Duration::from_secs(1));
        assert_eq!(p.percentage(), Some(25.0));
        assert_eq!(p.bytes_per_second, 50);

        let unknown = DownloadProgress::new(50, None, Duration::from_secs(2));
        assert_eq!(unknown.percentage(), None);
        assert_eq!(unknown.bytes_per_second, 25);

        let empty = DownloadProgress::new(0, Some(0), Duration::ZERO);
        assert_eq!(empty.percentage(), None);
    }

    #[test]
    fn test_progress_display() {
        let p = DownloadProgress::new(100, Some(400), Duration::from_secs(1));
        assert_eq!(p.to_string(), "100/400 bytes (25.0%) at 100 B/s");
        let p = DownloadProgress::new(100, None, Duration::from_secs(1));
        assert_eq!(p.to_string(), "100 bytes at 100 B/s");
    }

    #[test]
    fn test_redirect_statuses() {
        assert!(is_redirect(StatusCode::SEE_OTHER));
        assert!(is_redirect(StatusCode::FOUND));
        assert!(is_redirect(StatusCode::TEMPORARY_REDIRECT));
        assert!(!is_redirect(StatusCode::OK));
        assert!(!is_redirect(StatusCode::NOT_MODIFIED));
        assert!(!is_redirect(StatusCode::NOT_FOUND));
    }

    #[test]
    fn test_downloader_builds() {
        let mut downloader = Downloader::new().unwrap();
        downloader.set_progress_callback(|_| {});
        assert!(downloader.progress_callback.is_some());
        downloader.clear_progress_callback();
        assert!(downloader.progress_callback.is_none());
    }
}
