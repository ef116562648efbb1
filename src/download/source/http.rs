//! HttpStrategy: direct HTTP download of media file URLs.
//!
//! Handles direct file URLs (e.g., `https://example.com/file.mp3`).
//! Features:
//! - Chunked download with progress tracking via reqwest
//! - HEAD request for size estimation
//! - Early abort when Content-Length or the streamed bytes pass the size cap
//! - Partial files are removed on failure and cancellation

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::download::error::DownloadError;
use crate::download::source::{
    direct_file_extension, mime_from_extension, DownloadOutput, DownloadRequest, DownloadStrategy, SourceProgress,
    StrategyMode,
};

/// API-mode strategy for direct HTTP file downloads.
pub struct HttpStrategy {
    client: Client,
}

impl Default for HttpStrategy {
    fn default() -> Self {
        Self::new(crate::core::config::download::timeout())
    }
}

impl HttpStrategy {
    pub fn new(timeout: Duration) -> Self {
        let client = Client::builder()
            .user_agent("Mozilla/5.0 (compatible; boss-dl/0.1)")
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|e| {
                log::warn!("HTTP client build failed ({}), using defaults", e);
                Client::new()
            });

        Self { client }
    }

    /// Target path `<output_dir>/<item_id>.<ext>`.
    fn output_path(request: &DownloadRequest) -> PathBuf {
        let ext = direct_file_extension(&request.url).unwrap_or_else(|| "bin".to_string());
        request.output_dir.join(format!("{}.{}", request.file_stem(), ext))
    }

    async fn discard(path: &Path) {
        if let Err(e) = tokio::fs::remove_file(path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                log::warn!("Failed to remove partial file {}: {}", path.display(), e);
            }
        }
    }

    async fn stream_to_file(
        &self,
        request: &DownloadRequest,
        path: &Path,
        progress_tx: &mpsc::UnboundedSender<SourceProgress>,
        cancel: &CancellationToken,
    ) -> Result<(u64, Option<String>), DownloadError> {
        let response = tokio::select! {
            r = self.client.get(request.url.as_str()).send() => r?,
            _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
        };

        if !response.status().is_success() {
            return Err(DownloadError::Http(format!("HTTP {} for {}", response.status(), request.url)));
        }

        let total_size = response.content_length();
        if let (Some(total), Some(max)) = (total_size, request.max_file_size) {
            if total > max {
                return Err(DownloadError::FileTooLarge { size: total, limit: max });
            }
        }

        let mime_hint = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
            .or_else(|| mime_from_extension(path));

        let mut file = tokio::fs::File::create(path).await?;
        let mut downloaded: u64 = 0;
        let mut last_progress_percent = 0u8;
        let started = Instant::now();
        let mut stream = response.bytes_stream();

        loop {
            let chunk = tokio::select! {
                next = stream.next() => match next {
                    Some(chunk) => chunk?,
                    None => break,
                },
                _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
            };

            downloaded += chunk.len() as u64;
            if let Some(max_size) = request.max_file_size {
                if downloaded > max_size {
                    return Err(DownloadError::FileTooLarge {
                        size: downloaded,
                        limit: max_size,
                    });
                }
            }

            file.write_all(&chunk).await?;

            let percent = total_size
                .filter(|total| *total > 0)
                .map(|total| ((downloaded as f64 / total as f64) * 100.0).min(100.0) as u8)
                .unwrap_or(0);

            if percent >= last_progress_percent.saturating_add(5) || percent == 100 {
                last_progress_percent = percent;
                let elapsed = started.elapsed().as_secs_f64();
                let speed = (elapsed > 0.0).then(|| downloaded as f64 / elapsed);
                let eta_seconds = match (speed, total_size) {
                    (Some(speed), Some(total)) if speed > 0.0 => {
                        Some((total.saturating_sub(downloaded) as f64 / speed) as u64)
                    }
                    _ => None,
                };
                let _ = progress_tx.send(SourceProgress {
                    percent,
                    speed_bytes_sec: speed,
                    eta_seconds,
                    downloaded_bytes: Some(downloaded),
                    total_bytes: total_size,
                });
            }
        }

        file.flush().await?;
        Ok((downloaded, mime_hint))
    }
}

#[async_trait]
impl DownloadStrategy for HttpStrategy {
    fn name(&self) -> &str {
        "http"
    }

    fn mode(&self) -> StrategyMode {
        StrategyMode::Api
    }

    fn supports(&self, url: &Url) -> bool {
        let scheme = url.scheme();
        if scheme != "http" && scheme != "https" {
            return false;
        }
        direct_file_extension(url).is_some()
    }

    async fn estimate_size(&self, url: &Url) -> Option<u64> {
        let response = self.client.head(url.as_str()).send().await.ok()?;
        if !response.status().is_success() {
            return None;
        }
        // HEAD bodies are empty, so read the header rather than the body size hint
        response
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|len| *len > 0)
    }

    async fn download(
        &self,
        request: &DownloadRequest,
        progress_tx: mpsc::UnboundedSender<SourceProgress>,
        cancel: &CancellationToken,
    ) -> Result<DownloadOutput, DownloadError> {
        log::info!("📥 HTTP direct download: {}", request.url);

        tokio::fs::create_dir_all(&request.output_dir).await?;
        let path = Self::output_path(request);

        match self.stream_to_file(request, &path, &progress_tx, cancel).await {
            Ok((file_size, mime_hint)) => {
                log::info!(
                    "✅ HTTP download complete: {} ({:.2} MB)",
                    path.display(),
                    file_size as f64 / (1024.0 * 1024.0)
                );
                Ok(DownloadOutput {
                    file_path: path,
                    file_size,
                    mime_hint,
                })
            }
            Err(e) => {
                Self::discard(&path).await;
                Err(e)
            }
        }
    }
}
