//! YtDlpStrategy: CLI download backend powered by yt-dlp.
//!
//! Handles YouTube and the long tail of video sites via the yt-dlp extractor
//! ecosystem. It also takes direct file links, which makes it the CLI
//! fallback for `HttpStrategy`.

use async_trait::async_trait;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::core::config;
use crate::core::process::{run_with_progress, run_with_timeout};
use crate::download::error::DownloadError;
use crate::download::progress::parse_progress;
use crate::download::source::{
    files_with_stem, mime_from_extension, DownloadOutput, DownloadRequest, DownloadStrategy, SourceProgress,
    StrategyMode,
};
use crate::download::tool_errors::tool_failure;

/// Known domains handled by yt-dlp (non-exhaustive, used for `supports`).
const YTDLP_DOMAINS: &[&str] = &[
    "youtube.com",
    "youtu.be",
    "music.youtube.com",
    "soundcloud.com",
    "vimeo.com",
    "tiktok.com",
    "instagram.com",
    "twitter.com",
    "x.com",
    "facebook.com",
    "twitch.tv",
    "dailymotion.com",
    "bandcamp.com",
    "reddit.com",
    "bilibili.com",
];

/// Archive and document links that no extractor will turn into media
const NON_MEDIA_EXTENSIONS: &[&str] = &["zip", "rar", "7z", "pdf", "exe", "tar", "gz"];

/// CLI strategy that shells out to yt-dlp.
pub struct YtDlpStrategy {
    binary: String,
    estimate_timeout: Duration,
}

impl Default for YtDlpStrategy {
    fn default() -> Self {
        Self::new(config::download::estimate_timeout())
    }
}

impl YtDlpStrategy {
    pub fn new(estimate_timeout: Duration) -> Self {
        Self {
            binary: config::YTDL_BIN.clone(),
            estimate_timeout,
        }
    }

    /// Uses a specific yt-dlp executable instead of `YTDL_BIN`.
    #[must_use]
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    /// Check if a domain matches any known yt-dlp domain.
    fn is_known_domain(url: &Url) -> bool {
        if let Some(host) = url.host_str() {
            let host_lower = host.to_lowercase();
            YTDLP_DOMAINS
                .iter()
                .any(|d| host_lower == *d || host_lower.ends_with(&format!(".{}", d)))
        } else {
            false
        }
    }

    fn build_args(request: &DownloadRequest) -> Vec<String> {
        let template = request
            .output_dir
            .join(format!("{}.%(ext)s", request.file_stem()))
            .to_string_lossy()
            .to_string();

        let mut args = vec![
            "-o".to_string(),
            template,
            "--newline".to_string(),
            "--no-playlist".to_string(),
            "--no-part".to_string(),
            "--force-overwrites".to_string(),
            "--socket-timeout".to_string(),
            "30".to_string(),
            "--retries".to_string(),
            "3".to_string(),
        ];
        if let Some(max) = request.max_file_size {
            args.push("--max-filesize".to_string());
            args.push(max.to_string());
        }
        args.push(request.url.to_string());
        args
    }

    /// Removes every file yt-dlp wrote for this item, partial or merged.
    async fn cleanup(request: &DownloadRequest) {
        let mut entries = match tokio::fs::read_dir(&request.output_dir).await {
            Ok(entries) => entries,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    log::warn!("Failed to list {}: {}", request.output_dir.display(), e);
                }
                return;
            }
        };
        let stem = request.file_stem();
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    log::warn!("Failed to read {}: {}", request.output_dir.display(), e);
                    break;
                }
            };
            if !entry.file_name().to_string_lossy().starts_with(&stem) {
                continue;
            }
            let path = entry.path();
            if let Err(e) = tokio::fs::remove_file(&path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    log::warn!("Failed to remove {}: {}", path.display(), e);
                }
            }
        }
    }
}

#[async_trait]
impl DownloadStrategy for YtDlpStrategy {
    fn name(&self) -> &str {
        "yt-dlp"
    }

    fn mode(&self) -> StrategyMode {
        StrategyMode::Cli
    }

    fn supports(&self, url: &Url) -> bool {
        let scheme = url.scheme();
        if scheme != "http" && scheme != "https" {
            return false;
        }
        if Self::is_known_domain(url) {
            return true;
        }
        // Any other page might be handled by the generic extractor
        let path = url.path().to_lowercase();
        !matches!(path.rsplit_once('.'), Some((_, ext)) if NON_MEDIA_EXTENSIONS.contains(&ext))
    }

    async fn estimate_size(&self, url: &Url) -> Option<u64> {
        let mut cmd = Command::new(&self.binary);
        cmd.args([
            "--no-playlist",
            "--skip-download",
            "--no-warnings",
            "--print",
            "%(filesize,filesize_approx)s",
            url.as_str(),
        ]);
        let output = run_with_timeout(&mut cmd, self.estimate_timeout, &CancellationToken::new())
            .await
            .ok()?;
        if !output.status.success() {
            return None;
        }
        String::from_utf8_lossy(&output.stdout)
            .lines()
            .find_map(|l| l.trim().parse::<u64>().ok())
            .filter(|size| *size > 0)
    }

    async fn download(
        &self,
        request: &DownloadRequest,
        progress_tx: mpsc::UnboundedSender<SourceProgress>,
        cancel: &CancellationToken,
    ) -> Result<DownloadOutput, DownloadError> {
        log::info!("📥 yt-dlp download: {}", request.url);
        tokio::fs::create_dir_all(&request.output_dir).await?;

        let mut cmd = Command::new(&self.binary);
        cmd.args(Self::build_args(request));

        let result = run_with_progress(&mut cmd, request.timeout, cancel, |line| {
            if let Some(progress) = parse_progress(line) {
                let _ = progress_tx.send(progress);
            }
        })
        .await;

        let output = match result {
            Ok(output) => output,
            Err(e) => {
                Self::cleanup(request).await;
                return Err(e);
            }
        };

        if !output.status.success() {
            Self::cleanup(request).await;
            return Err(tool_failure("yt-dlp", &output.stderr_tail, request.max_file_size));
        }

        let files = files_with_stem(&request.output_dir, &request.file_stem())?;
        let Some((file_path, file_size)) = files.into_iter().max_by_key(|(_, size)| *size) else {
            // yt-dlp exits 0 when it skips a file over --max-filesize
            let err = tool_failure("yt-dlp", &output.stderr_tail, request.max_file_size);
            if matches!(err, DownloadError::FileTooLarge { .. }) {
                return Err(err);
            }
            return Err(DownloadError::FileNotFound(format!(
                "yt-dlp produced no file for {}",
                request.url
            )));
        };

        if let Some(limit) = request.max_file_size {
            if file_size > limit {
                Self::cleanup(request).await;
                return Err(DownloadError::FileTooLarge { size: file_size, limit });
            }
        }

        log::info!(
            "✅ yt-dlp download complete: {} ({:.2} MB)",
            file_path.display(),
            file_size as f64 / (1024.0 * 1024.0)
        );

        let mime_hint = mime_from_extension(&file_path);
        Ok(DownloadOutput {
            file_path,
            file_size,
            mime_hint,
        })
    }
}
