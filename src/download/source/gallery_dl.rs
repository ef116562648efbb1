//! GalleryDlStrategy: CLI backend for social posts via gallery-dl.
//!
//! Posts can carry several images or clips, so every item gets its own
//! directory `<output_dir>/<item_id>/` and the whole directory is the output.

use async_trait::async_trait;
use std::path::PathBuf;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::core::config;
use crate::core::process::run_with_progress;
use crate::download::error::DownloadError;
use crate::download::source::{
    files_in_dir, mime_from_extension, DownloadOutput, DownloadRequest, DownloadStrategy, SourceProgress,
    StrategyMode,
};
use crate::download::tool_errors::tool_failure;

const GALLERY_DL_DOMAINS: &[&str] = &["twitter.com", "x.com", "reddit.com", "redd.it", "instagram.com"];

pub struct GalleryDlStrategy {
    binary: String,
}

impl Default for GalleryDlStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl GalleryDlStrategy {
    pub fn new() -> Self {
        Self {
            binary: config::GALLERY_DL_BIN.clone(),
        }
    }

    #[must_use]
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    fn target_dir(request: &DownloadRequest) -> PathBuf {
        request.output_dir.join(request.file_stem())
    }

    fn build_args(request: &DownloadRequest) -> Vec<String> {
        let mut args = vec![
            "-D".to_string(),
            Self::target_dir(request).to_string_lossy().to_string(),
            "--no-mtime".to_string(),
        ];
        if let Some(max) = request.max_file_size {
            args.push("--filesize-max".to_string());
            args.push(max.to_string());
        }
        args.push(request.url.to_string());
        args
    }

    async fn cleanup(request: &DownloadRequest) {
        let dir = Self::target_dir(request);
        if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                log::warn!("Failed to remove {}: {}", dir.display(), e);
            }
        }
    }
}

#[async_trait]
impl DownloadStrategy for GalleryDlStrategy {
    fn name(&self) -> &str {
        "gallery-dl"
    }

    fn mode(&self) -> StrategyMode {
        StrategyMode::Cli
    }

    fn supports(&self, url: &Url) -> bool {
        let scheme = url.scheme();
        if scheme != "http" && scheme != "https" {
            return false;
        }
        url.host_str()
            .map(|host| {
                let host = host.to_lowercase();
                GALLERY_DL_DOMAINS
                    .iter()
                    .any(|d| host == *d || host.ends_with(&format!(".{}", d)))
            })
            .unwrap_or(false)
    }

    async fn download(
        &self,
        request: &DownloadRequest,
        progress_tx: mpsc::UnboundedSender<SourceProgress>,
        cancel: &CancellationToken,
    ) -> Result<DownloadOutput, DownloadError> {
        log::info!("📥 gallery-dl download: {}", request.url);
        let dir = Self::target_dir(request);
        tokio::fs::create_dir_all(&dir).await?;

        // gallery-dl prints one path per finished file; no percentages
        let mut finished = 0u64;
        let mut cmd = Command::new(&self.binary);
        cmd.args(Self::build_args(request));
        let result = run_with_progress(&mut cmd, request.timeout, cancel, |line| {
            if line.starts_with(dir.to_string_lossy().as_ref()) {
                finished += 1;
                let _ = progress_tx.send(SourceProgress {
                    percent: 0,
                    speed_bytes_sec: None,
                    eta_seconds: None,
                    downloaded_bytes: None,
                    total_bytes: None,
                });
                log::debug!("gallery-dl finished file #{}", finished);
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
            return Err(tool_failure("gallery-dl", &output.stderr_tail, request.max_file_size));
        }

        let files = files_in_dir(&dir)?;
        if files.is_empty() {
            Self::cleanup(request).await;
            let err = tool_failure("gallery-dl", &output.stderr_tail, request.max_file_size);
            if matches!(err, DownloadError::FileTooLarge { .. }) {
                return Err(err);
            }
            return Err(DownloadError::FileNotFound(format!(
                "gallery-dl produced no files for {}",
                request.url
            )));
        }

        if let Some(limit) = request.max_file_size {
            if let Some((_, size)) = files.iter().find(|(_, size)| *size > limit) {
                let size = *size;
                Self::cleanup(request).await;
                return Err(DownloadError::FileTooLarge { size, limit });
            }
        }

        let total: u64 = files.iter().map(|(_, size)| size).sum();
        log::info!(
            "✅ gallery-dl download complete: {} file(s), {:.2} MB",
            files.len(),
            total as f64 / (1024.0 * 1024.0)
        );

        let (file_path, mime_hint) = match files.as_slice() {
            [(single, _)] => (single.clone(), mime_from_extension(single)),
            _ => (dir, None),
        };

        Ok(DownloadOutput {
            file_path,
            file_size: total,
            mime_hint,
        })
    }
}
