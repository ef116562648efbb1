//! Download strategy abstraction and URL-based selection.
//!
//! A strategy is one way of fetching a URL: either an `Api` strategy talking
//! to the remote service directly, or a `Cli` strategy driving an external
//! tool. The [`StrategySelector`] picks the first registered strategy that
//! supports a URL and, for API strategies, a CLI strategy to fall back to.
//!
//! Built-in strategies:
//! - `HttpStrategy` (api) - direct media file URLs, streamed with a size cap
//! - `GalleryDlStrategy` (cli) - Twitter/X, Reddit, Instagram posts
//! - `YtDlpStrategy` (cli) - YouTube and the long tail of video sites

pub mod gallery_dl;
pub mod http;
pub mod ytdlp;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;
use uuid::Uuid;

use crate::core::config::SchedulerConfig;
use crate::core::error::SchedulerError;
use crate::download::error::DownloadError;

/// Extensions treated as direct media files
pub const DIRECT_FILE_EXTENSIONS: &[&str] = &[
    "mp3", "mp4", "wav", "flac", "ogg", "m4a", "webm", "avi", "mkv", "aac", "opus", "mov", "jpg", "jpeg", "png",
    "gif", "webp",
];

/// Returns the lowercase extension of the URL path if it is a known media file.
pub fn direct_file_extension(url: &Url) -> Option<String> {
    let path = url.path().to_lowercase();
    let ext = path.rsplit_once('.')?.1;
    DIRECT_FILE_EXTENSIONS
        .contains(&ext)
        .then(|| ext.to_string())
}

fn host_matches(url: &Url, domains: &[&str]) -> bool {
    url.host_str()
        .map(|host| {
            let host = host.to_lowercase();
            domains
                .iter()
                .any(|d| host == *d || host.ends_with(&format!(".{}", d)))
        })
        .unwrap_or(false)
}

/// Source platform of a URL, used for API toggles and metric labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    YouTube,
    Twitter,
    Reddit,
    Instagram,
    TikTok,
    /// Plain link to a media file
    Direct,
    Other,
}

impl Platform {
    pub fn detect(url: &Url) -> Self {
        if host_matches(url, &["youtube.com", "youtu.be"]) {
            Platform::YouTube
        } else if host_matches(url, &["twitter.com", "x.com"]) {
            Platform::Twitter
        } else if host_matches(url, &["reddit.com", "redd.it"]) {
            Platform::Reddit
        } else if host_matches(url, &["instagram.com"]) {
            Platform::Instagram
        } else if host_matches(url, &["tiktok.com"]) {
            Platform::TikTok
        } else if direct_file_extension(url).is_some() {
            Platform::Direct
        } else {
            Platform::Other
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::YouTube => "youtube",
            Platform::Twitter => "twitter",
            Platform::Reddit => "reddit",
            Platform::Instagram => "instagram",
            Platform::TikTok => "tiktok",
            Platform::Direct => "direct",
            Platform::Other => "other",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "youtube" => Ok(Platform::YouTube),
            "twitter" | "x" => Ok(Platform::Twitter),
            "reddit" => Ok(Platform::Reddit),
            "instagram" => Ok(Platform::Instagram),
            "tiktok" => Ok(Platform::TikTok),
            "direct" => Ok(Platform::Direct),
            "other" => Ok(Platform::Other),
            other => Err(format!("Unknown platform: {}", other)),
        }
    }
}

/// How a strategy reaches the content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyMode {
    /// Direct HTTP/API access from this process
    Api,
    /// External downloader subprocess
    Cli,
}

impl fmt::Display for StrategyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StrategyMode::Api => f.write_str("api"),
            StrategyMode::Cli => f.write_str("cli"),
        }
    }
}

/// Progress information emitted during download.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceProgress {
    /// Download progress percentage (0-100)
    pub percent: u8,
    /// Download speed in bytes per second
    pub speed_bytes_sec: Option<f64>,
    /// Estimated time remaining in seconds
    pub eta_seconds: Option<u64>,
    /// Bytes downloaded so far
    pub downloaded_bytes: Option<u64>,
    /// Total bytes expected
    pub total_bytes: Option<u64>,
}

/// Request parameters for a download operation.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    /// Queue item this download belongs to; used to name output files
    pub item_id: Uuid,
    pub url: Url,
    /// Directory the strategy writes into
    pub output_dir: PathBuf,
    /// Maximum allowed file size in bytes
    pub max_file_size: Option<u64>,
    /// Upper bound for one attempt
    pub timeout: Duration,
}

impl DownloadRequest {
    /// File stem every strategy uses, so outputs never collide between items.
    pub fn file_stem(&self) -> String {
        self.item_id.to_string()
    }
}

/// Output from a successful download operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadOutput {
    /// Downloaded file, or directory for multi-file galleries
    pub file_path: PathBuf,
    /// Total bytes written
    pub file_size: u64,
    /// MIME type hint (e.g., "audio/mpeg", "video/mp4")
    pub mime_hint: Option<String>,
}

/// Trait for download strategy implementations.
#[async_trait]
pub trait DownloadStrategy: Send + Sync {
    /// Human-readable name (e.g., "yt-dlp", "http")
    fn name(&self) -> &str;

    fn mode(&self) -> StrategyMode;

    /// Whether this strategy can handle the given URL.
    fn supports(&self, url: &Url) -> bool;

    /// Estimate the file size in bytes before downloading.
    /// Returns None if estimation is not possible.
    async fn estimate_size(&self, _url: &Url) -> Option<u64> {
        None
    }

    /// Execute the download, sending progress updates through the channel.
    ///
    /// Must stop promptly and clean up partial output when `cancel` fires.
    async fn download(
        &self,
        request: &DownloadRequest,
        progress_tx: mpsc::UnboundedSender<SourceProgress>,
        cancel: &CancellationToken,
    ) -> Result<DownloadOutput, DownloadError>;
}

/// Strategy chosen for one URL.
#[derive(Clone)]
pub struct SelectedStrategy {
    pub platform: Platform,
    pub primary: Arc<dyn DownloadStrategy>,
    /// CLI strategy tried once if an API primary fails
    pub fallback: Option<Arc<dyn DownloadStrategy>>,
}

impl fmt::Debug for SelectedStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelectedStrategy")
            .field("platform", &self.platform)
            .field("primary", &self.primary.name())
            .field("fallback", &self.fallback.as_ref().map(|s| s.name()))
            .finish()
    }
}

/// Routes URLs to strategies.
///
/// Strategies are tried in registration order; the first one that supports
/// the URL (and is allowed in its mode for the URL's platform) wins.
pub struct StrategySelector {
    strategies: Vec<Arc<dyn DownloadStrategy>>,
    fallback_enabled: bool,
    api_platforms: Option<HashSet<Platform>>,
}

impl StrategySelector {
    /// Create an empty selector.
    pub fn new(fallback_enabled: bool) -> Self {
        Self {
            strategies: Vec::new(),
            fallback_enabled,
            api_platforms: None,
        }
    }

    /// Empty selector carrying the fallback and API settings from `cfg`.
    pub fn from_config(cfg: &SchedulerConfig) -> Self {
        Self {
            strategies: Vec::new(),
            fallback_enabled: cfg.fallback_enabled,
            api_platforms: cfg.api_platforms.clone(),
        }
    }

    /// Selector with the built-in strategies: HTTP first, then gallery-dl,
    /// then yt-dlp as the catch-all.
    pub fn with_defaults(cfg: &SchedulerConfig) -> Self {
        let mut selector = Self::from_config(cfg);
        selector.register(Arc::new(http::HttpStrategy::new(cfg.download_timeout)));
        selector.register(Arc::new(gallery_dl::GalleryDlStrategy::new()));
        selector.register(Arc::new(ytdlp::YtDlpStrategy::new(cfg.estimate_timeout)));
        selector
    }

    /// Register a strategy. Strategies are tried in insertion order.
    pub fn register(&mut self, strategy: Arc<dyn DownloadStrategy>) {
        log::debug!("Registered {} strategy '{}'", strategy.mode(), strategy.name());
        self.strategies.push(strategy);
    }

    pub fn strategies(&self) -> &[Arc<dyn DownloadStrategy>] {
        &self.strategies
    }

    fn api_allowed(&self, platform: Platform) -> bool {
        self.api_platforms
            .as_ref()
            .map(|set| set.contains(&platform))
            .unwrap_or(true)
    }

    /// Whether any strategy would take the URL.
    pub fn supports(&self, url: &Url) -> bool {
        self.select(url).is_ok()
    }

    /// Picks the primary strategy and, for API primaries, the CLI fallback.
    pub fn select(&self, url: &Url) -> Result<SelectedStrategy, SchedulerError> {
        let platform = Platform::detect(url);
        let usable = |s: &&Arc<dyn DownloadStrategy>| {
            s.supports(url) && (s.mode() == StrategyMode::Cli || self.api_allowed(platform))
        };

        let primary = self
            .strategies
            .iter()
            .find(usable)
            .cloned()
            .ok_or_else(|| SchedulerError::UnsupportedUrl(url.to_string()))?;

        let fallback = if primary.mode() == StrategyMode::Api && self.fallback_enabled {
            self.strategies
                .iter()
                .find(|s| s.mode() == StrategyMode::Cli && s.supports(url))
                .cloned()
        } else {
            None
        };

        Ok(SelectedStrategy {
            platform,
            primary,
            fallback,
        })
    }

    /// Parses and selects in one step.
    pub fn select_str(&self, raw: &str) -> Result<(Url, SelectedStrategy), SchedulerError> {
        let url = Url::parse(raw.trim()).map_err(|source| SchedulerError::InvalidUrl {
            url: raw.to_string(),
            source,
        })?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(SchedulerError::UnsupportedUrl(raw.to_string()));
        }
        let selected = self.select(&url)?;
        Ok((url, selected))
    }
}

/// Files in `dir` whose name starts with `stem.`, with their sizes.
///
/// CLI tools pick the extension themselves, so outputs are found by stem.
pub(crate) fn files_with_stem(dir: &Path, stem: &str) -> std::io::Result<Vec<(PathBuf, u64)>> {
    let prefix = format!("{}.", stem);
    let mut found = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        // Skip yt-dlp temp files
        if name.starts_with(&prefix) && !name.ends_with(".part") && !name.ends_with(".ytdl") {
            let meta = entry.metadata()?;
            if meta.is_file() {
                found.push((entry.path(), meta.len()));
            }
        }
    }
    Ok(found)
}

/// All regular files under `dir` (one level), with their sizes.
pub(crate) fn files_in_dir(dir: &Path) -> std::io::Result<Vec<(PathBuf, u64)>> {
    let mut found = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        if meta.is_file() {
            found.push((entry.path(), meta.len()));
        }
    }
    found.sort();
    Ok(found)
}

/// Guess MIME type from file extension.
pub fn mime_from_extension(path: &Path) -> Option<String> {
    let ext = path.extension()?.to_str()?.to_lowercase();
    let mime = match ext.as_str() {
        "mp3" => "audio/mpeg",
        "mp4" => "video/mp4",
        "wav" => "audio/wav",
        "flac" => "audio/flac",
        "ogg" => "audio/ogg",
        "m4a" => "audio/mp4",
        "webm" => "video/webm",
        "avi" => "video/x-msvideo",
        "mkv" => "video/x-matroska",
        "mov" => "video/quicktime",
        "aac" => "audio/aac",
        "opus" => "audio/opus",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        _ => return None,
    };
    Some(mime.to_string())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    struct Fake {
        name: &'static str,
        mode: StrategyMode,
        host: &'static str,
    }

    #[async_trait]
    impl DownloadStrategy for Fake {
        fn name(&self) -> &str {
            self.name
        }

        fn mode(&self) -> StrategyMode {
            self.mode
        }

        fn supports(&self, url: &Url) -> bool {
            url.host_str() == Some(self.host)
        }

        async fn download(
            &self,
            _request: &DownloadRequest,
            _progress_tx: mpsc::UnboundedSender<SourceProgress>,
            _cancel: &CancellationToken,
        ) -> Result<DownloadOutput, DownloadError> {
            Err(DownloadError::Other("fake".into()))
        }
    }

    fn selector(fallback: bool) -> StrategySelector {
        let mut s = StrategySelector::new(fallback);
        s.register(Arc::new(Fake {
            name: "api",
            mode: StrategyMode::Api,
            host: "x.com",
        }));
        s.register(Arc::new(Fake {
            name: "cli",
            mode: StrategyMode::Cli,
            host: "x.com",
        }));
        s
    }

    #[test]
    fn test_platform_detect() {
        let cases = [
            ("https://www.youtube.com/watch?v=abc", Platform::YouTube),
            ("https://youtu.be/abc", Platform::YouTube),
            ("https://x.com/user/status/1", Platform::Twitter),
            ("https://old.reddit.com/r/rust/comments/1", Platform::Reddit),
            ("https://www.instagram.com/p/abc/", Platform::Instagram),
            ("https://cdn.example.com/clip.MP4", Platform::Direct),
            ("https://example.com/page", Platform::Other),
        ];
        for (raw, expected) in cases {
            assert_eq!(Platform::detect(&Url::parse(raw).unwrap()), expected, "{}", raw);
        }
    }

    #[test]
    fn test_platform_from_str() {
        assert_eq!("X".parse::<Platform>(), Ok(Platform::Twitter));
        assert!("myspace".parse::<Platform>().is_err());
    }

    #[test]
    fn test_select_api_with_cli_fallback() {
        let url = Url::parse("https://x.com/a/status/1").unwrap();
        let selected = selector(true).select(&url).unwrap();
        assert_eq!(selected.platform, Platform::Twitter);
        assert_eq!(selected.primary.name(), "api");
        assert_eq!(selected.fallback.unwrap().name(), "cli");
    }

    #[test]
    fn test_select_without_fallback() {
        let url = Url::parse("https://x.com/a/status/1").unwrap();
        let selected = selector(false).select(&url).unwrap();
        assert_eq!(selected.primary.name(), "api");
        assert!(selected.fallback.is_none());
    }

    #[test]
    fn test_api_disabled_for_platform_uses_cli() {
        let mut s = selector(true);
        s.api_platforms = Some([Platform::Reddit].into_iter().collect());
        let url = Url::parse("https://x.com/a/status/1").unwrap();
        let selected = s.select(&url).unwrap();
        assert_eq!(selected.primary.name(), "cli");
        assert!(selected.fallback.is_none());
    }

    #[test]
    fn test_unsupported_url() {
        let url = Url::parse("https://nowhere.example/").unwrap();
        let err = selector(true).select(&url).unwrap_err();
        assert!(matches!(err, SchedulerError::UnsupportedUrl(_)));
    }

    #[test]
    fn test_select_str_rejects_garbage() {
        let s = selector(true);
        assert!(matches!(s.select_str("not a url"), Err(SchedulerError::InvalidUrl { .. })));
        assert!(matches!(s.select_str("ftp://x.com/file"), Err(SchedulerError::UnsupportedUrl(_))));
    }

    #[test]
    fn test_default_registry_routing() {
        let cfg = SchedulerConfig::default();
        let s = StrategySelector::with_defaults(&cfg);

        let direct = s.select(&Url::parse("https://example.com/file.mp3").unwrap()).unwrap();
        assert_eq!(direct.primary.name(), "http");
        assert_eq!(direct.fallback.map(|f| f.name().to_string()), Some("yt-dlp".to_string()));

        let tweet = s.select(&Url::parse("https://twitter.com/u/status/1").unwrap()).unwrap();
        assert_eq!(tweet.primary.name(), "gallery-dl");

        let yt = s.select(&Url::parse("https://www.youtube.com/watch?v=1").unwrap()).unwrap();
        assert_eq!(yt.primary.name(), "yt-dlp");
        assert!(yt.fallback.is_none());
    }

    #[test]
    fn test_mime_from_extension() {
        assert_eq!(mime_from_extension(Path::new("a.mp3")), Some("audio/mpeg".to_string()));
        assert_eq!(mime_from_extension(Path::new("a.JPG")), Some("image/jpeg".to_string()));
        assert_eq!(mime_from_extension(Path::new("a.xyz")), None);
    }

    #[test]
    fn test_files_with_stem_skips_partials() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("abc.mp4"), b"12345").unwrap();
        std::fs::write(dir.path().join("abc.mp4.part"), b"1").unwrap();
        std::fs::write(dir.path().join("other.mp4"), b"1").unwrap();
        let found = files_with_stem(dir.path(), "abc").unwrap();
        assert_eq!(found, vec![(dir.path().join("abc.mp4"), 5)]);
    }
}
