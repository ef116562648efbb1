use once_cell::sync::Lazy;
use std::collections::HashSet;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::download::source::Platform;

/// yt-dlp binary path
/// Read once at startup from YTDL_BIN environment variable or defaults to "yt-dlp"
pub static YTDL_BIN: Lazy<String> = Lazy::new(|| env::var("YTDL_BIN").unwrap_or_else(|_| "yt-dlp".to_string()));

/// gallery-dl binary path
/// Read from GALLERY_DL_BIN environment variable, defaults to "gallery-dl"
pub static GALLERY_DL_BIN: Lazy<String> =
    Lazy::new(|| env::var("GALLERY_DL_BIN").unwrap_or_else(|_| "gallery-dl".to_string()));

/// Download folder path
/// Read from DOWNLOAD_FOLDER environment variable
/// Supports tilde (~) expansion for home directory
pub static DOWNLOAD_FOLDER: Lazy<String> =
    Lazy::new(|| env::var("DOWNLOAD_FOLDER").unwrap_or_else(|_| "~/downloads/boss-dl".to_string()));

/// Log file path
/// Read from LOG_FILE_PATH environment variable
/// Default: boss-dl.log
pub static LOG_FILE_PATH: Lazy<String> =
    Lazy::new(|| env::var("LOG_FILE_PATH").unwrap_or_else(|_| "boss-dl.log".to_string()));

/// Log level name ("error", "warn", "info", "debug", "trace")
pub static LOG_LEVEL: Lazy<String> = Lazy::new(|| env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()));

/// Queue configuration
pub mod queue {
    use super::Duration;

    /// Maximum number of pending items
    pub const MAX_QUEUE_SIZE: usize = 50;

    /// Maximum number of concurrent downloads
    pub const MAX_CONCURRENT_DOWNLOADS: usize = 5;

    /// Interval between queue checks when no wake-up arrives (in milliseconds)
    pub const CHECK_INTERVAL_MS: u64 = 100;

    /// Number of finished items kept for status lookups
    pub const HISTORY_LIMIT: usize = 200;

    /// Pending items older than this are cancelled by the sweep (in hours)
    pub const STALE_ITEM_HOURS: i64 = 24;

    /// How often the stale-item sweep runs (in seconds)
    pub const STALE_SWEEP_INTERVAL_SECS: u64 = 600;

    /// Queue check interval duration
    pub fn check_interval() -> Duration {
        Duration::from_millis(CHECK_INTERVAL_MS)
    }

    pub fn stale_sweep_interval() -> Duration {
        Duration::from_secs(STALE_SWEEP_INTERVAL_SECS)
    }
}

/// Download configuration
pub mod download {
    use super::Duration;

    /// Timeout for a single strategy attempt (in seconds)
    pub const TIMEOUT_SECS: u64 = 240;

    /// Timeout for size estimates before a download starts (in seconds)
    pub const ESTIMATE_TIMEOUT_SECS: u64 = 15;

    /// Whether API failures are retried once through the CLI strategy
    pub const FALLBACK_ENABLED: bool = true;

    pub fn timeout() -> Duration {
        Duration::from_secs(TIMEOUT_SECS)
    }

    pub fn estimate_timeout() -> Duration {
        Duration::from_secs(ESTIMATE_TIMEOUT_SECS)
    }
}

/// Quota configuration
pub mod quota {
    const MIB: u64 = 1024 * 1024;

    /// Per-file cap (50 MB)
    pub const MAX_FILE_BYTES: u64 = 50 * MIB;

    /// Per-user storage budget (1 GB)
    pub const MAX_USER_BYTES: u64 = 1024 * MIB;

    /// Downloads a single user may have in flight
    pub const MAX_USER_CONCURRENT: usize = 3;
}

/// Rate limiting configuration
pub mod rate_limit {
    use super::Duration;

    /// Duration between enqueues per user (in seconds)
    pub const COOLDOWN_SECONDS: u64 = 5;

    /// How often expired entries are purged (in seconds)
    pub const CLEANUP_INTERVAL_SECS: u64 = 300;

    /// Rate limit duration
    pub fn duration() -> Duration {
        Duration::from_secs(COOLDOWN_SECONDS)
    }
}

/// Expands `~` in a configured folder path.
pub fn expand_path(raw: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(raw).to_string())
}

/// Runtime settings for the scheduler and its managers.
///
/// `Default` carries the documented limits; `from_env()` lets deployments
/// override them without a rebuild. Setters follow the builder style so tests
/// can tighten single limits.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_queue_size: usize,
    pub max_concurrent_downloads: usize,
    pub max_file_bytes: u64,
    pub max_user_bytes: u64,
    pub max_user_concurrent: usize,
    pub fallback_enabled: bool,
    /// Platforms allowed to use API mode. `None` means all of them.
    pub api_platforms: Option<HashSet<Platform>>,
    pub rate_limit_cooldown: Duration,
    pub download_timeout: Duration,
    pub estimate_timeout: Duration,
    pub poll_interval: Duration,
    pub history_limit: usize,
    pub download_dir: PathBuf,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_queue_size: queue::MAX_QUEUE_SIZE,
            max_concurrent_downloads: queue::MAX_CONCURRENT_DOWNLOADS,
            max_file_bytes: quota::MAX_FILE_BYTES,
            max_user_bytes: quota::MAX_USER_BYTES,
            max_user_concurrent: quota::MAX_USER_CONCURRENT,
            fallback_enabled: download::FALLBACK_ENABLED,
            api_platforms: None,
            rate_limit_cooldown: rate_limit::duration(),
            download_timeout: download::timeout(),
            estimate_timeout: download::estimate_timeout(),
            poll_interval: queue::check_interval(),
            history_limit: queue::HISTORY_LIMIT,
            download_dir: expand_path(&DOWNLOAD_FOLDER),
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let raw = env::var(key).ok()?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("⚠️  Ignoring invalid value for {}: {:?}", key, raw);
            None
        }
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parses a comma/space separated platform list. Unknown names are skipped.
pub fn parse_platforms(raw: &str) -> HashSet<Platform> {
    raw.split([',', ' ', '\n', '\t'])
        .filter(|part| !part.trim().is_empty())
        .filter_map(|part| match part.trim().parse::<Platform>() {
            Ok(p) => Some(p),
            Err(_) => {
                log::warn!("⚠️  Unknown platform in BOSS_API_PLATFORMS: {}", part);
                None
            }
        })
        .collect()
}

impl SchedulerConfig {
    /// Creates a config with default limits.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads overrides from `BOSS_*` environment variables on top of the defaults.
    pub fn from_env() -> Self {
        const MIB: u64 = 1024 * 1024;
        let mut cfg = Self::default();

        if let Some(v) = env_parse("BOSS_MAX_QUEUE_SIZE") {
            cfg.max_queue_size = v;
        }
        if let Some(v) = env_parse("BOSS_MAX_CONCURRENT") {
            cfg.max_concurrent_downloads = v;
        }
        if let Some(v) = env_parse::<u64>("BOSS_MAX_FILE_MB") {
            cfg.max_file_bytes = v * MIB;
        }
        if let Some(v) = env_parse::<u64>("BOSS_MAX_USER_MB") {
            cfg.max_user_bytes = v * MIB;
        }
        if let Some(v) = env_parse("BOSS_MAX_USER_CONCURRENT") {
            cfg.max_user_concurrent = v;
        }
        if let Ok(raw) = env::var("BOSS_FALLBACK") {
            match parse_bool(&raw) {
                Some(v) => cfg.fallback_enabled = v,
                None => log::warn!("⚠️  Ignoring invalid value for BOSS_FALLBACK: {:?}", raw),
            }
        }
        if let Ok(raw) = env::var("BOSS_API_PLATFORMS") {
            cfg.api_platforms = Some(parse_platforms(&raw));
        }
        if let Some(v) = env_parse("BOSS_RATE_LIMIT_SECS") {
            cfg.rate_limit_cooldown = Duration::from_secs(v);
        }
        if let Some(v) = env_parse("BOSS_DOWNLOAD_TIMEOUT_SECS") {
            cfg.download_timeout = Duration::from_secs(v);
        }

        cfg
    }

    #[must_use]
    pub fn max_queue_size(mut self, size: usize) -> Self {
        self.max_queue_size = size;
        self
    }

    #[must_use]
    pub fn max_concurrent_downloads(mut self, max: usize) -> Self {
        self.max_concurrent_downloads = max;
        self
    }

    #[must_use]
    pub fn max_file_bytes(mut self, bytes: u64) -> Self {
        self.max_file_bytes = bytes;
        self
    }

    #[must_use]
    pub fn max_user_bytes(mut self, bytes: u64) -> Self {
        self.max_user_bytes = bytes;
        self
    }

    #[must_use]
    pub fn max_user_concurrent(mut self, max: usize) -> Self {
        self.max_user_concurrent = max;
        self
    }

    #[must_use]
    pub fn fallback_enabled(mut self, enabled: bool) -> Self {
        self.fallback_enabled = enabled;
        self
    }

    #[must_use]
    pub fn api_platforms(mut self, platforms: impl IntoIterator<Item = Platform>) -> Self {
        self.api_platforms = Some(platforms.into_iter().collect());
        self
    }

    #[must_use]
    pub fn rate_limit_cooldown(mut self, cooldown: Duration) -> Self {
        self.rate_limit_cooldown = cooldown;
        self
    }

    #[must_use]
    pub fn download_timeout(mut self, timeout: Duration) -> Self {
        self.download_timeout = timeout;
        self
    }

    #[must_use]
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    #[must_use]
    pub fn history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    #[must_use]
    pub fn download_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.download_dir = dir.into();
        self
    }

    /// Whether API mode may be used for the platform.
    pub fn api_allowed(&self, platform: Platform) -> bool {
        self.api_platforms
            .as_ref()
            .map(|set| set.contains(&platform))
            .unwrap_or(true)
    }
}
