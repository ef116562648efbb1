use std::time::Duration;
use thiserror::Error;

use crate::download::error::DownloadError;

/// Typed rejection reasons surfaced to callers of the scheduler.
///
/// Every rejection of `enqueue`/`submit` is one of these variants, so the
/// command layer can render a reason instead of a backtrace.
///
/// # Example
///
/// ```no_run
/// use boss_dl::core::error::SchedulerError;
///
/// fn describe(err: &SchedulerError) -> &'static str {
///     err.reason()
/// }
/// ```
#[derive(Error, Debug)]
pub enum SchedulerError {
    /// Pending queue already holds `capacity` items
    #[error("Queue is full ({capacity} items)")]
    QueueFull { capacity: usize },

    /// All download slots are busy
    #[error("Concurrency limit reached ({limit} active downloads)")]
    ConcurrencyLimit { limit: usize },

    /// Storage, per-file or per-user concurrency budget exceeded
    #[error("Quota exceeded: {0}")]
    QuotaExceeded(QuotaViolation),

    /// No strategy handles the URL
    #[error("Unsupported URL: {0}")]
    UnsupportedUrl(String),

    /// URL could not be parsed
    #[error("Invalid URL '{url}': {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    /// Download failed after the fallback attempt
    #[error("Download failed: {0}")]
    DownloadFailed(#[from] DownloadError),

    /// Requester must wait before submitting again
    #[error("Rate limited, retry in {}s", retry_after.as_secs())]
    RateLimited { retry_after: Duration },

    /// Same requester already has this URL pending or active
    #[error("Duplicate request for {0}")]
    Duplicate(String),

    /// Scheduler is stopping and no longer accepts work
    #[error("Scheduler is shutting down")]
    ShuttingDown,
}

impl SchedulerError {
    /// Short label used for rejection metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            SchedulerError::QueueFull { .. } => "queue_full",
            SchedulerError::ConcurrencyLimit { .. } => "concurrency_limit",
            SchedulerError::QuotaExceeded(_) => "quota_exceeded",
            SchedulerError::UnsupportedUrl(_) => "unsupported_url",
            SchedulerError::InvalidUrl { .. } => "invalid_url",
            SchedulerError::DownloadFailed(_) => "download_failed",
            SchedulerError::RateLimited { .. } => "rate_limited",
            SchedulerError::Duplicate(_) => "duplicate",
            SchedulerError::ShuttingDown => "shutting_down",
        }
    }

    /// Whether the item went back to the queue and will be retried once
    /// capacity frees up.
    pub fn is_backpressure(&self) -> bool {
        matches!(
            self,
            SchedulerError::ConcurrencyLimit { .. }
                | SchedulerError::QuotaExceeded(QuotaViolation::TooManyActive { .. })
        )
    }
}

/// Which quota rule rejected a reservation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QuotaViolation {
    #[error("file of {size} bytes exceeds the {limit} byte cap")]
    FileTooLarge { size: u64, limit: u64 },

    #[error("{requested} more bytes would exceed storage limit ({used} of {limit} used)")]
    StorageLimit { requested: u64, used: u64, limit: u64 },

    #[error("{active} downloads already in flight (limit {limit})")]
    TooManyActive { active: usize, limit: usize },
}

/// Type alias for Result with SchedulerError
pub type SchedulerResult<T> = Result<T, SchedulerError>;
