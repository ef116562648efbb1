use std::fmt;

/// Structured error type for download operations.
///
/// Categorized variants so the worker can decide about fallback and
/// metrics can be labelled by cause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadError {
    /// External tool failures (binary not found, bad exit code)
    Process(String),
    /// HTTP request or stream failures
    Http(String),
    /// Download did not finish in time
    Timeout(String),
    /// Output would exceed the per-file cap
    FileTooLarge { size: u64, limit: u64 },
    /// Expected file not found after the tool exited
    FileNotFound(String),
    /// Cancelled by the requester or by shutdown
    Cancelled,
    /// Local filesystem failures
    Io(String),
    /// Catch-all for uncategorized errors
    Other(String),
}

impl fmt::Display for DownloadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DownloadError::Process(msg) => write!(f, "{}", msg),
            DownloadError::Http(msg) => write!(f, "{}", msg),
            DownloadError::Timeout(msg) => write!(f, "{}", msg),
            DownloadError::FileTooLarge { size, limit } => {
                write!(f, "File exceeds maximum size: {} bytes > {} bytes", size, limit)
            }
            DownloadError::FileNotFound(msg) => write!(f, "{}", msg),
            DownloadError::Cancelled => write!(f, "Download cancelled"),
            DownloadError::Io(msg) => write!(f, "{}", msg),
            DownloadError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for DownloadError {}

impl DownloadError {
    /// Returns subcategory for metrics
    pub fn subcategory(&self) -> &'static str {
        match self {
            DownloadError::Process(_) => "process",
            DownloadError::Http(_) => "http",
            DownloadError::Timeout(_) => "timeout",
            DownloadError::FileTooLarge { .. } => "file_too_large",
            DownloadError::FileNotFound(_) => "file_not_found",
            DownloadError::Cancelled => "cancelled",
            DownloadError::Io(_) => "io",
            DownloadError::Other(_) => "other",
        }
    }

    /// Whether a second attempt through the fallback strategy makes sense.
    ///
    /// Cancellation is final and a size violation would repeat on any backend.
    pub fn allows_fallback(&self) -> bool {
        !matches!(self, DownloadError::Cancelled | DownloadError::FileTooLarge { .. })
    }
}

impl From<std::io::Error> for DownloadError {
    fn from(err: std::io::Error) -> Self {
        DownloadError::Io(err.to_string())
    }
}

impl From<reqwest::Error> for DownloadError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            DownloadError::Timeout(format!("HTTP request timed out: {}", err))
        } else {
            DownloadError::Http(format!("HTTP request failed: {}", err))
        }
    }
}

/// Plain strings become `DownloadError::Other`
impl From<String> for DownloadError {
    fn from(s: String) -> Self {
        DownloadError::Other(s)
    }
}

impl From<&str> for DownloadError {
    fn from(s: &str) -> Self {
        DownloadError::Other(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_download_error_display() {
        let err = DownloadError::Process("yt-dlp failed".into());
        assert_eq!(err.to_string(), "yt-dlp failed");

        let err = DownloadError::FileTooLarge { size: 11, limit: 10 };
        assert_eq!(err.to_string(), "File exceeds maximum size: 11 bytes > 10 bytes");
    }

    #[test]
    fn test_download_error_subcategory() {
        assert_eq!(DownloadError::Process("".into()).subcategory(), "process");
        assert_eq!(DownloadError::Http("".into()).subcategory(), "http");
        assert_eq!(DownloadError::Timeout("".into()).subcategory(), "timeout");
        assert_eq!(DownloadError::Cancelled.subcategory(), "cancelled");
        assert_eq!(DownloadError::Other("".into()).subcategory(), "other");
    }

    #[test]
    fn test_fallback_policy() {
        assert!(DownloadError::Http("503".into()).allows_fallback());
        assert!(DownloadError::Timeout("slow".into()).allows_fallback());
        assert!(!DownloadError::Cancelled.allows_fallback());
        assert!(!DownloadError::FileTooLarge { size: 2, limit: 1 }.allows_fallback());
    }

    #[test]
    fn test_from_string() {
        let err: DownloadError = "test error".to_string().into();
        assert!(matches!(err, DownloadError::Other(_)));
    }
}
