//! Classification of CLI downloader failures (yt-dlp, gallery-dl).
//!
//! The tools only report problems on stderr, so the worker needs a best
//! effort mapping from text to a [`DownloadError`] category.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::download::error::DownloadError;

/// Coarse failure kinds seen in tool output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolErrorType {
    /// Site demands login or cookies
    AuthRequired,
    /// Private, removed or geo-blocked content
    Unavailable,
    /// Timeouts, DNS, connection resets
    NetworkError,
    /// The tool refused the file because of `--max-filesize`/`--filesize-max`
    TooLarge,
    /// URL not recognised by any extractor
    Unsupported,
    Unknown,
}

#[allow(clippy::unwrap_used)]
static MAX_FILESIZE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\((\d+) bytes > (\d+) bytes\)").unwrap());

/// Analyzes tool stderr and determines the error type.
pub fn analyze_tool_error(stderr: &str) -> ToolErrorType {
    let lower = stderr.to_lowercase();

    if lower.contains("larger than max-filesize") || lower.contains("file size larger than") {
        return ToolErrorType::TooLarge;
    }

    if lower.contains("sign in to confirm")
        || lower.contains("please sign in")
        || lower.contains("login required")
        || lower.contains("use --cookies")
        || lower.contains("authorizationerror")
    {
        return ToolErrorType::AuthRequired;
    }

    if lower.contains("private video")
        || lower.contains("video unavailable")
        || lower.contains("has been removed")
        || lower.contains("does not exist")
        || lower.contains("http error 404")
        || lower.contains("not available in your country")
    {
        return ToolErrorType::Unavailable;
    }

    if lower.contains("unsupported url") || lower.contains("no suitable extractor") {
        return ToolErrorType::Unsupported;
    }

    if lower.contains("timed out")
        || lower.contains("timeout")
        || lower.contains("connection")
        || lower.contains("network")
        || lower.contains("temporary failure in name resolution")
        || lower.contains("failed to connect")
    {
        return ToolErrorType::NetworkError;
    }

    ToolErrorType::Unknown
}

/// Extracts `(size, limit)` from yt-dlp's max-filesize message.
pub fn parse_size_violation(output: &str) -> Option<(u64, u64)> {
    let caps = MAX_FILESIZE_RE.captures(output)?;
    let size = caps.get(1)?.as_str().parse().ok()?;
    let limit = caps.get(2)?.as_str().parse().ok()?;
    Some((size, limit))
}

/// Builds the error reported for a failed tool run.
///
/// `limit` is the cap passed to the tool; used when the tool did not print
/// exact numbers.
pub fn tool_failure(tool: &str, stderr: &str, limit: Option<u64>) -> DownloadError {
    let last_line = stderr
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("no output")
        .trim();

    match analyze_tool_error(stderr) {
        ToolErrorType::TooLarge => {
            let (size, limit) = parse_size_violation(stderr)
                .unwrap_or_else(|| (limit.unwrap_or(0).saturating_add(1), limit.unwrap_or(0)));
            DownloadError::FileTooLarge { size, limit }
        }
        ToolErrorType::NetworkError => DownloadError::Http(format!("{} network error: {}", tool, last_line)),
        kind => DownloadError::Process(format!("{} failed ({:?}): {}", tool, kind, last_line)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_analyze_auth() {
        assert_eq!(
            analyze_tool_error("ERROR: Sign in to confirm you're not a bot"),
            ToolErrorType::AuthRequired
        );
    }

    #[test]
    fn test_analyze_unavailable() {
        assert_eq!(analyze_tool_error("ERROR: Private video"), ToolErrorType::Unavailable);
        assert_eq!(analyze_tool_error("HTTP Error 404: Not Found"), ToolErrorType::Unavailable);
    }

    #[test]
    fn test_analyze_network() {
        assert_eq!(
            analyze_tool_error("urlopen error [Errno -3] Temporary failure in name resolution"),
            ToolErrorType::NetworkError
        );
    }

    #[test]
    fn test_analyze_unknown() {
        assert_eq!(analyze_tool_error("something odd"), ToolErrorType::Unknown);
    }

    #[test]
    fn test_size_violation_parsed() {
        let line = "[download] File is larger than max-filesize (53687091 bytes > 52428800 bytes). Aborting.";
        assert_eq!(analyze_tool_error(line), ToolErrorType::TooLarge);
        assert_eq!(parse_size_violation(line), Some((53687091, 52428800)));
        assert_eq!(
            tool_failure("yt-dlp", line, Some(52428800)),
            DownloadError::FileTooLarge {
                size: 53687091,
                limit: 52428800
            }
        );
    }

    #[test]
    fn test_tool_failure_uses_last_line() {
        let err = tool_failure("gallery-dl", "[info] start\nERROR: boom\n\n", None);
        assert_eq!(err, DownloadError::Process("gallery-dl failed (Unknown): ERROR: boom".into()));
    }
}
