//! Logging initialization and configuration checking
//!
//! This module provides:
//! - Logger initialization (console + file)
//! - Startup diagnostics for the download tools and limits

use anyhow::Result;
use simplelog::*;
use std::fs::File;
use std::path::{Path, PathBuf};

use crate::core::config::{self, SchedulerConfig};

/// Maps a level name to a filter, falling back to `Info`.
pub fn parse_level(raw: &str) -> LevelFilter {
    match raw.trim().to_lowercase().as_str() {
        "off" => LevelFilter::Off,
        "error" => LevelFilter::Error,
        "warn" | "warning" => LevelFilter::Warn,
        "debug" => LevelFilter::Debug,
        "trace" => LevelFilter::Trace,
        _ => LevelFilter::Info,
    }
}

/// Initialize logger for both console and file output
///
/// # Arguments
/// * `log_file_path` - Path to the log file
/// * `level` - Level name, see [`parse_level`]
///
/// # Returns
/// * `Ok(())` - Logger initialized successfully
/// * `Err(anyhow::Error)` - Failed to create the file or a logger was already set
pub fn init_logger(log_file_path: &str, level: &str) -> Result<()> {
    let log_file = File::create(log_file_path).map_err(|e| anyhow::anyhow!("Failed to create log file: {}", e))?;
    let level = parse_level(level);

    CombinedLogger::init(vec![
        TermLogger::new(level, Config::default(), TerminalMode::Mixed, ColorChoice::Auto),
        WriteLogger::new(level, Config::default(), log_file),
    ])
    .map_err(|e| anyhow::anyhow!("Failed to initialize logger: {}", e))?;

    Ok(())
}

/// Looks a binary up the way a shell would: absolute/relative paths as-is,
/// bare names through `PATH`.
pub fn find_binary(bin: &str) -> Option<PathBuf> {
    let candidate = Path::new(bin);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(bin))
        .find(|full| full.is_file())
}

/// Logs the effective limits and whether the CLI tools are reachable.
///
/// Missing tools are not fatal: API-mode downloads still work, CLI-mode
/// downloads will fail with a process error.
pub fn log_startup_configuration(cfg: &SchedulerConfig) {
    log::info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    log::info!("⚙️  Scheduler configuration");
    log::info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    log::info!("   queue size:         {}", cfg.max_queue_size);
    log::info!("   concurrent:         {}", cfg.max_concurrent_downloads);
    log::info!("   per-user in flight: {}", cfg.max_user_concurrent);
    log::info!("   file cap:           {} MB", cfg.max_file_bytes / (1024 * 1024));
    log::info!("   user storage:       {} MB", cfg.max_user_bytes / (1024 * 1024));
    log::info!("   fallback:           {}", cfg.fallback_enabled);
    log::info!("   download dir:       {}", cfg.download_dir.display());

    for (name, bin) in [("yt-dlp", config::YTDL_BIN.as_str()), ("gallery-dl", config::GALLERY_DL_BIN.as_str())] {
        match find_binary(bin) {
            Some(path) => log::info!("✅ {}: {}", name, path.display()),
            None => log::warn!("⚠️  {} not found ({}), CLI downloads through it will fail", name, bin),
        }
    }
}
