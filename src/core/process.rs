//! Process execution utilities with timeout and cancellation support
//!
//! Helpers for running the external downloaders (yt-dlp, gallery-dl) so a
//! hung or cancelled process never holds a worker slot.

use std::collections::VecDeque;
use std::process::{ExitStatus, Output, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::download::error::DownloadError;

/// Lines of stderr kept for error analysis
const STDERR_TAIL_LINES: usize = 200;

/// Run an async Command with a timeout.
///
/// The child is killed when the timeout fires or `cancel` is triggered.
pub async fn run_with_timeout(
    cmd: &mut Command,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<Output, DownloadError> {
    cmd.kill_on_drop(true);
    tokio::select! {
        result = cmd.output() => result.map_err(|e| DownloadError::Process(format!("Failed to run process: {}", e))),
        _ = tokio::time::sleep(timeout) => Err(DownloadError::Timeout(format!(
            "Process timed out after {}s",
            timeout.as_secs()
        ))),
        _ = cancel.cancelled() => Err(DownloadError::Cancelled),
    }
}

async fn next_line<R>(lines: &mut Option<Lines<R>>) -> Option<String>
where
    R: AsyncBufRead + Unpin,
{
    lines.as_mut()?.next_line().await.ok().flatten()
}

/// Result of a streamed process run.
#[derive(Debug)]
pub struct StreamedOutput {
    pub status: ExitStatus,
    /// Last lines of stderr, oldest first
    pub stderr_tail: String,
}

/// Spawns the command and feeds every stdout/stderr line to `on_line`.
///
/// Used for tools that print progress while they work. The child is killed on
/// timeout or cancellation.
pub async fn run_with_progress<F>(
    cmd: &mut Command,
    timeout: Duration,
    cancel: &CancellationToken,
    mut on_line: F,
) -> Result<StreamedOutput, DownloadError>
where
    F: FnMut(&str),
{
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped()).kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .map_err(|e| DownloadError::Process(format!("Failed to spawn process: {}", e)))?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let run = async {
        let mut stdout_lines = stdout.map(|s| BufReader::new(s).lines());
        let mut stderr_lines = stderr.map(|s| BufReader::new(s).lines());
        let mut stdout_open = stdout_lines.is_some();
        let mut stderr_open = stderr_lines.is_some();
        let mut tail: VecDeque<String> = VecDeque::new();

        loop {
            tokio::select! {
                line = next_line(&mut stdout_lines), if stdout_open => match line {
                    Some(line) => {
                        log::debug!("process stdout: {}", line);
                        on_line(&line);
                    }
                    None => stdout_open = false,
                },
                line = next_line(&mut stderr_lines), if stderr_open => match line {
                    Some(line) => {
                        log::debug!("process stderr: {}", line);
                        on_line(&line);
                        tail.push_back(line);
                        if tail.len() > STDERR_TAIL_LINES {
                            tail.pop_front();
                        }
                    }
                    None => stderr_open = false,
                },
                else => break,
            }
        }

        let status = child.wait().await?;
        Ok::<_, std::io::Error>(StreamedOutput {
            status,
            stderr_tail: tail.into_iter().collect::<Vec<_>>().join("\n"),
        })
    };

    tokio::select! {
        result = run => result.map_err(|e| DownloadError::Process(format!("Process failed: {}", e))),
        _ = tokio::time::sleep(timeout) => {
            log::error!("Process timed out after {}s, killing", timeout.as_secs());
            Err(DownloadError::Timeout(format!("Process timed out after {}s", timeout.as_secs())))
        }
        _ = cancel.cancelled() => Err(DownloadError::Cancelled),
    }
}
