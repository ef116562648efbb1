//! Mock download strategy for scheduler tests
//!
//! Simulates downloads with a configurable delay, outcome and size, and
//! records how many calls ran and how many overlapped.

#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;

use boss_dl::download::source::{DownloadOutput, DownloadRequest, DownloadStrategy, SourceProgress, StrategyMode};
use boss_dl::download::DownloadError;

/// Configuration for the mock strategy
#[derive(Debug, Clone)]
pub struct MockStrategyConfig {
    pub name: &'static str,
    pub mode: StrategyMode,
    /// Host this strategy claims; `None` accepts every http(s) URL
    pub host: Option<&'static str>,
    /// Simulated download time
    pub delay: Duration,
    /// Error returned instead of a file
    pub error: Option<DownloadError>,
    /// Size reported by `estimate_size` and written by `download`
    pub file_size: u64,
    /// Time `estimate_size` takes to answer
    pub estimate_delay: Duration,
}

impl Default for MockStrategyConfig {
    fn default() -> Self {
        Self {
            name: "mock",
            mode: StrategyMode::Cli,
            host: None,
            delay: Duration::from_millis(10),
            error: None,
            file_size: 1_000,
            estimate_delay: Duration::ZERO,
        }
    }
}

impl MockStrategyConfig {
    pub fn api(name: &'static str) -> Self {
        Self {
            name,
            mode: StrategyMode::Api,
            ..Self::default()
        }
    }

    pub fn cli(name: &'static str) -> Self {
        Self {
            name,
            mode: StrategyMode::Cli,
            ..Self::default()
        }
    }

    pub fn failing(mut self, error: DownloadError) -> Self {
        self.error = Some(error);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_size(mut self, bytes: u64) -> Self {
        self.file_size = bytes;
        self
    }

    pub fn with_estimate_delay(mut self, delay: Duration) -> Self {
        self.estimate_delay = delay;
        self
    }

    pub fn for_host(mut self, host: &'static str) -> Self {
        self.host = Some(host);
        self
    }
}

/// Mock strategy with call counters
pub struct MockStrategy {
    config: MockStrategyConfig,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockStrategy {
    pub fn new(config: MockStrategyConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        })
    }

    /// Number of `download` calls so far
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of overlapping `download` calls seen
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DownloadStrategy for MockStrategy {
    fn name(&self) -> &str {
        self.config.name
    }

    fn mode(&self) -> StrategyMode {
        self.config.mode
    }

    fn supports(&self, url: &Url) -> bool {
        match self.config.host {
            Some(host) => url.host_str() == Some(host),
            None => matches!(url.scheme(), "http" | "https"),
        }
    }

    async fn estimate_size(&self, _url: &Url) -> Option<u64> {
        if !self.config.estimate_delay.is_zero() {
            tokio::time::sleep(self.config.estimate_delay).await;
        }
        Some(self.config.file_size)
    }

    async fn download(
        &self,
        request: &DownloadRequest,
        progress_tx: mpsc::UnboundedSender<SourceProgress>,
        cancel: &CancellationToken,
    ) -> Result<DownloadOutput, DownloadError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let outcome = tokio::select! {
            _ = tokio::time::sleep(self.config.delay) => Ok(()),
            _ = cancel.cancelled() => Err(DownloadError::Cancelled),
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        outcome?;

        if let Some(error) = &self.config.error {
            return Err(error.clone());
        }

        let _ = progress_tx.send(SourceProgress {
            percent: 100,
            speed_bytes_sec: None,
            eta_seconds: None,
            downloaded_bytes: Some(self.config.file_size),
            total_bytes: Some(self.config.file_size),
        });

        Ok(DownloadOutput {
            file_path: request.output_dir.join(format!("{}.bin", request.file_stem())),
            file_size: self.config.file_size,
            mime_hint: None,
        })
    }
}
