//! Bounded worker pool that runs queued items through download strategies.
//!
//! A semaphore permit is taken before an item leaves the queue and travels
//! with the spawned worker until it reports, so at most
//! `max_concurrent_downloads` items are ever active.

use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::config::SchedulerConfig;
use crate::core::error::{QuotaViolation, SchedulerError, SchedulerResult};
use crate::core::metrics;
use crate::core::types::Requester;
use crate::download::error::DownloadError;
use crate::download::queue::{QueueItem, QueueManager};
use crate::download::quota::{QuotaManager, Reservation};
use crate::download::source::{DownloadOutput, DownloadRequest, DownloadStrategy, SelectedStrategy, StrategySelector};

/// Outcome of one queue item, reported to the queue and returned to callers.
#[derive(Debug, Clone, Serialize)]
pub struct DownloadResult {
    pub item_id: Uuid,
    pub requester: Requester,
    pub success: bool,
    pub output_path: Option<PathBuf>,
    pub error: Option<String>,
    /// Bytes written by the successful attempt
    pub bytes: u64,
    pub duration: Duration,
    /// Strategy of the last attempt
    pub strategy: String,
    /// 1, or 2 when the fallback ran
    pub attempts: u32,
    pub cancelled: bool,
}

impl DownloadResult {
    /// Result for an item refused before any attempt ran.
    fn rejected(item: &QueueItem, err: &SchedulerError) -> Self {
        Self {
            item_id: item.id,
            requester: item.requester,
            success: false,
            output_path: None,
            error: Some(err.to_string()),
            bytes: 0,
            duration: Duration::ZERO,
            strategy: "none".to_string(),
            attempts: 0,
            cancelled: false,
        }
    }
}

pub struct DownloadManager {
    slots: Arc<Semaphore>,
    max_concurrent: usize,
    /// Items between dequeue and their final report
    running: AtomicUsize,
    idle: Notify,
    /// Cancelled by `close`; no new worker is spawned afterwards
    closing: CancellationToken,
    queue: Arc<QueueManager>,
    quota: Arc<QuotaManager>,
    selector: Arc<StrategySelector>,
    download_dir: PathBuf,
    download_timeout: Duration,
    estimate_timeout: Duration,
    poll_interval: Duration,
}

impl DownloadManager {
    pub fn new(
        config: &SchedulerConfig,
        queue: Arc<QueueManager>,
        quota: Arc<QuotaManager>,
        selector: Arc<StrategySelector>,
    ) -> Self {
        let max_concurrent = config.max_concurrent_downloads.max(1);
        Self {
            slots: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            running: AtomicUsize::new(0),
            idle: Notify::new(),
            closing: CancellationToken::new(),
            queue,
            quota,
            selector,
            download_dir: config.download_dir.clone(),
            download_timeout: config.download_timeout,
            estimate_timeout: config.estimate_timeout,
            poll_interval: config.poll_interval,
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Items taken from the queue that have not reported yet, including
    /// those still being dispatched.
    pub fn active_count(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    /// Stops the `run` loop and refuses to spawn workers for items that are
    /// still being dispatched. Those items go back to the queue.
    pub fn close(&self) {
        self.closing.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closing.is_cancelled()
    }

    fn worker_done(&self) {
        if self.running.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    /// Takes the next pending item whose requester is below the per-user
    /// concurrency cap. Items of saturated requesters keep their place.
    pub async fn next_item(&self) -> Option<QueueItem> {
        let busy = self.quota.saturated().await;
        self.queue.dequeue_next_excluding(&busy).await
    }

    /// Waits until every dispatched item has reported.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.running.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Starts a download for an item taken from the queue.
    ///
    /// Fails with `ConcurrencyLimit` when every slot is busy, and with
    /// `QuotaExceeded(TooManyActive)` when the requester is at its in-flight
    /// cap; in both cases the item goes back to the head of the queue.
    /// `UnsupportedUrl` and the byte quotas mark the item failed. After
    /// `close` the item is requeued and `ShuttingDown` returned. Otherwise the
    /// returned handle yields the [`DownloadResult`] once the worker has
    /// reported to the queue.
    pub async fn submit(self: &Arc<Self>, item: QueueItem) -> SchedulerResult<JoinHandle<DownloadResult>> {
        let permit = match self.slots.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                let err = SchedulerError::ConcurrencyLimit {
                    limit: self.max_concurrent,
                };
                log::warn!("⚠️ {} - returning {} to the queue", err, item.id);
                metrics::record_rejection(err.reason());
                self.queue.requeue_front(&item).await;
                return Err(err);
            }
        };
        self.dispatch(item, permit).await
    }

    async fn reject(&self, item: &QueueItem, err: SchedulerError) -> SchedulerError {
        log::warn!("❌ Rejected {} ({}): {}", item.id, item.url, err);
        metrics::record_rejection(err.reason());
        self.queue.complete(&DownloadResult::rejected(item, &err)).await;
        err
    }

    /// Returns an item to the head of the queue without failing it.
    async fn defer(&self, item: &QueueItem, err: SchedulerError) -> SchedulerError {
        log::debug!("{} - returning {} to the queue", err, item.id);
        metrics::record_rejection(err.reason());
        self.queue.requeue_front(item).await;
        err
    }

    async fn dispatch(
        self: &Arc<Self>,
        item: QueueItem,
        permit: OwnedSemaphorePermit,
    ) -> SchedulerResult<JoinHandle<DownloadResult>> {
        // Counted from here so `wait_idle` also covers the size estimate below
        self.running.fetch_add(1, Ordering::SeqCst);
        if self.closing.is_cancelled() {
            let err = self.defer(&item, SchedulerError::ShuttingDown).await;
            self.worker_done();
            return Err(err);
        }
        let outcome = self.prepare(&item).await;
        let (selected, reservation) = match outcome {
            Ok(prepared) => prepared,
            Err(e) => {
                self.worker_done();
                return Err(e);
            }
        };

        // Shutdown may have started while the size was being estimated
        if self.closing.is_cancelled() {
            self.quota.release(&reservation).await;
            let err = self.defer(&item, SchedulerError::ShuttingDown).await;
            self.worker_done();
            return Err(err);
        }

        log::info!(
            "Starting {} for {} via {} (reserved {} bytes, {}/{} slots busy)",
            item.id,
            item.requester,
            selected.primary.name(),
            reservation.bytes(),
            self.active_count(),
            self.max_concurrent
        );

        let manager = Arc::clone(self);
        Ok(tokio::spawn(async move {
            manager.run_worker(item, selected, reservation, permit).await
        }))
    }

    /// Resolves the strategy, estimates the size and reserves quota.
    async fn prepare(&self, item: &QueueItem) -> SchedulerResult<(SelectedStrategy, Reservation)> {
        let selected = match self.selector.select(&item.url) {
            Ok(selected) => selected,
            Err(e) => return Err(self.reject(item, e).await),
        };

        let estimate = tokio::time::timeout(self.estimate_timeout, selected.primary.estimate_size(&item.url))
            .await
            .ok()
            .flatten()
            .unwrap_or(0);

        match self.quota.reserve(item.requester, estimate).await {
            Ok(reservation) => Ok((selected, reservation)),
            Err(violation @ QuotaViolation::TooManyActive { .. }) => {
                Err(self.defer(item, SchedulerError::QuotaExceeded(violation)).await)
            }
            Err(violation) => Err(self.reject(item, SchedulerError::QuotaExceeded(violation)).await),
        }
    }

    /// Runs one strategy in its own task so a panic becomes an error.
    async fn attempt(
        &self,
        strategy: &Arc<dyn DownloadStrategy>,
        request: &DownloadRequest,
        cancel: &CancellationToken,
    ) -> Result<DownloadOutput, DownloadError> {
        if cancel.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }

        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
        let queue = Arc::clone(&self.queue);
        let item_id = request.item_id;
        let forwarder = tokio::spawn(async move {
            while let Some(progress) = progress_rx.recv().await {
                queue.publish_progress(item_id, &progress);
            }
        });

        let strategy = Arc::clone(strategy);
        let request = request.clone();
        let cancel = cancel.clone();
        let outcome = tokio::spawn(async move { strategy.download(&request, progress_tx, &cancel).await })
            .await
            .unwrap_or_else(|e| {
                log::error!("❌ Download task for {} panicked: {}", item_id, e);
                Err(DownloadError::Other(format!("Download task failed: {}", e)))
            });

        let _ = forwarder.await;
        outcome
    }

    async fn run_worker(
        self: Arc<Self>,
        item: QueueItem,
        selected: SelectedStrategy,
        reservation: Reservation,
        permit: OwnedSemaphorePermit,
    ) -> DownloadResult {
        metrics::set_active_downloads(self.active_count());
        let started = Instant::now();
        let request = DownloadRequest {
            item_id: item.id,
            url: item.url.clone(),
            output_dir: self.download_dir.clone(),
            max_file_size: Some(self.quota.limits().max_file_bytes),
            timeout: self.download_timeout,
        };

        let mut strategy = Arc::clone(&selected.primary);
        let mut attempts = 1;
        let mut outcome = self.attempt(&strategy, &request, &item.cancel).await;

        let retry = match (&outcome, &selected.fallback) {
            (Err(e), Some(fallback)) if e.allows_fallback() && !item.cancel.is_cancelled() => {
                log::warn!(
                    "⚠️ {} failed for {} ({}), retrying once with {}",
                    strategy.name(),
                    item.id,
                    e,
                    fallback.name()
                );
                metrics::record_download_failure(strategy.name(), e.subcategory());
                metrics::record_fallback(selected.platform.as_str());
                Some(Arc::clone(fallback))
            }
            _ => None,
        };
        if let Some(fallback) = retry {
            strategy = fallback;
            attempts += 1;
            outcome = self.attempt(&strategy, &request, &item.cancel).await;
        }

        let duration = started.elapsed();
        let result = match outcome {
            Ok(output) => {
                self.quota.commit(&reservation, output.file_size).await;
                metrics::record_download_success(strategy.name(), duration.as_secs_f64());
                log::info!(
                    "✅ {} finished via {} in {:.1}s: {} ({} bytes)",
                    item.id,
                    strategy.name(),
                    duration.as_secs_f64(),
                    output.file_path.display(),
                    output.file_size
                );
                DownloadResult {
                    item_id: item.id,
                    requester: item.requester,
                    success: true,
                    output_path: Some(output.file_path),
                    error: None,
                    bytes: output.file_size,
                    duration,
                    strategy: strategy.name().to_string(),
                    attempts,
                    cancelled: false,
                }
            }
            Err(e) => {
                self.quota.release(&reservation).await;
                metrics::record_download_failure(strategy.name(), e.subcategory());
                let cancelled = e == DownloadError::Cancelled;
                if cancelled {
                    log::info!("Download {} cancelled", item.id);
                } else {
                    log::error!("❌ {} failed via {} after {} attempt(s): {}", item.id, strategy.name(), attempts, e);
                }
                DownloadResult {
                    item_id: item.id,
                    requester: item.requester,
                    success: false,
                    output_path: None,
                    error: Some(e.to_string()),
                    bytes: 0,
                    duration,
                    strategy: strategy.name().to_string(),
                    attempts,
                    cancelled,
                }
            }
        };

        self.queue.complete(&result).await;
        drop(permit);
        self.worker_done();
        metrics::set_active_downloads(self.active_count());
        result
    }

    /// Worker-pool loop: waits for a free slot, then for an item, then
    /// dispatches. Returns after `close`; running workers finish on their own.
    pub async fn run(self: Arc<Self>) {
        let shutdown = self.closing.clone();
        log::info!("Download loop started with {} slots", self.max_concurrent);
        loop {
            if shutdown.is_cancelled() {
                break;
            }
            let permit = tokio::select! {
                permit = Arc::clone(&self.slots).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = shutdown.cancelled() => break,
            };

            let item = loop {
                if let Some(item) = self.next_item().await {
                    break Some(item);
                }
                tokio::select! {
                    _ = self.queue.notified() => {}
                    _ = tokio::time::sleep(self.poll_interval) => {}
                    _ = shutdown.cancelled() => break None,
                }
            };
            let Some(item) = item else {
                break;
            };

            if let Err(e) = self.dispatch(item, permit).await {
                log::debug!("Dispatch refused: {}", e);
            }
        }
        log::info!("Download loop stopped");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::core::types::ItemStatus;
    use crate::download::quota::{QuotaLimits, QuotaRecord};
    use crate::download::source::{SourceProgress, StrategyMode};
    use async_trait::async_trait;
    use url::Url;

    struct Scripted {
        name: &'static str,
        mode: StrategyMode,
        fail: bool,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(name: &'static str, mode: StrategyMode, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                name,
                mode,
                fail,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl DownloadStrategy for Scripted {
        fn name(&self) -> &str {
            self.name
        }

        fn mode(&self) -> StrategyMode {
            self.mode
        }

        fn supports(&self, url: &Url) -> bool {
            url.host_str() == Some("example.com")
        }

        async fn estimate_size(&self, _url: &Url) -> Option<u64> {
            Some(10)
        }

        async fn download(
            &self,
            request: &DownloadRequest,
            progress_tx: mpsc::UnboundedSender<SourceProgress>,
            _cancel: &CancellationToken,
        ) -> Result<DownloadOutput, DownloadError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let _ = progress_tx.send(SourceProgress {
                percent: 100,
                speed_bytes_sec: None,
                eta_seconds: None,
                downloaded_bytes: Some(10),
                total_bytes: Some(10),
            });
            if self.fail {
                return Err(DownloadError::Http("503".into()));
            }
            Ok(DownloadOutput {
                file_path: request.output_dir.join(request.file_stem()),
                file_size: 10,
                mime_hint: None,
            })
        }
    }

    fn setup(
        strategies: Vec<Arc<dyn DownloadStrategy>>,
        max_concurrent: usize,
    ) -> (Arc<DownloadManager>, Arc<QueueManager>, Arc<QuotaManager>) {
        let config = SchedulerConfig::default()
            .max_concurrent_downloads(max_concurrent)
            .download_dir(std::env::temp_dir());
        let queue = Arc::new(QueueManager::new(10, 10));
        let quota = Arc::new(QuotaManager::new(QuotaLimits::from(&config)));
        let mut selector = StrategySelector::from_config(&config);
        for s in strategies {
            selector.register(s);
        }
        let manager = Arc::new(DownloadManager::new(
            &config,
            Arc::clone(&queue),
            Arc::clone(&quota),
            Arc::new(selector),
        ));
        (manager, queue, quota)
    }

    #[tokio::test]
    async fn test_submit_success_commits_quota() {
        let ok = Scripted::new("api", StrategyMode::Api, false);
        let (manager, queue, quota) = setup(vec![ok.clone()], 2);
        queue
            .enqueue(Url::parse("https://example.com/a").unwrap(), Requester(1))
            .await
            .unwrap();
        let item = queue.dequeue_next().await.unwrap();

        let result = manager.submit(item.clone()).await.unwrap().await.unwrap();
        assert!(result.success);
        assert_eq!(result.attempts, 1);
        assert_eq!(queue.get(item.id).await.unwrap().status, ItemStatus::Done);
        assert_eq!(quota.usage(Requester(1)).await.bytes_used, 10);
        assert_eq!(manager.active_count(), 0);
    }

    #[tokio::test]
    async fn test_api_failure_falls_back_exactly_once() {
        let api = Scripted::new("api", StrategyMode::Api, true);
        let cli = Scripted::new("cli", StrategyMode::Cli, true);
        let (manager, queue, quota) = setup(vec![api.clone(), cli.clone()], 2);
        queue
            .enqueue(Url::parse("https://example.com/a").unwrap(), Requester(1))
            .await
            .unwrap();
        let item = queue.dequeue_next().await.unwrap();

        let result = manager.submit(item.clone()).await.unwrap().await.unwrap();
        assert!(!result.success);
        assert_eq!(result.attempts, 2);
        assert_eq!(result.strategy, "cli");
        assert_eq!(api.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cli.calls.load(Ordering::SeqCst), 1);
        assert_eq!(queue.get(item.id).await.unwrap().status, ItemStatus::Failed);
        assert_eq!(quota.usage(Requester(1)).await, QuotaRecord::default());
    }

    #[tokio::test]
    async fn test_unsupported_url_marks_failed() {
        let (manager, queue, _) = setup(vec![Scripted::new("api", StrategyMode::Api, false)], 1);
        queue
            .enqueue(Url::parse("https://other.org/a").unwrap(), Requester(1))
            .await
            .unwrap();
        let item = queue.dequeue_next().await.unwrap();

        let err = manager.submit(item.clone()).await.unwrap_err();
        assert!(matches!(err, SchedulerError::UnsupportedUrl(_)));
        assert_eq!(queue.get(item.id).await.unwrap().status, ItemStatus::Failed);
        assert_eq!(manager.active_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrency_limit_requeues_item() {
        let (manager, queue, _) = setup(vec![Scripted::new("api", StrategyMode::Api, false)], 1);
        queue
            .enqueue(Url::parse("https://example.com/a").unwrap(), Requester(1))
            .await
            .unwrap();
        let item = queue.dequeue_next().await.unwrap();

        let _busy = Arc::clone(&manager.slots).try_acquire_owned().unwrap();
        let err = manager.submit(item.clone()).await.unwrap_err();
        assert!(matches!(err, SchedulerError::ConcurrencyLimit { limit: 1 }));
        assert_eq!(queue.position(item.id).await, Some(1));
    }

    #[tokio::test]
    async fn test_requester_at_cap_is_requeued_not_failed() {
        let ok = Scripted::new("api", StrategyMode::Api, false);
        let (manager, queue, quota) = setup(vec![ok.clone()], 10);
        let cap = quota.limits().max_user_concurrent;
        let mut held = Vec::new();
        for _ in 0..cap {
            held.push(quota.reserve(Requester(1), 0).await.unwrap());
        }
        queue
            .enqueue(Url::parse("https://example.com/a").unwrap(), Requester(1))
            .await
            .unwrap();
        let item = queue.dequeue_next().await.unwrap();

        let err = manager.submit(item.clone()).await.unwrap_err();
        assert!(matches!(
            err,
            SchedulerError::QuotaExceeded(QuotaViolation::TooManyActive { .. })
        ));
        assert!(err.is_backpressure());
        assert_eq!(queue.get(item.id).await.unwrap().status, ItemStatus::Pending);
        assert_eq!(queue.position(item.id).await, Some(1));
        assert_eq!(manager.active_count(), 0);
        assert_eq!(ok.calls.load(Ordering::SeqCst), 0);

        // Held back while the requester is saturated
        assert!(manager.next_item().await.is_none());
        quota.release(&held[0]).await;
        let item = manager.next_item().await.unwrap();
        let result = manager.submit(item).await.unwrap().await.unwrap();
        assert!(result.success);
    }

    #[tokio::test]
    async fn test_closed_manager_requeues_without_spawning() {
        let ok = Scripted::new("api", StrategyMode::Api, false);
        let (manager, queue, quota) = setup(vec![ok.clone()], 2);
        queue
            .enqueue(Url::parse("https://example.com/a").unwrap(), Requester(1))
            .await
            .unwrap();
        let item = queue.dequeue_next().await.unwrap();

        manager.close();
        let err = manager.submit(item.clone()).await.unwrap_err();
        assert!(matches!(err, SchedulerError::ShuttingDown));
        assert_eq!(queue.get(item.id).await.unwrap().status, ItemStatus::Pending);
        assert_eq!(ok.calls.load(Ordering::SeqCst), 0);
        assert_eq!(manager.active_count(), 0);
        assert_eq!(quota.usage(Requester(1)).await, QuotaRecord::default());
    }
}
