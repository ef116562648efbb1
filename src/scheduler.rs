//! Consumer-facing facade wiring queue, worker pool, quotas and strategies.
//!
//! Everything is constructed here and handed around as `Arc`s; nothing is a
//! global. Requests are validated, rate limited and de-duplicated before they
//! reach the queue.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::config::{self, SchedulerConfig};
use crate::core::error::{SchedulerError, SchedulerResult};
use crate::core::metrics;
use crate::core::rate_limiter::RateLimiter;
use crate::core::types::{Requester, TaskPriority};
use crate::download::manager::DownloadManager;
use crate::download::queue::{QueueEvent, QueueItem, QueueManager};
use crate::download::quota::{QuotaLimits, QuotaManager, QuotaRecord};
use crate::download::source::StrategySelector;

/// Status reply for `status` commands.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub paused: bool,
    pub pending: Vec<QueueItem>,
    pub active: Vec<QueueItem>,
    /// Finished items still kept in history
    pub finished: usize,
    pub queue_capacity: usize,
    pub max_concurrent: usize,
}

pub struct Scheduler {
    config: SchedulerConfig,
    queue: Arc<QueueManager>,
    manager: Arc<DownloadManager>,
    quota: Arc<QuotaManager>,
    selector: Arc<StrategySelector>,
    rate_limiter: Arc<RateLimiter>,
    shutdown: CancellationToken,
    closed: AtomicBool,
}

impl Scheduler {
    /// Scheduler with the built-in HTTP, gallery-dl and yt-dlp strategies.
    pub fn new(config: SchedulerConfig) -> Self {
        let selector = StrategySelector::with_defaults(&config);
        Self::with_selector(config, selector)
    }

    /// Scheduler with a custom strategy set.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use boss_dl::core::config::SchedulerConfig;
    /// use boss_dl::download::source::StrategySelector;
    /// use boss_dl::scheduler::Scheduler;
    ///
    /// let config = SchedulerConfig::from_env();
    /// let selector = StrategySelector::with_defaults(&config);
    /// let scheduler = Scheduler::with_selector(config, selector);
    /// ```
    pub fn with_selector(config: SchedulerConfig, selector: StrategySelector) -> Self {
        let queue = Arc::new(QueueManager::new(config.max_queue_size, config.history_limit));
        let quota = Arc::new(QuotaManager::new(QuotaLimits::from(&config)));
        let selector = Arc::new(selector);
        let manager = Arc::new(DownloadManager::new(
            &config,
            Arc::clone(&queue),
            Arc::clone(&quota),
            Arc::clone(&selector),
        ));
        let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit_cooldown));

        Self {
            config,
            queue,
            manager,
            quota,
            selector,
            rate_limiter,
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn queue(&self) -> &Arc<QueueManager> {
        &self.queue
    }

    pub fn manager(&self) -> &Arc<DownloadManager> {
        &self.manager
    }

    pub fn quota(&self) -> &Arc<QuotaManager> {
        &self.quota
    }

    pub fn selector(&self) -> &Arc<StrategySelector> {
        &self.selector
    }

    /// Validates and queues a request with normal priority.
    pub async fn enqueue(&self, url: &str, requester: Requester) -> SchedulerResult<QueueItem> {
        self.enqueue_with_priority(url, requester, TaskPriority::default()).await
    }

    /// Validates and queues a request.
    ///
    /// Checks, in order: shutdown, URL syntax, strategy support, the
    /// requester's cooldown, then queue capacity and duplicates. A request
    /// rejected after the cooldown check does not start a cooldown.
    pub async fn enqueue_with_priority(
        &self,
        url: &str,
        requester: Requester,
        priority: TaskPriority,
    ) -> SchedulerResult<QueueItem> {
        let result = self.try_enqueue(url, requester, priority).await;
        if let Err(e) = &result {
            log::warn!("⚠️ Rejected request from {} for {}: {}", requester, url, e);
            metrics::record_rejection(e.reason());
        }
        result
    }

    async fn try_enqueue(&self, url: &str, requester: Requester, priority: TaskPriority) -> SchedulerResult<QueueItem> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SchedulerError::ShuttingDown);
        }

        let (url, selected) = self.selector.select_str(url)?;
        log::debug!("{} routed to {:?}", url, selected);

        self.rate_limiter
            .check_and_update(requester)
            .await
            .map_err(|retry_after| SchedulerError::RateLimited { retry_after })?;

        match self.queue.enqueue_with_priority(url, requester, priority).await {
            Ok(item) => Ok(item),
            Err(e) => {
                self.rate_limiter.remove_rate_limit(requester).await;
                Err(e)
            }
        }
    }

    pub async fn cancel(&self, id: Uuid) -> bool {
        self.queue.cancel(id).await
    }

    pub async fn pause(&self) {
        self.queue.pause().await;
    }

    pub async fn resume(&self) {
        self.queue.resume().await;
    }

    pub async fn status(&self) -> SchedulerStatus {
        let snapshot = self.queue.snapshot().await;
        SchedulerStatus {
            paused: snapshot.paused,
            pending: snapshot.pending,
            active: snapshot.active,
            finished: snapshot.finished,
            queue_capacity: self.queue.max_size(),
            max_concurrent: self.manager.max_concurrent(),
        }
    }

    pub async fn quota_usage(&self, requester: Requester) -> QuotaRecord {
        self.quota.usage(requester).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.queue.subscribe()
    }

    /// Spawns the worker-pool loop plus the rate limiter and stale-item cleanup.
    pub fn start(&self) -> JoinHandle<()> {
        Arc::clone(&self.rate_limiter).spawn_cleanup_task(
            std::time::Duration::from_secs(config::rate_limit::CLEANUP_INTERVAL_SECS),
            self.shutdown.clone(),
        );
        self.spawn_stale_sweep();
        tokio::spawn(Arc::clone(&self.manager).run())
    }

    /// Periodically cancels pending items that waited longer than
    /// `config::queue::STALE_ITEM_HOURS`.
    fn spawn_stale_sweep(&self) -> JoinHandle<()> {
        let queue = Arc::clone(&self.queue);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config::queue::stale_sweep_interval());
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        queue
                            .remove_old_items(chrono::Duration::hours(config::queue::STALE_ITEM_HOURS))
                            .await;
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
        })
    }

    /// Waits until nothing is pending or running.
    pub async fn wait_idle(&self) {
        loop {
            if self.queue.is_idle().await {
                self.manager.wait_idle().await;
                if self.queue.is_idle().await {
                    return;
                }
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    /// Stops accepting requests, stops the dispatch loop and waits for
    /// running downloads. Pending items stay in the queue.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!("Shutting down scheduler, {} download(s) in flight", self.manager.active_count());
        self.shutdown.cancel();
        self.manager.close();
        self.manager.wait_idle().await;
        log::info!("Scheduler stopped");
    }

    pub fn is_shutting_down(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
