use chrono::{DateTime, Utc};
use log::info;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use tokio::sync::{broadcast, Mutex, Notify};
use tokio_util::sync::CancellationToken;
use url::Url;
use uuid::Uuid;

use crate::core::error::{SchedulerError, SchedulerResult};
use crate::core::metrics;
use crate::core::types::{ItemStatus, Requester, TaskPriority};
use crate::download::manager::DownloadResult;
use crate::download::source::SourceProgress;

/// Capacity of the event broadcast channel; slow subscribers lag, never block.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// A download request waiting in or moving through the queue.
#[derive(Debug, Clone, Serialize)]
pub struct QueueItem {
    /// Unique item identifier (UUID v4)
    pub id: Uuid,
    pub url: Url,
    pub requester: Requester,
    pub submitted_at: DateTime<Utc>,
    pub priority: TaskPriority,
    pub status: ItemStatus,
    /// Cooperative cancellation shared with the worker running this item
    #[serde(skip)]
    pub cancel: CancellationToken,
}

impl QueueItem {
    pub fn new(url: Url, requester: Requester, priority: TaskPriority) -> Self {
        Self {
            id: Uuid::new_v4(),
            url,
            requester,
            submitted_at: Utc::now(),
            priority,
            status: ItemStatus::Pending,
            cancel: CancellationToken::new(),
        }
    }

    /// Moves the item to `to` if the lifecycle allows it.
    ///
    /// Illegal moves are logged and leave the status untouched.
    pub fn transition(&mut self, to: ItemStatus) -> bool {
        if !self.status.can_transition_to(to) {
            log::warn!("Refusing status change {} -> {} for {}", self.status, to, self.id);
            return false;
        }
        self.status = to;
        true
    }

    fn dedup_key(&self) -> (Requester, String) {
        (self.requester, self.url.to_string())
    }
}

/// Events published on every queue transition and on download progress.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum QueueEvent {
    StatusChanged {
        item_id: Uuid,
        requester: Requester,
        /// `None` when the item was just queued
        from: Option<ItemStatus>,
        to: ItemStatus,
        at: DateTime<Utc>,
    },
    Progress {
        item_id: Uuid,
        percent: u8,
        downloaded_bytes: Option<u64>,
        total_bytes: Option<u64>,
    },
}

/// Point-in-time view of the queue for status commands.
#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshot {
    pub paused: bool,
    pub pending: Vec<QueueItem>,
    pub active: Vec<QueueItem>,
    pub finished: usize,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<QueueItem>,
    active: HashMap<Uuid, QueueItem>,
    /// Most recent terminal items, oldest first
    finished: VecDeque<QueueItem>,
    paused: bool,
    /// (requester, url) of every pending or active item
    keys: HashSet<(Requester, String)>,
}

impl QueueState {
    fn update_depth_metrics(&self) {
        for priority in TaskPriority::ALL {
            let count = self.pending.iter().filter(|t| t.priority == priority).count();
            metrics::update_queue_depth(priority.as_str(), count);
        }
        metrics::update_queue_depth_total(self.pending.len());
    }

    fn push_finished(&mut self, item: QueueItem, limit: usize) {
        self.keys.remove(&item.dedup_key());
        self.finished.push_back(item);
        while self.finished.len() > limit {
            self.finished.pop_front();
        }
    }
}

/// Bounded, priority-aware FIFO of download requests.
///
/// Pending and active items live under one lock, so an item is never visible
/// in both sets. Higher priorities are served first; inside a priority level
/// items leave in arrival order.
pub struct QueueManager {
    state: Mutex<QueueState>,
    events: broadcast::Sender<QueueEvent>,
    notify: Notify,
    max_size: usize,
    history_limit: usize,
}

impl QueueManager {
    /// Creates an empty queue that accepts at most `max_size` pending items.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use boss_dl::download::queue::QueueManager;
    ///
    /// let queue = QueueManager::new(50, 200);
    /// ```
    pub fn new(max_size: usize, history_limit: usize) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(QueueState::default()),
            events,
            notify: Notify::new(),
            max_size,
            history_limit,
        }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Receiver for every event published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    fn emit_status(&self, item: &QueueItem, from: ItemStatus, to: ItemStatus) {
        // No subscribers is fine
        let _ = self.events.send(QueueEvent::StatusChanged {
            item_id: item.id,
            requester: item.requester,
            from: Some(from),
            to,
            at: Utc::now(),
        });
    }

    /// Publishes a progress update for an active item.
    pub fn publish_progress(&self, item_id: Uuid, progress: &SourceProgress) {
        let _ = self.events.send(QueueEvent::Progress {
            item_id,
            percent: progress.percent,
            downloaded_bytes: progress.downloaded_bytes,
            total_bytes: progress.total_bytes,
        });
    }

    /// Waits until an item is added or the queue is resumed.
    pub async fn notified(&self) {
        self.notify.notified().await;
    }

    /// Adds a request with [`TaskPriority::Normal`].
    pub async fn enqueue(&self, url: Url, requester: Requester) -> SchedulerResult<QueueItem> {
        self.enqueue_with_priority(url, requester, TaskPriority::default()).await
    }

    /// Adds a request respecting priority order.
    ///
    /// Rejects with `QueueFull` when `max_size` items are pending and with
    /// `Duplicate` when the requester already has this URL pending or active.
    /// The queue is unchanged on rejection.
    pub async fn enqueue_with_priority(
        &self,
        url: Url,
        requester: Requester,
        priority: TaskPriority,
    ) -> SchedulerResult<QueueItem> {
        let item = QueueItem::new(url, requester, priority);
        let mut state = self.state.lock().await;

        if state.pending.len() >= self.max_size {
            log::warn!(
                "Queue is full ({} items), rejecting request from {}: {}",
                state.pending.len(),
                requester,
                item.url
            );
            return Err(SchedulerError::QueueFull {
                capacity: self.max_size,
            });
        }

        let key = item.dedup_key();
        if state.keys.contains(&key) {
            log::warn!("⚠️ Duplicate request from {} for {}, skipping", requester, item.url);
            return Err(SchedulerError::Duplicate(item.url.to_string()));
        }
        state.keys.insert(key);

        let insert_pos = state
            .pending
            .iter()
            .position(|t| t.priority < item.priority)
            .unwrap_or(state.pending.len());
        state.pending.insert(insert_pos, item.clone());
        state.update_depth_metrics();

        info!(
            "Queued {} ({} priority) for {} at position {}, queue size {}",
            item.id,
            item.priority,
            requester,
            insert_pos + 1,
            state.pending.len()
        );
        drop(state);

        let _ = self.events.send(QueueEvent::StatusChanged {
            item_id: item.id,
            requester: item.requester,
            from: None,
            to: ItemStatus::Pending,
            at: item.submitted_at,
        });
        self.notify.notify_one();
        Ok(item)
    }

    /// Pops the highest-priority, oldest pending item and marks it active.
    ///
    /// Returns `None` when the queue is empty or paused.
    pub async fn dequeue_next(&self) -> Option<QueueItem> {
        self.dequeue_next_excluding(&HashSet::new()).await
    }

    /// Like [`dequeue_next`](Self::dequeue_next), but skips items of the
    /// `busy` requesters. Skipped items keep their position.
    pub async fn dequeue_next_excluding(&self, busy: &HashSet<Requester>) -> Option<QueueItem> {
        let mut state = self.state.lock().await;
        if state.paused {
            return None;
        }
        let pos = state.pending.iter().position(|t| !busy.contains(&t.requester))?;
        let mut item = state.pending.remove(pos)?;
        if !item.transition(ItemStatus::Active) {
            state.pending.insert(pos, item);
            return None;
        }
        state.active.insert(item.id, item.clone());
        state.update_depth_metrics();
        drop(state);

        let waited = (Utc::now() - item.submitted_at).num_milliseconds() as f64 / 1000.0;
        metrics::record_queue_wait(waited);
        info!("Dispatching {} for {} after {:.1}s in queue", item.id, item.requester, waited);

        self.emit_status(&item, ItemStatus::Pending, ItemStatus::Active);
        Some(item)
    }

    /// Puts an active item back at the head of the queue.
    ///
    /// Used when dispatch is refused before a worker starts.
    pub async fn requeue_front(&self, item: &QueueItem) -> bool {
        let mut state = self.state.lock().await;
        let Some(mut item) = state.active.remove(&item.id) else {
            return false;
        };
        if !item.transition(ItemStatus::Pending) {
            state.active.insert(item.id, item);
            return false;
        }
        state.pending.push_front(item.clone());
        state.update_depth_metrics();
        drop(state);

        self.emit_status(&item, ItemStatus::Active, ItemStatus::Pending);
        self.notify.notify_one();
        true
    }

    /// Cancels an item.
    ///
    /// A pending item is removed and becomes `cancelled` right away. An active
    /// item gets its token cancelled; the worker reports the final status.
    /// Returns `false` for unknown, finished or already-cancelled items.
    pub async fn cancel(&self, id: Uuid) -> bool {
        let mut state = self.state.lock().await;

        if let Some(pos) = state.pending.iter().position(|t| t.id == id) {
            let Some(mut item) = state.pending.remove(pos) else {
                return false;
            };
            if !item.transition(ItemStatus::Cancelled) {
                state.pending.insert(pos, item);
                return false;
            }
            item.cancel.cancel();
            state.push_finished(item.clone(), self.history_limit);
            state.update_depth_metrics();
            drop(state);

            info!("Cancelled pending item {}", id);
            self.emit_status(&item, ItemStatus::Pending, ItemStatus::Cancelled);
            return true;
        }

        if let Some(item) = state.active.get(&id) {
            if item.cancel.is_cancelled() {
                return false;
            }
            item.cancel.cancel();
            info!("Cancellation requested for active item {}", id);
            return true;
        }

        false
    }

    /// Stops handing out items. Pending items stay queued.
    pub async fn pause(&self) {
        let mut state = self.state.lock().await;
        if !state.paused {
            state.paused = true;
            info!("Queue paused with {} pending", state.pending.len());
        }
    }

    pub async fn resume(&self) {
        let mut state = self.state.lock().await;
        if state.paused {
            state.paused = false;
            info!("Queue resumed with {} pending", state.pending.len());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Records the outcome of an active item.
    ///
    /// The item becomes `done`, `failed` or `cancelled` and moves to history,
    /// and the dispatch loop is woken since a requester slot may have freed.
    /// Returns the final status, or `None` if the item was not active.
    pub async fn complete(&self, result: &DownloadResult) -> Option<ItemStatus> {
        let to = if result.success {
            ItemStatus::Done
        } else if result.cancelled {
            ItemStatus::Cancelled
        } else {
            ItemStatus::Failed
        };

        let mut state = self.state.lock().await;
        let Some(mut item) = state.active.remove(&result.item_id) else {
            log::debug!("Result for unknown or finished item {}", result.item_id);
            return None;
        };
        if !item.transition(to) {
            state.active.insert(item.id, item);
            return None;
        }
        state.push_finished(item.clone(), self.history_limit);
        drop(state);

        self.emit_status(&item, ItemStatus::Active, to);
        self.notify.notify_one();
        Some(to)
    }

    /// 1-based position of a pending item.
    pub async fn position(&self, id: Uuid) -> Option<usize> {
        let state = self.state.lock().await;
        state.pending.iter().position(|t| t.id == id).map(|pos| pos + 1)
    }

    /// Looks an item up in pending, active and history, in that order.
    pub async fn get(&self, id: Uuid) -> Option<QueueItem> {
        let state = self.state.lock().await;
        state
            .pending
            .iter()
            .find(|t| t.id == id)
            .or_else(|| state.active.get(&id))
            .or_else(|| state.finished.iter().rev().find(|t| t.id == id))
            .cloned()
    }

    /// Pending and active items of one requester.
    pub async fn items_for(&self, requester: Requester) -> Vec<QueueItem> {
        let state = self.state.lock().await;
        let mut items: Vec<QueueItem> = state
            .pending
            .iter()
            .chain(state.active.values())
            .filter(|t| t.requester == requester)
            .cloned()
            .collect();
        items.sort_by_key(|t| t.submitted_at);
        items
    }

    /// Number of pending items.
    pub async fn len(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.pending.is_empty()
    }

    pub async fn active_count(&self) -> usize {
        self.state.lock().await.active.len()
    }

    /// Whether nothing is pending or active.
    pub async fn is_idle(&self) -> bool {
        let state = self.state.lock().await;
        state.pending.is_empty() && state.active.is_empty()
    }

    pub async fn snapshot(&self) -> QueueSnapshot {
        let state = self.state.lock().await;
        let mut active: Vec<QueueItem> = state.active.values().cloned().collect();
        active.sort_by_key(|t| t.submitted_at);
        QueueSnapshot {
            paused: state.paused,
            pending: state.pending.iter().cloned().collect(),
            active,
            finished: state.finished.len(),
        }
    }

    /// Cancels pending items older than `max_age`. Returns how many were removed.
    pub async fn remove_old_items(&self, max_age: chrono::Duration) -> usize {
        let cutoff = Utc::now() - max_age;
        let mut state = self.state.lock().await;

        let (stale, fresh): (VecDeque<QueueItem>, VecDeque<QueueItem>) =
            state.pending.drain(..).partition(|t| t.submitted_at < cutoff);
        state.pending = fresh;

        let mut removed = Vec::with_capacity(stale.len());
        for mut item in stale {
            if !item.transition(ItemStatus::Cancelled) {
                continue;
            }
            item.cancel.cancel();
            state.push_finished(item.clone(), self.history_limit);
            removed.push(item);
        }
        state.update_depth_metrics();
        drop(state);

        for item in &removed {
            self.emit_status(item, ItemStatus::Pending, ItemStatus::Cancelled);
        }
        if !removed.is_empty() {
            info!("Removed {} stale items from the queue", removed.len());
        }
        removed.len()
    }
}
