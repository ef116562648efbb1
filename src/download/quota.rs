//! Per-user storage and concurrency budgets.
//!
//! Every download reserves its estimated size before it starts. The
//! reservation is either committed with the real size or released on
//! failure/cancel. All bookkeeping happens under one lock so concurrent
//! workers never lose an update.

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;

use crate::core::config::SchedulerConfig;
use crate::core::error::QuotaViolation;
use crate::core::types::Requester;

/// Limits enforced by [`QuotaManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaLimits {
    pub max_file_bytes: u64,
    pub max_user_bytes: u64,
    pub max_user_concurrent: usize,
}

impl From<&SchedulerConfig> for QuotaLimits {
    fn from(cfg: &SchedulerConfig) -> Self {
        Self {
            max_file_bytes: cfg.max_file_bytes,
            max_user_bytes: cfg.max_user_bytes,
            max_user_concurrent: cfg.max_user_concurrent,
        }
    }
}

/// Usage snapshot for one requester.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QuotaRecord {
    /// Bytes of completed downloads
    pub bytes_used: u64,
    /// Bytes held by in-flight reservations
    pub bytes_reserved: u64,
    /// Downloads currently in flight
    pub active_downloads: usize,
    #[serde(skip)]
    outstanding: HashMap<u64, u64>,
}

impl QuotaRecord {
    fn committed_and_reserved(&self) -> u64 {
        self.bytes_used.saturating_add(self.bytes_reserved)
    }
}

/// Handle for a reserved slot. Commit or release it exactly once;
/// repeated calls are no-ops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    id: u64,
    requester: Requester,
    bytes: u64,
}

impl Reservation {
    pub fn requester(&self) -> Requester {
        self.requester
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

pub struct QuotaManager {
    limits: QuotaLimits,
    records: Mutex<HashMap<Requester, QuotaRecord>>,
    next_id: AtomicU64,
}

impl QuotaManager {
    pub fn new(limits: QuotaLimits) -> Self {
        Self {
            limits,
            records: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn limits(&self) -> QuotaLimits {
        self.limits
    }

    /// Checks a size against the per-file cap.
    pub fn check_file_size(&self, bytes: u64) -> Result<(), QuotaViolation> {
        if bytes > self.limits.max_file_bytes {
            return Err(QuotaViolation::FileTooLarge {
                size: bytes,
                limit: self.limits.max_file_bytes,
            });
        }
        Ok(())
    }

    /// Reserves `estimated_bytes` for the requester and counts one more
    /// download in flight.
    ///
    /// Fails if the file alone is over the cap, if used + reserved + estimate
    /// would pass the storage limit, or if the requester already has the
    /// maximum number of downloads running. Nothing changes on failure.
    pub async fn reserve(&self, requester: Requester, estimated_bytes: u64) -> Result<Reservation, QuotaViolation> {
        self.check_file_size(estimated_bytes)?;

        let mut records = self.records.lock().await;
        let record = records.entry(requester).or_default();

        if record.active_downloads >= self.limits.max_user_concurrent {
            return Err(QuotaViolation::TooManyActive {
                active: record.active_downloads,
                limit: self.limits.max_user_concurrent,
            });
        }

        let projected = record.committed_and_reserved().saturating_add(estimated_bytes);
        if projected > self.limits.max_user_bytes {
            return Err(QuotaViolation::StorageLimit {
                requested: estimated_bytes,
                used: record.committed_and_reserved(),
                limit: self.limits.max_user_bytes,
            });
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        record.bytes_reserved += estimated_bytes;
        record.active_downloads += 1;
        record.outstanding.insert(id, estimated_bytes);

        log::debug!(
            "Quota reserved for {}: {} bytes (used {}, reserved {}, active {})",
            requester,
            estimated_bytes,
            record.bytes_used,
            record.bytes_reserved,
            record.active_downloads
        );

        Ok(Reservation {
            id,
            requester,
            bytes: estimated_bytes,
        })
    }

    /// Turns a reservation into usage of `actual_bytes`.
    ///
    /// Returns `false` if the reservation was already settled.
    pub async fn commit(&self, reservation: &Reservation, actual_bytes: u64) -> bool {
        let mut records = self.records.lock().await;
        let Some(record) = records.get_mut(&reservation.requester) else {
            return false;
        };
        let Some(reserved) = record.outstanding.remove(&reservation.id) else {
            log::debug!("Reservation {} already settled", reservation.id);
            return false;
        };
        record.bytes_reserved = record.bytes_reserved.saturating_sub(reserved);
        record.active_downloads = record.active_downloads.saturating_sub(1);
        record.bytes_used = record.bytes_used.saturating_add(actual_bytes);
        true
    }

    /// Frees a reservation without charging usage.
    ///
    /// Returns `false` if the reservation was already settled, so calling it
    /// twice restores capacity exactly once.
    pub async fn release(&self, reservation: &Reservation) -> bool {
        let mut records = self.records.lock().await;
        let Some(record) = records.get_mut(&reservation.requester) else {
            return false;
        };
        let Some(reserved) = record.outstanding.remove(&reservation.id) else {
            return false;
        };
        record.bytes_reserved = record.bytes_reserved.saturating_sub(reserved);
        record.active_downloads = record.active_downloads.saturating_sub(1);
        true
    }

    pub async fn usage(&self, requester: Requester) -> QuotaRecord {
        let records = self.records.lock().await;
        records.get(&requester).cloned().unwrap_or_default()
    }

    /// Bytes the requester can still reserve.
    pub async fn available(&self, requester: Requester) -> u64 {
        let records = self.records.lock().await;
        let taken = records.get(&requester).map(|r| r.committed_and_reserved()).unwrap_or(0);
        self.limits.max_user_bytes.saturating_sub(taken)
    }

    /// Requesters already running `max_user_concurrent` downloads.
    pub async fn saturated(&self) -> HashSet<Requester> {
        let records = self.records.lock().await;
        records
            .iter()
            .filter(|(_, record)| record.active_downloads >= self.limits.max_user_concurrent)
            .map(|(requester, _)| *requester)
            .collect()
    }

    /// Clears committed usage. In-flight reservations are kept.
    pub async fn reset(&self, requester: Requester) {
        let mut records = self.records.lock().await;
        if let Some(record) = records.get_mut(&requester) {
            record.bytes_used = 0;
        }
    }
}
