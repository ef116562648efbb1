use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::core::types::Requester;

/// Per-user cooldown between accepted requests.
///
/// After a request is accepted the requester is blocked for `cooldown`.
/// A zero cooldown disables limiting.
#[derive(Clone)]
pub struct RateLimiter {
    /// Instant until which each requester is limited
    limits: Arc<Mutex<HashMap<Requester, Instant>>>,
    cooldown: Duration,
}

impl RateLimiter {
    /// Creates a new rate limiter with the given cooldown.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use boss_dl::core::rate_limiter::RateLimiter;
    /// use std::time::Duration;
    ///
    /// let limiter = RateLimiter::new(Duration::from_secs(5));
    /// ```
    pub fn new(cooldown: Duration) -> Self {
        Self {
            limits: Arc::new(Mutex::new(HashMap::new())),
            cooldown,
        }
    }

    /// Checks and, when allowed, starts a new cooldown in one step.
    ///
    /// Returns `Err(remaining)` if the requester must wait.
    pub async fn check_and_update(&self, requester: Requester) -> Result<(), Duration> {
        if self.cooldown.is_zero() {
            return Ok(());
        }
        let mut limits = self.limits.lock().await;
        let now = Instant::now();
        if let Some(&instant) = limits.get(&requester) {
            if now < instant {
                return Err(instant - now);
            }
        }
        limits.insert(requester, now + self.cooldown);
        Ok(())
    }

    /// Removes the limit for the requester.
    ///
    /// Used when a request is rejected later in the pipeline so the user is
    /// not charged a cooldown for nothing.
    pub async fn remove_rate_limit(&self, requester: Requester) {
        let mut limits = self.limits.lock().await;
        limits.remove(&requester);
    }

    /// Drops expired entries. Returns how many were removed.
    pub async fn cleanup_expired(&self) -> usize {
        let mut limits = self.limits.lock().await;
        let before = limits.len();
        let now = Instant::now();
        limits.retain(|_, until| *until > now);
        before - limits.len()
    }

    /// Periodically purges expired entries so the map does not grow forever.
    /// Stops when `shutdown` fires.
    pub fn spawn_cleanup_task(
        self: Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.cancelled() => break,
                }
                let removed = self.cleanup_expired().await;
                if removed > 0 {
                    log::debug!("Rate limiter cleanup removed {} entries", removed);
                }
            }
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_blocks_then_expires() {
        let limiter = RateLimiter::new(Duration::from_secs(5));
        let user = Requester(1);

        assert!(limiter.check_and_update(user).await.is_ok());
        let remaining = limiter.check_and_update(user).await.unwrap_err();
        assert!(remaining <= Duration::from_secs(5));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(limiter.check_and_update(user).await.is_ok());
    }

    #[tokio::test]
    async fn test_users_are_independent() {
        let limiter = RateLimiter::new(Duration::from_secs(30));
        assert!(limiter.check_and_update(Requester(1)).await.is_ok());
        assert!(limiter.check_and_update(Requester(1)).await.is_err());
        assert!(limiter.check_and_update(Requester(2)).await.is_ok());
    }

    #[tokio::test]
    async fn test_zero_cooldown_disables() {
        let limiter = RateLimiter::new(Duration::ZERO);
        for _ in 0..3 {
            assert!(limiter.check_and_update(Requester(9)).await.is_ok());
        }
    }

    #[tokio::test]
    async fn test_remove_rate_limit() {
        let limiter = RateLimiter::new(Duration::from_secs(30));
        assert!(limiter.check_and_update(Requester(3)).await.is_ok());
        limiter.remove_rate_limit(Requester(3)).await;
        assert!(limiter.check_and_update(Requester(3)).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_expired() {
        let limiter = RateLimiter::new(Duration::from_secs(1));
        limiter.check_and_update(Requester(1)).await.unwrap();
        limiter.check_and_update(Requester(2)).await.unwrap();
        assert_eq!(limiter.cleanup_expired().await, 0);
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(limiter.cleanup_expired().await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_task_stops_on_shutdown() {
        let limiter = Arc::new(RateLimiter::new(Duration::from_secs(1)));
        limiter.check_and_update(Requester(1)).await.unwrap();
        let shutdown = CancellationToken::new();
        let handle = Arc::clone(&limiter).spawn_cleanup_task(Duration::from_secs(2), shutdown.clone());

        tokio::time::sleep(Duration::from_secs(3)).await;
        // Background task already purged the entry
        assert_eq!(limiter.cleanup_expired().await, 0);

        shutdown.cancel();
        handle.await.unwrap();
    }
}
