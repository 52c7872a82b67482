//! Exponential-backoff reconnection scheduling.
//!
//! A small policy object shared by the SSE transport and the per-server
//! connection manager. The manager arms at most one timer at a time;
//! attempts only grow between [`ReconnectManager::reset`] calls, and a
//! cancelled manager ignores further scheduling until reset.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;

/// Backoff configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Maximum number of attempts before the scheduler reports exhaustion.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Multiplier applied per subsequent attempt.
    pub backoff_multiplier: f64,
    /// Upper bound on any individual delay.
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(1000),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl ReconnectPolicy {
    /// Delay for a 1-based attempt number:
    /// `min(initial · multiplier^(attempt-1), max)`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        let millis = (self.initial_delay.as_millis() as f64 * factor)
            .min(self.max_delay.as_millis() as f64);
        Duration::from_millis(millis as u64)
    }
}

#[derive(Debug)]
struct Inner {
    attempts: u32,
    cancelled: bool,
    timer: Option<JoinHandle<()>>,
}

/// Schedules retries with bounded exponential backoff.
#[derive(Debug, Clone)]
pub struct ReconnectManager {
    policy: ReconnectPolicy,
    inner: Arc<StdMutex<Inner>>,
}

impl ReconnectManager {
    /// Create a manager for the given policy.
    #[must_use]
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            inner: Arc::new(StdMutex::new(Inner {
                attempts: 0,
                cancelled: false,
                timer: None,
            })),
        }
    }

    /// The policy this manager runs.
    #[must_use]
    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// Schedule the next retry.
    ///
    /// When the attempt budget is already spent, `on_exhausted` runs
    /// synchronously and no timer starts. Calls after [`Self::cancel`] (and
    /// before [`Self::reset`]) are ignored entirely. Scheduling while a
    /// timer is armed replaces that timer, preserving the single
    /// outstanding-timer invariant.
    pub fn schedule<R, E>(&self, retry: R, on_exhausted: E)
    where
        R: FnOnce() + Send + 'static,
        E: FnOnce(),
    {
        let delay = {
            let mut inner = self.inner.lock().expect("reconnect state poisoned");
            if inner.cancelled {
                debug!("reconnect schedule ignored: cancelled");
                return;
            }
            if inner.attempts >= self.policy.max_attempts {
                drop(inner);
                on_exhausted();
                return;
            }
            inner.attempts += 1;
            if let Some(stale) = inner.timer.take() {
                stale.abort();
            }
            self.policy.delay_for(inner.attempts)
        };

        let state = Arc::clone(&self.inner);
        let attempt = self.attempt_count();
        debug!(attempt, delay_ms = delay.as_millis() as u64, "reconnect scheduled");
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            state.lock().expect("reconnect state poisoned").timer = None;
            retry();
        });
        self.inner.lock().expect("reconnect state poisoned").timer = Some(handle);
    }

    /// Cancel any pending timer and disable scheduling until reset.
    /// Idempotent.
    pub fn cancel(&self) {
        let mut inner = self.inner.lock().expect("reconnect state poisoned");
        inner.cancelled = true;
        if let Some(timer) = inner.timer.take() {
            timer.abort();
        }
    }

    /// Zero the attempt counter and re-enable scheduling.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().expect("reconnect state poisoned");
        inner.attempts = 0;
        inner.cancelled = false;
    }

    /// Attempts consumed since the last reset.
    #[must_use]
    pub fn attempt_count(&self) -> u32 {
        self.inner.lock().expect("reconnect state poisoned").attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::mpsc;

    fn policy_500_3_2000() -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            backoff_multiplier: 3.0,
            max_delay: Duration::from_millis(2000),
        }
    }

    #[test]
    fn test_delay_growth_is_capped() {
        let policy = policy_500_3_2000();
        assert_eq!(policy.delay_for(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for(2), Duration::from_millis(1500));
        // 4500ms uncapped, bounded by max_delay
        assert_eq!(policy.delay_for(3), Duration::from_millis(2000));
        assert_eq!(policy.delay_for(10), Duration::from_millis(2000));
    }

    #[test]
    fn test_backoff_sum_bound() {
        let policy = policy_500_3_2000();
        let total: Duration = (1..=8).map(|a| policy.delay_for(a)).sum();
        assert!(total <= policy.max_delay * 8);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_then_exhaustion() {
        let manager = ReconnectManager::new(policy_500_3_2000());
        let (tx, mut rx) = mpsc::unbounded_channel();

        for _ in 0..3 {
            let tx = tx.clone();
            manager.schedule(move || { let _ = tx.send("retry"); }, || panic!("not exhausted yet"));
            tokio::time::sleep(Duration::from_millis(2100)).await;
            assert_eq!(rx.recv().await, Some("retry"));
        }
        assert_eq!(manager.attempt_count(), 3);

        let exhausted = AtomicU32::new(0);
        manager.schedule(|| panic!("budget spent"), || { exhausted.fetch_add(1, Ordering::SeqCst); });
        assert_eq!(exhausted.load(Ordering::SeqCst), 1, "on_exhausted runs synchronously");
    }

    #[tokio::test(start_paused = true)]
    async fn test_exact_delay_sequence() {
        // 500ms, 1500ms, then capped at 2000ms.
        let manager = ReconnectManager::new(policy_500_3_2000());
        for expected_ms in [500u64, 1500, 2000] {
            let (tx, mut rx) = mpsc::unbounded_channel();
            manager.schedule(move || { let _ = tx.send(()); }, || panic!("exhausted"));

            tokio::time::sleep(Duration::from_millis(expected_ms - 10)).await;
            assert!(rx.try_recv().is_err(), "fired before {expected_ms}ms");
            tokio::time::sleep(Duration::from_millis(20)).await;
            assert_eq!(rx.recv().await, Some(()), "did not fire at {expected_ms}ms");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_is_idempotent_and_blocks_schedule() {
        let manager = ReconnectManager::new(policy_500_3_2000());
        let (tx, mut rx) = mpsc::unbounded_channel();
        manager.schedule(move || { let _ = tx.send(()); }, || {});

        manager.cancel();
        manager.cancel();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(rx.try_recv().is_err(), "cancelled timer must not fire");

        // schedule after cancel without reset is a no-op
        manager.schedule(|| panic!("must not run"), || panic!("must not run"));
        tokio::time::sleep(Duration::from_secs(5)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_reenables_and_zeroes() {
        let manager = ReconnectManager::new(policy_500_3_2000());
        manager.schedule(|| {}, || {});
        assert_eq!(manager.attempt_count(), 1);

        manager.cancel();
        manager.reset();
        assert_eq!(manager.attempt_count(), 0);

        let (tx, mut rx) = mpsc::unbounded_channel();
        manager.schedule(move || { let _ = tx.send(()); }, || {});
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(rx.recv().await, Some(()));
    }
}
