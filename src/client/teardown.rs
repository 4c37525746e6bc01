//! Deferred close of detached pool resources.
//!
//! A scheduled task sleeps for its grace period, then runs its close action.
//! The grace period is never cut short; shutdown waits on [`TeardownQueue::drain`].

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

use crate::shutdown::ShutdownResult;

#[derive(Clone, Default)]
pub struct TeardownQueue {
    pending: Arc<AtomicU32>,
    notify: Arc<Notify>,
}

impl TeardownQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `close` after `delay`.
    pub fn schedule<F>(&self, label: impl Into<String>, delay: Duration, close: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let label = label.into();
        self.pending.fetch_add(1, Ordering::SeqCst);
        let guard = PendingGuard {
            pending: Arc::clone(&self.pending),
            notify: Arc::clone(&self.notify),
        };
        tracing::debug!(resource = %label, delay_ms = delay.as_millis() as u64, "teardown scheduled");
        tokio::spawn(async move {
            let _guard = guard;
            tokio::time::sleep(delay).await;
            close.await;
            tracing::debug!(resource = %label, "teardown done");
        });
    }

    /// Tasks scheduled but not yet finished.
    pub fn pending(&self) -> u32 {
        self.pending.load(Ordering::SeqCst)
    }

    /// Wait for every scheduled teardown to finish.
    pub async fn drain(&self, timeout: Duration) -> ShutdownResult {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            let count = self.pending();
            if count == 0 {
                return ShutdownResult::Complete;
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return ShutdownResult::Timeout { remaining: count };
            }
            tokio::select! {
                _ = notified => continue,
                _ = tokio::time::sleep(remaining) => {
                    let count = self.pending();
                    if count == 0 {
                        return ShutdownResult::Complete;
                    }
                    return ShutdownResult::Timeout { remaining: count };
                }
            }
        }
    }
}

struct PendingGuard {
    pending: Arc<AtomicU32>,
    notify: Arc<Notify>,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending.fetch_sub(1, Ordering::SeqCst);
        self.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[tokio::test(start_paused = true)]
    async fn close_waits_for_the_grace_period() {
        let queue = TeardownQueue::new();
        let closed = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&closed);
        queue.schedule("client", Duration::from_secs(15), async move {
            flag.store(true, Ordering::SeqCst);
        });
        assert_eq!(queue.pending(), 1);

        tokio::time::sleep(Duration::from_secs(14)).await;
        assert!(!closed.load(Ordering::SeqCst));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(closed.load(Ordering::SeqCst));
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn drain_waits_for_pending_tasks() {
        let queue = TeardownQueue::new();
        queue.schedule("a", Duration::from_secs(5), async {});
        queue.schedule("b", Duration::from_secs(6), async {});
        assert_eq!(queue.drain(Duration::from_secs(10)).await, ShutdownResult::Complete);
    }

    #[tokio::test(start_paused = true)]
    async fn drain_reports_stragglers_on_timeout() {
        let queue = TeardownQueue::new();
        queue.schedule("slow", Duration::from_secs(60), async {});
        assert_eq!(
            queue.drain(Duration::from_secs(1)).await,
            ShutdownResult::Timeout { remaining: 1 }
        );
    }
}
