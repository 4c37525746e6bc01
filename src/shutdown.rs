//! Process shutdown: stop accepting, drain in-flight calls, then stop.
//!
//! The accept loop watches [`ShutdownCoordinator::token`]; every inbound call
//! holds a [`CallGuard`] until its reply is written.

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Running,
    Draining,
    Stopped,
}

impl ShutdownState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Running,
            1 => Self::Draining,
            _ => Self::Stopped,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Running => 0,
            Self::Draining => 1,
            Self::Stopped => 2,
        }
    }
}

/// Outcome of a drain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownResult {
    Complete,
    Timeout { remaining: u32 },
}

#[derive(Clone)]
pub struct ShutdownCoordinator {
    state: Arc<AtomicU8>,
    in_flight: Arc<AtomicU32>,
    notify: Arc<Notify>,
    token: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            state: Arc::new(AtomicU8::new(ShutdownState::Running.as_u8())),
            in_flight: Arc::new(AtomicU32::new(0)),
            notify: Arc::new(Notify::new()),
            token: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> ShutdownState {
        ShutdownState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_accepting(&self) -> bool {
        self.state() == ShutdownState::Running
    }

    /// Cancelled when draining starts.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Track one inbound call. None once draining has started.
    pub fn track(&self) -> Option<CallGuard> {
        if !self.is_accepting() {
            return None;
        }
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        Some(CallGuard {
            counter: Arc::clone(&self.in_flight),
            notify: Arc::clone(&self.notify),
        })
    }

    pub fn in_flight_count(&self) -> u32 {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Stop accepting and wait up to `timeout` for in-flight calls.
    pub async fn initiate(&self, timeout: Duration) -> ShutdownResult {
        self.state
            .store(ShutdownState::Draining.as_u8(), Ordering::SeqCst);
        self.token.cancel();

        let result = self.wait_for_drain(timeout).await;

        self.state
            .store(ShutdownState::Stopped.as_u8(), Ordering::SeqCst);
        result
    }

    async fn wait_for_drain(&self, timeout: Duration) -> ShutdownResult {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            let count = self.in_flight_count();
            if count == 0 {
                return ShutdownResult::Complete;
            }
            let left = deadline.saturating_duration_since(tokio::time::Instant::now());
            if left.is_zero() {
                return ShutdownResult::Timeout { remaining: count };
            }
            tokio::select! {
                _ = notified => continue,
                _ = tokio::time::sleep(left) => {
                    return match self.in_flight_count() {
                        0 => ShutdownResult::Complete,
                        n => ShutdownResult::Timeout { remaining: n },
                    };
                }
            }
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Releases its in-flight slot on drop.
pub struct CallGuard {
    counter: Arc<AtomicU32>,
    notify: Arc<Notify>,
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
        self.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn idle_shutdown_completes_immediately() {
        let coordinator = ShutdownCoordinator::new();
        let token = coordinator.token();
        assert_eq!(
            coordinator.initiate(Duration::from_secs(1)).await,
            ShutdownResult::Complete
        );
        assert!(token.is_cancelled());
        assert_eq!(coordinator.state(), ShutdownState::Stopped);
    }

    #[tokio::test]
    async fn draining_refuses_new_calls() {
        let coordinator = ShutdownCoordinator::new();
        let guard = coordinator.track();
        assert!(guard.is_some());

        let c = coordinator.clone();
        let drain = tokio::spawn(async move { c.initiate(Duration::from_secs(5)).await });
        tokio::task::yield_now().await;
        assert!(coordinator.track().is_none());

        drop(guard);
        assert_eq!(drain.await.unwrap(), ShutdownResult::Complete);
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_call_times_out() {
        let coordinator = ShutdownCoordinator::new();
        let _guard = coordinator.track();
        assert_eq!(
            coordinator.initiate(Duration::from_secs(2)).await,
            ShutdownResult::Timeout { remaining: 1 }
        );
    }
}
