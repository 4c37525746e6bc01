//! Consecutive-failure circuit breaker, one circuit per member address.
//!
//! States:
//! - Closed: calls proceed, consecutive failures are counted
//! - Open: calls are refused until the cooldown elapses
//! - HalfOpen: one trial call decides between Closed and Open
//!
//! Admission hands out a [`Permit`]. A trial permit dropped before it is
//! settled counts as a failed trial, so a cancelled or timed-out trial
//! reopens the circuit instead of holding the trial slot forever.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CircuitState {
    Closed { failures: u32 },
    Open { since: Instant },
    HalfOpen { in_trial: bool },
}

pub struct ConsecutiveBreaker {
    threshold: u32,
    cooldown: Duration,
    states: Mutex<HashMap<String, CircuitState>>,
}

impl ConsecutiveBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            cooldown,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Admit a call to `addr` now, or `None` while the circuit refuses it.
    /// Claims the trial slot when the circuit is half-open.
    pub fn try_acquire(&self, addr: &str) -> Option<Permit<'_>> {
        let mut states = self.states.lock();
        let state = states
            .entry(addr.to_string())
            .or_insert(CircuitState::Closed { failures: 0 });
        let trial = match state {
            CircuitState::Closed { .. } => false,
            CircuitState::Open { since } => {
                if since.elapsed() < self.cooldown {
                    return None;
                }
                tracing::debug!(addr, "circuit half-open");
                *state = CircuitState::HalfOpen { in_trial: true };
                true
            }
            CircuitState::HalfOpen { in_trial } => {
                if *in_trial {
                    return None;
                }
                *in_trial = true;
                true
            }
        };
        Some(Permit {
            breaker: self,
            addr: addr.to_string(),
            trial,
            settled: false,
        })
    }

    pub fn record_success(&self, addr: &str) {
        let mut states = self.states.lock();
        let previous = states.insert(addr.to_string(), CircuitState::Closed { failures: 0 });
        if matches!(previous, Some(CircuitState::HalfOpen { .. })) {
            tracing::info!(addr, "circuit closed after successful trial");
        }
    }

    pub fn record_failure(&self, addr: &str) {
        let mut states = self.states.lock();
        let state = states
            .entry(addr.to_string())
            .or_insert(CircuitState::Closed { failures: 0 });
        match state {
            CircuitState::Closed { failures } => {
                *failures += 1;
                if *failures >= self.threshold {
                    tracing::warn!(addr, failures = *failures, "circuit opened");
                    *state = CircuitState::Open {
                        since: Instant::now(),
                    };
                }
            }
            CircuitState::HalfOpen { .. } => {
                tracing::warn!(addr, "circuit re-opened after failed trial");
                *state = CircuitState::Open {
                    since: Instant::now(),
                };
            }
            CircuitState::Open { .. } => {}
        }
    }

    pub fn state(&self, addr: &str) -> CircuitState {
        self.states
            .lock()
            .get(addr)
            .cloned()
            .unwrap_or(CircuitState::Closed { failures: 0 })
    }
}

/// Admission to call one member. Settle it with the call's outcome.
#[must_use]
pub struct Permit<'a> {
    breaker: &'a ConsecutiveBreaker,
    addr: String,
    trial: bool,
    settled: bool,
}

impl Permit<'_> {
    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breaker.record_success(&self.addr);
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.record_failure(&self.addr);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        // Unsettled ordinary calls were cancelled by the caller and say
        // nothing about the member.
        if !self.settled && self.trial {
            tracing::debug!(addr = %self.addr, "trial abandoned");
            self.breaker.record_failure(&self.addr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_after_consecutive_failures() {
        let breaker = ConsecutiveBreaker::new(3, Duration::from_secs(60));
        breaker.record_failure("a");
        breaker.record_failure("a");
        breaker.try_acquire("a").unwrap().failure();
        assert!(breaker.try_acquire("a").is_none());
        assert!(breaker.try_acquire("b").is_some());
    }

    #[test]
    fn success_resets_the_count() {
        let breaker = ConsecutiveBreaker::new(2, Duration::from_secs(60));
        breaker.record_failure("a");
        breaker.try_acquire("a").unwrap().success();
        breaker.record_failure("a");
        assert!(breaker.try_acquire("a").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_admits_one_trial_after_cooldown() {
        let breaker = ConsecutiveBreaker::new(1, Duration::from_secs(60));
        breaker.record_failure("a");
        assert!(breaker.try_acquire("a").is_none());

        tokio::time::advance(Duration::from_secs(61)).await;
        let trial = breaker.try_acquire("a").unwrap();
        assert!(trial.is_trial());
        assert!(breaker.try_acquire("a").is_none());

        trial.success();
        assert_eq!(breaker.state("a"), CircuitState::Closed { failures: 0 });
    }

    #[tokio::test(start_paused = true)]
    async fn failed_trial_reopens() {
        let breaker = ConsecutiveBreaker::new(1, Duration::from_secs(10));
        breaker.record_failure("a");
        tokio::time::advance(Duration::from_secs(11)).await;
        breaker.try_acquire("a").unwrap().failure();
        assert!(matches!(breaker.state("a"), CircuitState::Open { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_trial_reopens_for_another_cooldown() {
        let breaker = ConsecutiveBreaker::new(1, Duration::from_secs(10));
        breaker.record_failure("a");
        tokio::time::advance(Duration::from_secs(11)).await;

        drop(breaker.try_acquire("a").unwrap());
        assert!(matches!(breaker.state("a"), CircuitState::Open { .. }));
        assert!(breaker.try_acquire("a").is_none());

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(breaker.try_acquire("a").unwrap().is_trial());
    }

    #[test]
    fn dropped_closed_permit_is_not_a_failure() {
        let breaker = ConsecutiveBreaker::new(1, Duration::from_secs(10));
        drop(breaker.try_acquire("a").unwrap());
        assert_eq!(breaker.state("a"), CircuitState::Closed { failures: 0 });
    }
}
