//! Member selection and failure handling modes.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use rand::Rng;

/// What a client does when a call to the selected member fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailMode {
    /// Return the first error.
    Failfast,
    /// Retry on another member, up to the retry budget.
    Failover,
    /// Race a backup request if the first one is slow.
    Failbackup,
}

/// How a member is picked for each call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectMode {
    Random,
    RoundRobin,
}

impl fmt::Display for FailMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailMode::Failfast => "failfast",
            FailMode::Failover => "failover",
            FailMode::Failbackup => "failbackup",
        };
        f.write_str(s)
    }
}

impl fmt::Display for SelectMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SelectMode::Random => "random",
            SelectMode::RoundRobin => "round_robin",
        };
        f.write_str(s)
    }
}

/// Stateful member picker.
#[derive(Debug)]
pub struct Selector {
    mode: SelectMode,
    next: AtomicUsize,
}

impl Selector {
    pub fn new(mode: SelectMode) -> Self {
        Self {
            mode,
            next: AtomicUsize::new(0),
        }
    }

    pub fn mode(&self) -> SelectMode {
        self.mode
    }

    /// Index of the member to use, `None` when there are no members.
    pub fn pick(&self, len: usize) -> Option<usize> {
        if len == 0 {
            return None;
        }
        let i = match self.mode {
            SelectMode::Random => rand::thread_rng().gen_range(0..len),
            SelectMode::RoundRobin => self.next.fetch_add(1, Ordering::Relaxed) % len,
        };
        Some(i)
    }
}

/// Address part of a published member (`tcp@host:port` → `host:port`).
pub fn member_addr(member: &str) -> &str {
    match member.split_once('@') {
        Some((_, addr)) => addr,
        None => member,
    }
}
