//! Service discovery seams and an in-process backend.
//!
//! Servers publish `tcp@<addr>` under `<base_path>/<service>` through a
//! [`Registrar`]; clients resolve the same key to a live member list through
//! a [`Discovery`] handle opened by a [`DiscoveryFactory`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio::time::Instant;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DiscoveryError {
    #[error("service discovery not meeting requirements")]
    NotConfigured,

    #[error("discovery backend error: {0}")]
    Backend(String),

    #[error("discovery handle for {0} is closed")]
    Closed(String),
}

/// Live view of one service's members.
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Current member list, e.g. `["tcp@10.0.0.1:9000"]`.
    fn members(&self) -> Vec<String>;

    /// Stop watching. Later `members()` calls return nothing.
    async fn close(&self);

    fn is_closed(&self) -> bool;
}

#[async_trait]
pub trait DiscoveryFactory: Send + Sync {
    async fn open(&self, base_path: &str, service: &str)
        -> Result<Arc<dyn Discovery>, DiscoveryError>;
}

/// Server-side publication of a member address.
#[async_trait]
pub trait Registrar: Send + Sync {
    /// Publish or refresh `member`; it lapses after `ttl` unless refreshed.
    async fn register(
        &self,
        base_path: &str,
        service: &str,
        member: &str,
        ttl: Duration,
    ) -> Result<(), DiscoveryError>;

    async fn unregister(
        &self,
        base_path: &str,
        service: &str,
        member: &str,
    ) -> Result<(), DiscoveryError>;
}

pub fn service_key(base_path: &str, service: &str) -> String {
    format!("{}/{}", base_path.trim_end_matches('/'), service)
}

type MemberTable = DashMap<String, DashMap<String, Instant>>;

/// In-process discovery backend shared by registrars and resolvers.
#[derive(Clone, Default)]
pub struct MemoryDiscovery {
    table: Arc<MemberTable>,
}

impl MemoryDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a member that never lapses.
    pub fn insert(&self, base_path: &str, service: &str, member: &str) {
        let far = Instant::now() + Duration::from_secs(100 * 365 * 24 * 3600);
        self.table
            .entry(service_key(base_path, service))
            .or_default()
            .insert(member.to_string(), far);
    }

    pub fn remove(&self, base_path: &str, service: &str, member: &str) {
        if let Some(members) = self.table.get(&service_key(base_path, service)) {
            members.remove(member);
        }
    }

    pub fn members(&self, base_path: &str, service: &str) -> Vec<String> {
        live_members(&self.table, &service_key(base_path, service))
    }
}

fn live_members(table: &MemberTable, key: &str) -> Vec<String> {
    let now = Instant::now();
    let mut members: Vec<String> = match table.get(key) {
        Some(entries) => entries
            .iter()
            .filter(|e| *e.value() > now)
            .map(|e| e.key().clone())
            .collect(),
        None => Vec::new(),
    };
    members.sort();
    members
}

#[async_trait]
impl Registrar for MemoryDiscovery {
    async fn register(
        &self,
        base_path: &str,
        service: &str,
        member: &str,
        ttl: Duration,
    ) -> Result<(), DiscoveryError> {
        self.table
            .entry(service_key(base_path, service))
            .or_default()
            .insert(member.to_string(), Instant::now() + ttl);
        Ok(())
    }

    async fn unregister(
        &self,
        base_path: &str,
        service: &str,
        member: &str,
    ) -> Result<(), DiscoveryError> {
        self.remove(base_path, service, member);
        Ok(())
    }
}

#[async_trait]
impl DiscoveryFactory for MemoryDiscovery {
    async fn open(
        &self,
        base_path: &str,
        service: &str,
    ) -> Result<Arc<dyn Discovery>, DiscoveryError> {
        if base_path.is_empty() || service.is_empty() {
            return Err(DiscoveryError::NotConfigured);
        }
        Ok(Arc::new(MemoryWatch {
            table: Arc::clone(&self.table),
            key: service_key(base_path, service),
            closed: AtomicBool::new(false),
        }))
    }
}

/// Resolver handle over [`MemoryDiscovery`].
pub struct MemoryWatch {
    table: Arc<MemberTable>,
    key: String,
    closed: AtomicBool,
}

#[async_trait]
impl Discovery for MemoryWatch {
    fn members(&self) -> Vec<String> {
        if self.is_closed() {
            return Vec::new();
        }
        live_members(&self.table, &self.key)
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::debug!(key = %self.key, "discovery watch closed");
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
