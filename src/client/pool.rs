//! Per-service cache of discovery handles and balanced clients.
//!
//! Lookups hit a concurrent map. A miss takes the per-service build lock, so
//! concurrent first callers share one construction. Before each lookup a
//! random draw may force a renewal: the old entry is removed from the map
//! first, then closed only after the call timeout has passed, so calls
//! already holding it finish normally.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::discovery::{Discovery, DiscoveryFactory};
use super::teardown::TeardownQueue;
use super::transport::TransportFactory;
use super::xclient::{BalancedClient, ClientOptions};
use crate::error::RpcError;
use crate::notify::Notifier;
use crate::service::reply::Payload;
use crate::telemetry::metrics;
use crate::value::Args;

/// Extra grace for the discovery handle over the client.
const DISCOVERY_CLOSE_MARGIN: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Discovery base path shared with the servers.
    pub base_path: String,
    pub client: ClientOptions,
    /// A lookup renews its entry with probability `1 / renew_one_in`. 0 disables.
    pub renew_one_in: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            base_path: String::new(),
            client: ClientOptions::default(),
            renew_one_in: 111,
        }
    }
}

/// Cached resources for one remote service.
pub struct PoolEntry {
    pub service: String,
    pub discovery: Arc<dyn Discovery>,
    pub client: Arc<BalancedClient>,
    pub created_at: Instant,
}

pub struct ConnectionPool {
    config: PoolConfig,
    discovery: Arc<dyn DiscoveryFactory>,
    transports: Arc<dyn TransportFactory>,
    entries: DashMap<String, Arc<PoolEntry>>,
    build_locks: DashMap<String, Arc<Mutex<()>>>,
    teardown: TeardownQueue,
    notifier: Option<Arc<Notifier>>,
    builds: AtomicU64,
}

impl ConnectionPool {
    pub fn new(
        config: PoolConfig,
        discovery: Arc<dyn DiscoveryFactory>,
        transports: Arc<dyn TransportFactory>,
    ) -> Self {
        Self {
            config,
            discovery,
            transports,
            entries: DashMap::new(),
            build_locks: DashMap::new(),
            teardown: TeardownQueue::new(),
            notifier: None,
            builds: AtomicU64::new(0),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Client for `service`, possibly renewed by the random draw.
    pub async fn get_client(&self, service: &str) -> Result<Arc<BalancedClient>, RpcError> {
        let renew = self.draw_renewal();
        let entry = self.acquire(service, renew).await?;
        Ok(Arc::clone(&entry.client))
    }

    /// Call `path` on `service` through its pooled client.
    pub async fn call(&self, service: &str, path: &str, args: Args) -> Result<Payload, RpcError> {
        let client = self.get_client(service).await?;
        client.call(path, args).await
    }

    /// Cached entry for `service`, built on a miss. With `renew`, the current
    /// entry is detached and replaced.
    pub async fn acquire(&self, service: &str, renew: bool) -> Result<Arc<PoolEntry>, RpcError> {
        if !renew {
            if let Some(entry) = self.cached(service) {
                return Ok(entry);
            }
        }

        let lock = self.build_lock(service);
        let _guard = lock.lock().await;

        if renew {
            if let Some((_, old)) = self.entries.remove(service) {
                self.retire(old);
            }
        } else if let Some(entry) = self.cached(service) {
            // Built by the caller we waited on.
            return Ok(entry);
        }

        let entry = Arc::new(self.build(service).await?);
        self.entries.insert(service.to_string(), Arc::clone(&entry));
        Ok(entry)
    }

    fn cached(&self, service: &str) -> Option<Arc<PoolEntry>> {
        self.entries.get(service).map(|e| Arc::clone(e.value()))
    }

    fn build_lock(&self, service: &str) -> Arc<Mutex<()>> {
        let entry = self
            .build_locks
            .entry(service.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())));
        Arc::clone(entry.value())
    }

    fn draw_renewal(&self) -> bool {
        let n = self.config.renew_one_in;
        n > 0 && rand::thread_rng().gen_range(0..n) == 0
    }

    async fn build(&self, service: &str) -> Result<PoolEntry, RpcError> {
        let discovery = self
            .discovery
            .open(&self.config.base_path, service)
            .await
            .map_err(|e| {
                tracing::error!(service, error = %e, "discovery handle construction failed");
                RpcError::PoolConstructionFailed {
                    service: service.to_string(),
                    reason: e.to_string(),
                }
            })?;
        let transport = self.transports.create(service);
        let client = BalancedClient::new(
            service,
            Arc::clone(&discovery),
            transport,
            self.config.client.clone(),
        );

        self.builds.fetch_add(1, Ordering::Relaxed);
        metrics::record_pool_build(service);
        tracing::info!(
            service,
            fail_mode = %self.config.client.fail_mode,
            select_mode = %self.config.client.select_mode,
            "pool entry built"
        );
        Ok(PoolEntry {
            service: service.to_string(),
            discovery,
            client: Arc::new(client),
            created_at: Instant::now(),
        })
    }

    /// Schedule close of a detached entry after the call timeout.
    fn retire(&self, old: Arc<PoolEntry>) {
        metrics::record_pool_renew(&old.service);
        tracing::info!(
            service = %old.service,
            age_ms = old.created_at.elapsed().as_millis() as u64,
            "pool entry renewed"
        );

        let grace = self.config.client.call_timeout;
        let client = Arc::clone(&old.client);
        self.teardown
            .schedule(format!("{} client", old.service), grace, async move {
                client.close().await;
            });

        let notifier = self.notifier.clone();
        self.teardown.schedule(
            format!("{} discovery", old.service),
            grace + DISCOVERY_CLOSE_MARGIN,
            async move {
                old.discovery.close().await;
                if let Some(n) = notifier {
                    n.graceful(format!("renew {} client: old client and discovery closed", old.service));
                }
            },
        );
    }

    pub fn contains(&self, service: &str) -> bool {
        self.entries.contains_key(service)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of entries constructed since start.
    pub fn builds(&self) -> u64 {
        self.builds.load(Ordering::Relaxed)
    }

    pub fn teardown(&self) -> &TeardownQueue {
        &self.teardown
    }

    /// Close every cached entry now. Used at process shutdown.
    pub async fn close_all(&self) {
        let services: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        for service in services {
            if let Some((_, entry)) = self.entries.remove(&service) {
                entry.client.close().await;
                entry.discovery.close().await;
            }
        }
    }
}
