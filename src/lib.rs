//! RPCX-CORE
//!
//! Versioned handler dispatch for RPC services, plus a discovery-backed client
//! pool for calling other services.
//!
//! # Layout
//!
//! - `service`: handler registry, version resolution, per-call context and
//!   the dispatcher with its panic boundary
//! - `client`: discovery, load-balanced clients and the per-service pool
//! - `telemetry`: process logging, named file sinks, metrics
//! - `notify`: webhook notifications for faults and lifecycle events
//! - `server`: TCP accept loop and discovery registration
//!
//! Everything a running service shares lives in one [`Runtime`], built once
//! at startup from a validated [`config::ServiceConfig`].

pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod host;
pub mod notify;
pub mod server;
pub mod service;
pub mod shutdown;
pub mod telemetry;
pub mod value;
pub mod wire;

use std::sync::Arc;
use std::time::Duration;

use client::discovery::{DiscoveryFactory, MemoryDiscovery, Registrar};
use client::pool::{ConnectionPool, PoolConfig};
use client::transport::{TcpTransportFactory, TransportFactory};
use config::ServiceConfig;
use error::RpcError;
use host::ServiceIdentity;
use notify::{Notifier, NotifySink};
use service::dispatch::Dispatcher;
use service::registry::HandlerRegistry;
use service::reply::Payload;
use service::session::{MemorySessionStore, SessionStore};
use shutdown::ShutdownResult;
use telemetry::{LogError, LoggerCache, ServiceLogger, SinkCacheConfig};
use value::Args;

/// External backends the runtime talks to.
#[derive(Clone)]
pub struct Backends {
    pub discovery: Arc<dyn DiscoveryFactory>,
    pub registrar: Arc<dyn Registrar>,
    pub transports: Arc<dyn TransportFactory>,
    pub sessions: Option<Arc<dyn SessionStore>>,
    /// Overrides webhook delivery when set.
    pub notify_sink: Option<Arc<dyn NotifySink>>,
}

impl Backends {
    /// In-process discovery and sessions with the bundled TCP transport.
    pub fn in_memory() -> Self {
        let discovery = MemoryDiscovery::new();
        Self {
            discovery: Arc::new(discovery.clone()),
            registrar: Arc::new(discovery),
            transports: Arc::new(TcpTransportFactory),
            sessions: Some(Arc::new(MemorySessionStore::new())),
            notify_sink: None,
        }
    }
}

/// Shared state of one running service.
pub struct Runtime {
    config: ServiceConfig,
    identity: Arc<ServiceIdentity>,
    registry: Arc<HandlerRegistry>,
    dispatcher: Arc<Dispatcher>,
    pool: Arc<ConnectionPool>,
    loggers: Arc<LoggerCache>,
    notifier: Arc<Notifier>,
    backends: Backends,
}

impl Runtime {
    pub fn new(config: ServiceConfig, registry: HandlerRegistry, backends: Backends) -> Self {
        let identity = Arc::new(config.identity.clone());
        let notifier = Arc::new(match &backends.notify_sink {
            Some(sink) => {
                Notifier::with_sink(config.notify.clone(), Arc::clone(&identity), Arc::clone(sink))
            }
            None => Notifier::new(config.notify.clone(), Arc::clone(&identity)),
        });

        let registry = Arc::new(registry);
        let mut dispatcher = Dispatcher::new(
            Arc::clone(&registry),
            config.dispatch.clone(),
            Arc::clone(&identity),
        )
        .with_notifier(Arc::clone(&notifier));
        if let Some(sessions) = &backends.sessions {
            dispatcher = dispatcher.with_sessions(Arc::clone(sessions));
        }

        let pool = ConnectionPool::new(
            PoolConfig {
                base_path: config.discovery.base_path.clone(),
                client: config.client.clone(),
                renew_one_in: config.renew_one_in,
            },
            Arc::clone(&backends.discovery),
            Arc::clone(&backends.transports),
        )
        .with_notifier(Arc::clone(&notifier));

        let loggers = LoggerCache::new(SinkCacheConfig {
            capacity: config.log_sink_capacity,
            ..SinkCacheConfig::new(&config.log_dir)
        });

        tracing::info!(
            service = %identity.name,
            paths = registry.len(),
            services = registry.services().len(),
            "runtime ready"
        );
        Self {
            config,
            identity,
            registry,
            dispatcher: Arc::new(dispatcher),
            pool: Arc::new(pool),
            loggers: Arc::new(loggers),
            notifier,
            backends,
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn identity(&self) -> &ServiceIdentity {
        &self.identity
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        Arc::clone(&self.dispatcher)
    }

    pub fn pool(&self) -> Arc<ConnectionPool> {
        Arc::clone(&self.pool)
    }

    pub fn notifier(&self) -> &Arc<Notifier> {
        &self.notifier
    }

    pub fn registrar(&self) -> Arc<dyn Registrar> {
        Arc::clone(&self.backends.registrar)
    }

    /// Named logger writing to `<log_dir>/<name>.log`.
    pub fn logger(&self, name: &str) -> Result<ServiceLogger, LogError> {
        ServiceLogger::open(
            Arc::clone(&self.loggers),
            name,
            Some(Arc::clone(&self.notifier)),
        )
    }

    pub fn loggers(&self) -> &LoggerCache {
        &self.loggers
    }

    /// Call `path` on another service through the pool.
    pub async fn call(&self, service: &str, path: &str, args: Args) -> Result<Payload, RpcError> {
        self.pool.call(service, path, args).await
    }

    /// Close pooled clients, wait for deferred teardowns and queued
    /// notifications.
    pub async fn close(&self, timeout: Duration) {
        self.pool.close_all().await;
        if let ShutdownResult::Timeout { remaining } = self.pool.teardown().drain(timeout).await {
            tracing::warn!(remaining, "pool teardown still pending at exit");
        }
        if !self.notifier.flush(timeout).await {
            tracing::warn!(pending = self.notifier.pending(), "notifications still pending at exit");
        }
        self.loggers.clear();
    }
}
