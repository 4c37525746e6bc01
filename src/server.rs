//! Inbound side: TCP accept loop, discovery registration and lifecycle.
//!
//! One task per connection reads call frames and answers each in order.
//! Every call holds a shutdown guard until its reply is written, so a drain
//! waits for it.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::client::discovery::Registrar;
use crate::error::RpcError;
use crate::service::call::CallOrigin;
use crate::service::dispatch::Dispatcher;
use crate::shutdown::{ShutdownCoordinator, ShutdownResult};
use crate::wire::{self, WireMessage};
use crate::Runtime;

pub const DEFAULT_MAX_CONNECTIONS: usize = 1024;
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("bind {addr} failed: {reason}")]
    Bind { addr: String, reason: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("accept loop failed: {0}")]
    Join(String),
}

/// Why serving stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Ready,
    Restart,
    Shutdown,
}

/// `"<name> service(<pid>) is ..."` text for lifecycle notifications.
pub fn lifecycle_message(name: &str, pid: u32, event: Lifecycle) -> String {
    let what = match event {
        Lifecycle::Ready => "is ready to serve",
        Lifecycle::Restart => "is restarting",
        Lifecycle::Shutdown => "is shutting down",
    };
    format!("{} service({}) {}", name, pid, what)
}

/// Wait for SIGHUP (restart) or SIGINT/SIGTERM (shutdown).
#[cfg(unix)]
pub async fn wait_for_signal() -> std::io::Result<Lifecycle> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = hangup.recv() => Ok(Lifecycle::Restart),
        _ = interrupt.recv() => Ok(Lifecycle::Shutdown),
        _ = terminate.recv() => Ok(Lifecycle::Shutdown),
    }
}

#[cfg(not(unix))]
pub async fn wait_for_signal() -> std::io::Result<Lifecycle> {
    tokio::signal::ctrl_c().await?;
    Ok(Lifecycle::Shutdown)
}

/// Caps concurrent connections with an atomic counter.
#[derive(Debug)]
pub struct ConnectionLimit {
    active: AtomicUsize,
    max: usize,
}

impl ConnectionLimit {
    pub fn new(max: usize) -> Self {
        Self {
            active: AtomicUsize::new(0),
            max,
        }
    }

    pub fn try_acquire(self: &Arc<Self>) -> Option<ConnectionSlot> {
        loop {
            let current = self.active.load(Ordering::Relaxed);
            if current >= self.max {
                return None;
            }
            if self
                .active
                .compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                return Some(ConnectionSlot {
                    limit: Arc::clone(self),
                });
            }
        }
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }
}

pub struct ConnectionSlot {
    limit: Arc<ConnectionLimit>,
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.limit.active.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct Server {
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
    shutdown: ShutdownCoordinator,
    limit: Arc<ConnectionLimit>,
}

impl Server {
    pub async fn bind(
        addr: &str,
        dispatcher: Arc<Dispatcher>,
        shutdown: ShutdownCoordinator,
        max_connections: usize,
    ) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind {
                addr: addr.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            listener,
            dispatcher,
            shutdown,
            limit: Arc::new(ConnectionLimit::new(max_connections)),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept until the shutdown token is cancelled.
    pub async fn run(self) -> Result<(), ServerError> {
        let token = self.shutdown.token();
        loop {
            let (stream, peer) = tokio::select! {
                _ = token.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        continue;
                    }
                },
            };

            let Some(slot) = self.limit.try_acquire() else {
                tracing::warn!(%peer, active = self.limit.active(), "connection limit reached");
                continue;
            };
            let _ = stream.set_nodelay(true);
            let dispatcher = Arc::clone(&self.dispatcher);
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move {
                let _slot = slot;
                serve_connection(stream, peer, dispatcher, shutdown).await;
            });
        }
        tracing::info!("accept loop stopped");
        Ok(())
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    shutdown: ShutdownCoordinator,
) {
    let (mut reader, mut writer) = stream.into_split();
    let token = shutdown.token();
    loop {
        let frame = tokio::select! {
            _ = token.cancelled() => break,
            frame = wire::read_frame(&mut reader) => frame,
        };
        let (id, path, args, gateway) = match frame {
            Ok(Some(WireMessage::Call {
                id,
                path,
                args,
                gateway,
            })) => (id, path, args, gateway),
            Ok(Some(other)) => {
                tracing::warn!(%peer, id = other.id(), "unexpected frame from client");
                break;
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(%peer, error = %e, "read frame failed");
                break;
            }
        };

        let Some(guard) = shutdown.track() else {
            let refused = WireMessage::from_error(id, &RpcError::OperationFailed);
            let _ = wire::write_frame(&mut writer, &refused).await;
            break;
        };

        let origin = if gateway {
            CallOrigin::Gateway
        } else {
            CallOrigin::Native
        };
        let reply = match dispatcher.dispatch(&path, args, origin).await {
            Ok(payload) => WireMessage::Reply { id, payload },
            Err(e) => {
                if e.is_caller_facing() {
                    tracing::debug!(%peer, path = %path, error = %e, "call rejected");
                } else {
                    tracing::warn!(%peer, path = %path, error = %e, "call failed");
                }
                WireMessage::from_error(id, &e)
            }
        };
        let written = wire::write_frame(&mut writer, &reply).await;
        drop(guard);
        if let Err(e) = written {
            tracing::debug!(%peer, error = %e, "write frame failed");
            break;
        }
    }
}

/// Publish `member` now and every `interval` until `token` is cancelled,
/// then withdraw it.
pub fn spawn_registration(
    registrar: Arc<dyn Registrar>,
    base_path: String,
    service: String,
    member: String,
    interval: Duration,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let ttl = interval * 3;
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = registrar.register(&base_path, &service, &member, ttl).await {
                        tracing::warn!(service = %service, member = %member, error = %e, "discovery registration failed");
                    }
                }
            }
        }
        if let Err(e) = registrar.unregister(&base_path, &service, &member).await {
            tracing::warn!(service = %service, member = %member, error = %e, "discovery unregister failed");
        }
    })
}

/// Serve until `stop` resolves, then drain and return why serving stopped.
///
/// Sends the ready notice once listening and the restart or shutdown notice
/// before draining.
pub async fn serve<F>(
    runtime: &Runtime,
    registrar: Arc<dyn Registrar>,
    stop: F,
) -> Result<Lifecycle, ServerError>
where
    F: Future<Output = Lifecycle>,
{
    let config = runtime.config();
    let identity = runtime.identity();
    let shutdown = ShutdownCoordinator::new();
    let server = Server::bind(
        &config.bind_addr,
        runtime.dispatcher(),
        shutdown.clone(),
        DEFAULT_MAX_CONNECTIONS,
    )
    .await?;
    let local = server.local_addr()?;

    let advertised = if identity.addr.ends_with(":0") {
        local.to_string()
    } else {
        identity.addr.clone()
    };
    let registration = spawn_registration(
        registrar,
        config.discovery.base_path.clone(),
        identity.name.clone(),
        format!("tcp@{}", advertised),
        config.discovery.update_interval,
        shutdown.token(),
    );

    let pid = std::process::id();
    tracing::info!(service = %identity.name, addr = %local, mode = %identity.mode, "serving");
    runtime
        .notifier()
        .graceful(lifecycle_message(&identity.name, pid, Lifecycle::Ready));

    let accept = tokio::spawn(server.run());
    let event = stop.await;

    runtime
        .notifier()
        .graceful(lifecycle_message(&identity.name, pid, event));
    match shutdown.initiate(DEFAULT_SHUTDOWN_TIMEOUT).await {
        ShutdownResult::Complete => tracing::info!("in-flight calls drained"),
        ShutdownResult::Timeout { remaining } => {
            tracing::warn!(remaining, "drain timed out with calls in flight");
        }
    }

    if let Err(e) = registration.await {
        tracing::warn!(error = %e, "registration task failed");
    }
    accept
        .await
        .map_err(|e| ServerError::Join(e.to_string()))??;
    Ok(event)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::discovery::MemoryDiscovery;

    #[test]
    fn lifecycle_texts() {
        assert_eq!(
            lifecycle_message("user", 42, Lifecycle::Ready),
            "user service(42) is ready to serve"
        );
        assert_eq!(
            lifecycle_message("user", 42, Lifecycle::Shutdown),
            "user service(42) is shutting down"
        );
    }

    #[test]
    fn limit_refuses_past_max() {
        let limit = Arc::new(ConnectionLimit::new(1));
        let slot = limit.try_acquire();
        assert!(slot.is_some());
        assert!(limit.try_acquire().is_none());
        drop(slot);
        assert!(limit.try_acquire().is_some());
    }

    #[tokio::test]
    async fn registration_publishes_then_withdraws() {
        let backend = MemoryDiscovery::new();
        let token = CancellationToken::new();
        let task = spawn_registration(
            Arc::new(backend.clone()),
            "/rpcx".into(),
            "user".into(),
            "tcp@10.0.0.1:9000".into(),
            Duration::from_secs(30),
            token.clone(),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(backend.members("/rpcx", "user"), vec!["tcp@10.0.0.1:9000".to_string()]);

        token.cancel();
        task.await.unwrap();
        assert!(backend.members("/rpcx", "user").is_empty());
    }
}
