//! Outbound transport seam and the bundled TCP implementation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::net::TcpStream;

use crate::service::reply::Payload;
use crate::value::Args;
use crate::wire::{self, WireError, WireMessage};

const MAX_IDLE_PER_ADDR: usize = 8;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("connect to {addr} failed: {reason}")]
    Connect { addr: String, reason: String },

    #[error("connect to {0} timed out")]
    ConnectTimeout(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("remote error {code} ({kind}): {message}")]
    Remote {
        code: i32,
        kind: String,
        message: String,
    },

    #[error("transport closed")]
    Closed,
}

impl TransportError {
    /// The remote answered with an error; the member itself is healthy.
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote { .. })
    }
}

impl From<WireError> for TransportError {
    fn from(e: WireError) -> Self {
        match e {
            WireError::Io(io) => Self::Io(io.to_string()),
            other => Self::Protocol(other.to_string()),
        }
    }
}

/// One outbound call.
#[derive(Debug, Clone, PartialEq)]
pub struct CallRequest {
    pub service: String,
    pub path: String,
    pub args: Args,
    pub gateway: bool,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn call(
        &self,
        addr: &str,
        request: &CallRequest,
        connect_timeout: Duration,
    ) -> Result<Payload, TransportError>;

    /// Drop pooled connections and refuse further calls.
    async fn close(&self);
}

pub trait TransportFactory: Send + Sync {
    fn create(&self, service: &str) -> Arc<dyn Transport>;
}

/// Length-prefixed JSON over TCP, keeping idle connections per address.
pub struct TcpTransport {
    idle: Mutex<HashMap<String, Vec<TcpStream>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpTransport {
    pub fn new() -> Self {
        Self {
            idle: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    fn take_idle(&self, addr: &str) -> Option<TcpStream> {
        self.idle.lock().get_mut(addr).and_then(Vec::pop)
    }

    fn put_idle(&self, addr: &str, stream: TcpStream) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let mut idle = self.idle.lock();
        let streams = idle.entry(addr.to_string()).or_default();
        if streams.len() < MAX_IDLE_PER_ADDR {
            streams.push(stream);
        }
    }

    async fn connect(addr: &str, timeout: Duration) -> Result<TcpStream, TransportError> {
        match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                let _ = stream.set_nodelay(true);
                Ok(stream)
            }
            Ok(Err(e)) => Err(TransportError::Connect {
                addr: addr.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(TransportError::ConnectTimeout(addr.to_string())),
        }
    }

    async fn exchange(
        &self,
        stream: &mut TcpStream,
        request: &CallRequest,
    ) -> Result<Payload, TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let message = WireMessage::Call {
            id,
            path: request.path.clone(),
            args: request.args.clone(),
            gateway: request.gateway,
        };
        wire::write_frame(stream, &message).await?;

        match wire::read_frame(stream).await? {
            Some(WireMessage::Reply { id: got, payload }) if got == id => Ok(payload),
            Some(WireMessage::Error {
                id: got,
                code,
                kind,
                message,
            }) if got == id => Err(TransportError::Remote {
                code,
                kind,
                message,
            }),
            Some(other) => Err(TransportError::Protocol(format!(
                "unexpected frame for call {}: id {}",
                id,
                other.id()
            ))),
            None => Err(TransportError::Io("connection closed by peer".to_string())),
        }
    }

    async fn call_fresh(
        &self,
        addr: &str,
        request: &CallRequest,
        connect_timeout: Duration,
    ) -> Result<Payload, TransportError> {
        let mut stream = Self::connect(addr, connect_timeout).await?;
        let result = self.exchange(&mut stream, request).await;
        if keeps_connection(&result) {
            self.put_idle(addr, stream);
        }
        result
    }
}

fn keeps_connection(result: &Result<Payload, TransportError>) -> bool {
    match result {
        Ok(_) => true,
        Err(e) => e.is_remote(),
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn call(
        &self,
        addr: &str,
        request: &CallRequest,
        connect_timeout: Duration,
    ) -> Result<Payload, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        let Some(mut stream) = self.take_idle(addr) else {
            return self.call_fresh(addr, request, connect_timeout).await;
        };
        let result = self.exchange(&mut stream, request).await;
        if keeps_connection(&result) {
            self.put_idle(addr, stream);
            return result;
        }
        // Idle connection went stale; retry once on a new one.
        tracing::debug!(addr, "idle connection failed, reconnecting");
        self.call_fresh(addr, request, connect_timeout).await
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let dropped: usize = self.idle.lock().drain().map(|(_, v)| v.len()).sum();
        tracing::debug!(connections = dropped, "tcp transport closed");
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TcpTransportFactory;

impl TransportFactory for TcpTransportFactory {
    fn create(&self, _service: &str) -> Arc<dyn Transport> {
        Arc::new(TcpTransport::new())
    }
}
