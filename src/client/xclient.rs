//! Load-balanced client for one remote service.
//!
//! Every call is bounded by the call timeout. Within that deadline the fail
//! mode decides whether to give up, fail over to another member, or race a
//! backup request. Each member has its own circuit.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::balance::{member_addr, FailMode, SelectMode, Selector};
use super::breaker::{ConsecutiveBreaker, Permit};
use super::discovery::Discovery;
use super::transport::{CallRequest, Transport, TransportError};
use crate::error::RpcError;
use crate::host::DEVELOP_MODE;
use crate::service::reply::Payload;
use crate::value::Args;

/// Resilience settings attached to every built client.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Attempts per call under failover.
    pub retries: u32,
    pub connect_timeout: Duration,
    /// Delay before a backup request under failbackup.
    pub backup_latency: Duration,
    /// Consecutive failures that open a member's circuit.
    pub breaker_failures: u32,
    pub breaker_cooldown: Duration,
    /// Deadline for a whole call, retries included.
    pub call_timeout: Duration,
    pub fail_mode: FailMode,
    pub select_mode: SelectMode,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            retries: 3,
            connect_timeout: Duration::from_secs(1),
            backup_latency: Duration::from_millis(10),
            breaker_failures: 10,
            breaker_cooldown: Duration::from_secs(60),
            call_timeout: Duration::from_secs(15),
            fail_mode: FailMode::Failover,
            select_mode: SelectMode::RoundRobin,
        }
    }
}

impl ClientOptions {
    /// Development fails fast on random members; everything else fails over
    /// round-robin.
    pub fn for_mode(mode: &str) -> Self {
        if mode == DEVELOP_MODE {
            Self {
                fail_mode: FailMode::Failfast,
                select_mode: SelectMode::Random,
                ..Self::default()
            }
        } else {
            Self::default()
        }
    }
}

pub struct BalancedClient {
    service: String,
    discovery: Arc<dyn Discovery>,
    transport: Arc<dyn Transport>,
    options: ClientOptions,
    selector: Selector,
    breaker: ConsecutiveBreaker,
    closed: AtomicBool,
}

impl BalancedClient {
    pub fn new(
        service: impl Into<String>,
        discovery: Arc<dyn Discovery>,
        transport: Arc<dyn Transport>,
        options: ClientOptions,
    ) -> Self {
        Self {
            service: service.into(),
            discovery,
            transport,
            selector: Selector::new(options.select_mode),
            breaker: ConsecutiveBreaker::new(options.breaker_failures, options.breaker_cooldown),
            options,
            closed: AtomicBool::new(false),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Call `path` on some member within the configured deadline.
    pub async fn call(&self, path: &str, args: Args) -> Result<Payload, RpcError> {
        self.call_with_timeout(path, args, self.options.call_timeout)
            .await
    }

    pub async fn call_with_timeout(
        &self,
        path: &str,
        args: Args,
        timeout: Duration,
    ) -> Result<Payload, RpcError> {
        let request = CallRequest {
            service: self.service.clone(),
            path: path.to_string(),
            args,
            gateway: false,
        };
        match tokio::time::timeout(timeout, self.call_inner(&request)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(service = %self.service, path, "call timed out");
                Err(RpcError::Timeout {
                    service: self.service.clone(),
                    method: path.to_string(),
                    after_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    async fn call_inner(&self, request: &CallRequest) -> Result<Payload, RpcError> {
        if self.is_closed() {
            return Err(RpcError::ClientClosed(self.service.clone()));
        }
        match self.options.fail_mode {
            FailMode::Failfast => {
                let permit = self.select(&[])?;
                self.invoke(permit, request).await
            }
            FailMode::Failover => self.call_failover(request).await,
            FailMode::Failbackup => self.call_backup(request).await,
        }
    }

    async fn call_failover(&self, request: &CallRequest) -> Result<Payload, RpcError> {
        let mut tried: Vec<String> = Vec::new();
        let mut last_err = None;
        for _ in 0..self.options.retries.max(1) {
            let permit = match self.select(&tried) {
                Ok(permit) => permit,
                Err(e) if tried.is_empty() => return Err(e),
                Err(_) => {
                    // Every member failed once; start another round.
                    tried.clear();
                    match self.select(&tried) {
                        Ok(permit) => permit,
                        Err(e) => return Err(last_err.unwrap_or(e)),
                    }
                }
            };
            let addr = permit.addr().to_string();
            match self.invoke(permit, request).await {
                Ok(payload) => return Ok(payload),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    tracing::debug!(service = %self.service, addr = %addr, error = %e, "failing over");
                    tried.push(addr);
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| RpcError::NoAvailableMember(self.service.clone())))
    }

    async fn call_backup(&self, request: &CallRequest) -> Result<Payload, RpcError> {
        let first = self.select(&[])?;
        let first_addr = first.addr().to_string();
        let mut primary = Box::pin(self.invoke(first, request));
        tokio::select! {
            result = &mut primary => return result,
            _ = tokio::time::sleep(self.options.backup_latency) => {}
        }

        let second = match self.select(&[first_addr]) {
            Ok(permit) => permit,
            Err(_) => return primary.await,
        };
        let backup = Box::pin(self.invoke(second, request));
        match futures::future::select_ok([primary, backup]).await {
            Ok((payload, _)) => Ok(payload),
            Err(e) => Err(e),
        }
    }

    /// Pick a member outside `exclude` whose circuit admits a call.
    fn select(&self, exclude: &[String]) -> Result<Permit<'_>, RpcError> {
        let candidates: Vec<String> = self
            .discovery
            .members()
            .iter()
            .map(|m| member_addr(m).to_string())
            .filter(|a| !exclude.contains(a))
            .collect();

        let start = self
            .selector
            .pick(candidates.len())
            .ok_or_else(|| RpcError::NoAvailableMember(self.service.clone()))?;
        (0..candidates.len())
            .map(|offset| &candidates[(start + offset) % candidates.len()])
            .find_map(|addr| self.breaker.try_acquire(addr))
            .ok_or_else(|| RpcError::CircuitOpen(self.service.clone()))
    }

    /// Call the member behind `permit` and settle its circuit with the outcome.
    async fn invoke(&self, permit: Permit<'_>, request: &CallRequest) -> Result<Payload, RpcError> {
        match self
            .transport
            .call(permit.addr(), request, self.options.connect_timeout)
            .await
        {
            Ok(payload) => {
                permit.success();
                Ok(payload)
            }
            Err(TransportError::Remote {
                code,
                kind,
                message,
            }) => {
                permit.success();
                Err(RpcError::from_remote(code, &kind, message))
            }
            Err(e) => {
                permit.failure();
                Err(RpcError::Transport(e))
            }
        }
    }

    /// Refuse new calls and release the transport.
    pub async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.transport.close().await;
            tracing::debug!(service = %self.service, "client closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::breaker::CircuitState;
    use crate::client::discovery::{DiscoveryFactory, MemoryDiscovery};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::{HashMap, VecDeque};

    /// Fails for listed addresses, sleeps for slow ones, answers otherwise.
    #[derive(Default)]
    struct ScriptedTransport {
        failing: Vec<String>,
        slow: Vec<String>,
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn call(
            &self,
            addr: &str,
            _request: &CallRequest,
            _connect_timeout: Duration,
        ) -> Result<Payload, TransportError> {
            self.calls.lock().push(addr.to_string());
            if self.slow.iter().any(|a| a == addr) {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            if self.failing.iter().any(|a| a == addr) {
                return Err(TransportError::Io("reset".into()));
            }
            Ok(Payload::Text(addr.to_string()))
        }

        async fn close(&self) {}
    }

    enum Step {
        Fail,
        Hang,
    }

    /// Plays each member's steps in order, then answers every later call.
    struct SequencedTransport {
        steps: Mutex<HashMap<String, VecDeque<Step>>>,
        calls: Mutex<usize>,
    }

    impl SequencedTransport {
        fn new(addr: &str, steps: Vec<Step>) -> Self {
            Self {
                steps: Mutex::new(HashMap::from([(addr.to_string(), steps.into())])),
                calls: Mutex::new(0),
            }
        }
    }

    #[async_trait]
    impl Transport for SequencedTransport {
        async fn call(
            &self,
            addr: &str,
            _request: &CallRequest,
            _connect_timeout: Duration,
        ) -> Result<Payload, TransportError> {
            *self.calls.lock() += 1;
            let step = self
                .steps
                .lock()
                .get_mut(addr)
                .and_then(|steps| steps.pop_front());
            match step {
                Some(Step::Fail) => Err(TransportError::Io("reset".into())),
                Some(Step::Hang) => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(Payload::Text(addr.to_string()))
                }
                None => Ok(Payload::Text(addr.to_string())),
            }
        }

        async fn close(&self) {}
    }

    async fn client(
        members: &[&str],
        transport: Arc<dyn Transport>,
        options: ClientOptions,
    ) -> BalancedClient {
        let backend = MemoryDiscovery::new();
        for m in members {
            backend.insert("/rpcx", "user", &format!("tcp@{}", m));
        }
        let discovery = backend.open("/rpcx", "user").await.unwrap();
        BalancedClient::new("user", discovery, transport, options)
    }

    #[test]
    fn development_fails_fast_randomly() {
        let dev = ClientOptions::for_mode(DEVELOP_MODE);
        assert_eq!(dev.fail_mode, FailMode::Failfast);
        assert_eq!(dev.select_mode, SelectMode::Random);
        let prod = ClientOptions::for_mode("production");
        assert_eq!(prod.fail_mode, FailMode::Failover);
        assert_eq!(prod.select_mode, SelectMode::RoundRobin);
        assert_eq!(prod.retries, 3);
    }

    #[tokio::test]
    async fn failover_moves_to_a_healthy_member() {
        let transport = Arc::new(ScriptedTransport {
            failing: vec!["a:1".into()],
            ..Default::default()
        });
        let client = client(&["a:1", "b:1"], transport.clone(), ClientOptions::default()).await;
        for _ in 0..4 {
            let payload = client.call("user/info", Args::new()).await.unwrap();
            assert_eq!(payload, Payload::Text("b:1".into()));
        }
    }

    #[tokio::test]
    async fn failfast_returns_first_error() {
        let transport = Arc::new(ScriptedTransport {
            failing: vec!["a:1".into()],
            ..Default::default()
        });
        let options = ClientOptions {
            fail_mode: FailMode::Failfast,
            ..ClientOptions::default()
        };
        let client = client(&["a:1"], transport.clone(), options).await;
        let err = client.call("user/info", Args::new()).await.unwrap_err();
        assert!(matches!(err, RpcError::Transport(_)));
        assert_eq!(transport.calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn no_members_is_reported() {
        let transport = Arc::new(ScriptedTransport::default());
        let client = client(&[], transport, ClientOptions::default()).await;
        assert!(matches!(
            client.call("user/info", Args::new()).await,
            Err(RpcError::NoAvailableMember(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_members_hit_the_deadline() {
        let transport = Arc::new(ScriptedTransport {
            slow: vec!["a:1".into()],
            ..Default::default()
        });
        let options = ClientOptions {
            call_timeout: Duration::from_secs(15),
            ..ClientOptions::default()
        };
        let client = client(&["a:1"], transport, options).await;
        match client.call("user/info", Args::new()).await {
            Err(RpcError::Timeout { after_ms, .. }) => assert_eq!(after_ms, 15_000),
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn backup_request_beats_a_slow_primary() {
        let transport = Arc::new(ScriptedTransport {
            slow: vec!["a:1".into()],
            ..Default::default()
        });
        let options = ClientOptions {
            fail_mode: FailMode::Failbackup,
            ..ClientOptions::default()
        };
        let client = client(&["a:1", "b:1"], transport, options).await;
        // Round-robin starts at the first sorted member, the slow one.
        let payload = client.call("user/info", Args::new()).await.unwrap();
        assert_eq!(payload, Payload::Text("b:1".into()));
    }

    #[tokio::test]
    async fn repeated_failures_open_the_circuit() {
        let transport = Arc::new(ScriptedTransport {
            failing: vec!["a:1".into()],
            ..Default::default()
        });
        let options = ClientOptions {
            fail_mode: FailMode::Failfast,
            breaker_failures: 2,
            ..ClientOptions::default()
        };
        let client = client(&["a:1"], transport.clone(), options).await;
        for _ in 0..2 {
            assert!(client.call("user/info", Args::new()).await.is_err());
        }
        assert!(matches!(
            client.call("user/info", Args::new()).await,
            Err(RpcError::CircuitOpen(_))
        ));
        assert_eq!(transport.calls.lock().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_trial_reopens_then_recovers() {
        let transport = Arc::new(SequencedTransport::new("a:1", vec![Step::Fail, Step::Hang]));
        let options = ClientOptions {
            fail_mode: FailMode::Failfast,
            breaker_failures: 1,
            breaker_cooldown: Duration::from_secs(60),
            ..ClientOptions::default()
        };
        let client = client(&["a:1"], transport.clone(), options).await;

        assert!(matches!(
            client.call("user/info", Args::new()).await,
            Err(RpcError::Transport(_))
        ));
        tokio::time::advance(Duration::from_secs(61)).await;

        // The trial hangs past the deadline and its future is dropped.
        assert!(matches!(
            client.call("user/info", Args::new()).await,
            Err(RpcError::Timeout { after_ms: 15_000, .. })
        ));
        assert!(matches!(client.breaker.state("a:1"), CircuitState::Open { .. }));
        assert!(matches!(
            client.call("user/info", Args::new()).await,
            Err(RpcError::CircuitOpen(_))
        ));

        tokio::time::advance(Duration::from_secs(61)).await;
        let payload = client.call("user/info", Args::new()).await.unwrap();
        assert_eq!(payload, Payload::Text("a:1".into()));
        assert_eq!(client.breaker.state("a:1"), CircuitState::Closed { failures: 0 });
        assert_eq!(*transport.calls.lock(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn trial_losing_a_backup_race_releases_its_slot() {
        let transport = Arc::new(SequencedTransport::new("a:1", vec![Step::Fail, Step::Hang]));
        let options = ClientOptions {
            fail_mode: FailMode::Failbackup,
            select_mode: SelectMode::RoundRobin,
            breaker_failures: 1,
            breaker_cooldown: Duration::from_secs(60),
            ..ClientOptions::default()
        };
        let client = client(&["a:1", "b:1"], transport.clone(), options).await;

        // a:1 fails outright and opens its circuit.
        assert!(client.call("user/info", Args::new()).await.is_err());
        assert!(matches!(client.breaker.state("a:1"), CircuitState::Open { .. }));
        tokio::time::advance(Duration::from_secs(61)).await;

        // Round-robin moves on to b:1 first.
        let payload = client.call("user/info", Args::new()).await.unwrap();
        assert_eq!(payload, Payload::Text("b:1".into()));

        // The a:1 trial hangs and b:1 wins the backup race.
        let payload = client.call("user/info", Args::new()).await.unwrap();
        assert_eq!(payload, Payload::Text("b:1".into()));
        assert!(matches!(client.breaker.state("a:1"), CircuitState::Open { .. }));

        tokio::time::advance(Duration::from_secs(61)).await;
        let mut answered = Vec::new();
        for _ in 0..2 {
            answered.push(client.call("user/info", Args::new()).await.unwrap());
        }
        assert!(answered.contains(&Payload::Text("a:1".into())));
        assert_eq!(client.breaker.state("a:1"), CircuitState::Closed { failures: 0 });
    }

    #[tokio::test]
    async fn closed_client_refuses_calls() {
        let transport = Arc::new(ScriptedTransport::default());
        let client = client(&["a:1"], transport, ClientOptions::default()).await;
        client.close().await;
        assert!(matches!(
            client.call("user/info", Args::new()).await,
            Err(RpcError::ClientClosed(_))
        ));
    }
}
