//! Outbound side: discovery, load-balanced clients and the per-service pool.

pub mod balance;
pub mod breaker;
pub mod discovery;
pub mod pool;
pub mod teardown;
pub mod transport;
pub mod xclient;

pub use balance::{member_addr, FailMode, SelectMode, Selector};
pub use breaker::{CircuitState, ConsecutiveBreaker};
pub use discovery::{
    service_key, Discovery, DiscoveryError, DiscoveryFactory, MemoryDiscovery, MemoryWatch,
    Registrar,
};
pub use pool::{ConnectionPool, PoolConfig, PoolEntry};
pub use teardown::TeardownQueue;
pub use transport::{
    CallRequest, TcpTransport, TcpTransportFactory, Transport, TransportError, TransportFactory,
};
pub use xclient::{BalancedClient, ClientOptions};
