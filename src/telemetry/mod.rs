//! Logging, named file sinks and metrics.
//!
//! Process logs go through the global `tracing` subscriber; per-name sinks
//! write to their own files under the service log directory.

mod logging;
pub mod metrics;
mod service_logger;
mod sink_cache;

pub use logging::{init_logging, LogConfig, LogError, LogFormat};
pub use service_logger::ServiceLogger;
pub use sink_cache::{
    LogSink, LoggerCache, SinkCacheConfig, SinkRotation, DEFAULT_SINK_CAPACITY,
};
