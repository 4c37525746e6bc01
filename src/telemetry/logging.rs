//! Process-wide tracing subscriber.
//!
//! JSON or pretty output, to stderr or to a daily-rolled file under the
//! service log directory.

use std::path::PathBuf;

use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub format: LogFormat,
    /// Filter directive, e.g. `info` or `rpcx_core=debug`. `RUST_LOG` wins when set.
    pub level: String,
    /// Directory for the process log. None logs to stderr.
    pub dir: Option<PathBuf>,
    /// File name prefix inside `dir`.
    pub file_name: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Json,
            level: "info".to_string(),
            dir: None,
            file_name: "rpcx.log".to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum LogError {
    #[error("invalid log filter: {0}")]
    InvalidFilter(String),

    #[error("open log file error: {0}")]
    FileOpen(String),

    #[error("subscriber already initialized")]
    AlreadyInitialized,
}

/// Install the global subscriber. Keep the returned guard alive while the
/// process runs; dropping it flushes the file writer.
pub fn init_logging(config: &LogConfig) -> Result<Option<WorkerGuard>, LogError> {
    let directive = std::env::var("RUST_LOG").unwrap_or_else(|_| config.level.clone());
    let filter =
        EnvFilter::try_new(&directive).map_err(|e| LogError::InvalidFilter(e.to_string()))?;
    let registry = tracing_subscriber::registry().with(filter);

    if let Some(dir) = &config.dir {
        let appender = RollingFileAppender::builder()
            .rotation(Rotation::DAILY)
            .filename_prefix(&config.file_name)
            .build(dir)
            .map_err(|e| LogError::FileOpen(e.to_string()))?;
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let layer = fmt::layer().json().with_writer(writer);
        registry
            .with(layer)
            .try_init()
            .map_err(|_| LogError::AlreadyInitialized)?;
        return Ok(Some(guard));
    }

    match config.format {
        LogFormat::Json => registry.with(fmt::layer().json()).try_init(),
        LogFormat::Pretty => registry.with(fmt::layer().pretty()).try_init(),
    }
    .map_err(|_| LogError::AlreadyInitialized)?;
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_filter_is_rejected() {
        let config = LogConfig {
            level: "rpcx_core=loudest".into(),
            ..LogConfig::default()
        };
        if std::env::var("RUST_LOG").is_err() {
            assert!(matches!(init_logging(&config), Err(LogError::InvalidFilter(_))));
        }
    }
}
