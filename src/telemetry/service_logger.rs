//! Named logger for handler code.
//!
//! Debug and info lines go to the named sink only. Warn and error lines also
//! raise an error notification carrying the caller's stack. When the cache
//! has evicted the sink, the next line reopens it through the cache.

use std::backtrace::Backtrace;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::Level;

use super::logging::LogError;
use super::sink_cache::{LogSink, LoggerCache};
use crate::notify::Notifier;

pub struct ServiceLogger {
    cache: Arc<LoggerCache>,
    sink: Mutex<Arc<LogSink>>,
    notifier: Option<Arc<Notifier>>,
}

impl ServiceLogger {
    /// Logger for `name`, opening its sink in `cache` when needed.
    pub fn open(
        cache: Arc<LoggerCache>,
        name: &str,
        notifier: Option<Arc<Notifier>>,
    ) -> Result<Self, LogError> {
        let sink = cache.get_sink(name)?;
        Ok(Self {
            cache,
            sink: Mutex::new(sink),
            notifier,
        })
    }

    pub fn name(&self) -> String {
        self.sink.lock().name().to_string()
    }

    pub fn debug(&self, msg: impl fmt::Display) {
        self.write(Level::DEBUG, &msg.to_string());
    }

    pub fn info(&self, msg: impl fmt::Display) {
        self.write(Level::INFO, &msg.to_string());
    }

    pub fn warn(&self, msg: impl fmt::Display) {
        self.alert(Level::WARN, "Warn: ", &msg.to_string());
    }

    pub fn error(&self, msg: impl fmt::Display) {
        self.alert(Level::ERROR, "Error: ", &msg.to_string());
    }

    fn write(&self, level: Level, msg: &str) {
        let sink = Arc::clone(&self.sink.lock());
        if sink.write(level, msg) {
            return;
        }
        match self.cache.get_sink(sink.name()) {
            Ok(fresh) => {
                fresh.write(level, msg);
                *self.sink.lock() = fresh;
            }
            Err(e) => tracing::warn!(logger = sink.name(), error = %e, "log sink reopen failed"),
        }
    }

    fn alert(&self, level: Level, prefix: &str, msg: &str) {
        self.write(level, msg);
        if let Some(notifier) = &self.notifier {
            let stack = Backtrace::force_capture().to_string();
            notifier.error(format!("{}{}", prefix, msg), Some(&stack));
        }
    }
}

impl Clone for ServiceLogger {
    fn clone(&self) -> Self {
        Self {
            cache: Arc::clone(&self.cache),
            sink: Mutex::new(Arc::clone(&self.sink.lock())),
            notifier: self.notifier.clone(),
        }
    }
}

impl fmt::Debug for ServiceLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceLogger")
            .field("name", &self.name())
            .field("notifies", &self.notifier.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::ServiceIdentity;
    use crate::notify::{Channel, MemorySink, NotifyConfig};
    use crate::telemetry::sink_cache::{LoggerCache, SinkCacheConfig, SinkRotation};
    use std::time::Duration;

    #[tokio::test]
    async fn warn_and_error_notify_but_info_does_not() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(LoggerCache::new(SinkCacheConfig {
            dir: dir.path().to_path_buf(),
            capacity: 4,
            rotation: SinkRotation::Never,
        }));
        let deliveries = Arc::new(MemorySink::new());
        let notifier = Arc::new(Notifier::with_sink(
            NotifyConfig {
                error_token: "err".into(),
                ..NotifyConfig::default()
            },
            Arc::new(ServiceIdentity::default()),
            deliveries.clone(),
        ));
        let logger = ServiceLogger::open(cache, "user", Some(Arc::clone(&notifier))).unwrap();

        logger.info("loaded profile");
        logger.warn("slow query");
        logger.error("write failed");
        assert!(notifier.flush(Duration::from_secs(5)).await);

        assert_eq!(deliveries.count(Channel::Error), 2);
        let sent = deliveries.delivered();
        assert!(sent.iter().any(|(_, n)| n.content.starts_with("Warn: slow query")));
        assert!(sent.iter().any(|(_, n)| n.content.contains("Stack:")));
    }

    #[test]
    fn evicted_sink_is_reopened_on_next_line() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(LoggerCache::new(SinkCacheConfig {
            dir: dir.path().to_path_buf(),
            capacity: 1,
            rotation: SinkRotation::Never,
        }));
        let logger = ServiceLogger::open(Arc::clone(&cache), "orders", None).unwrap();
        logger.info("before eviction");

        cache.get_sink("other").unwrap();
        assert!(!cache.contains("orders"));

        logger.info("after eviction");
        assert!(cache.contains("orders"));
        cache.clear();

        let text = std::fs::read_to_string(dir.path().join("orders.log")).unwrap();
        assert!(text.contains("before eviction"));
        assert!(text.contains("after eviction"));
    }
}
