//! Named file sinks, memoized by name with bulk eviction.
//!
//! Each sink writes JSON lines to `<dir>/<name>.log` through its own
//! non-blocking worker and its own `tracing::Dispatch`, so it never mixes
//! with the process subscriber. When the cache is full, about half of the
//! resident sinks are evicted before the new one goes in. Eviction flushes
//! and closes the sink's file at once, even while handles to it are still
//! held; writes through such a handle report the sink as closed.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{Dispatch, Level};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt};

use super::logging::LogError;
use super::metrics;

pub const DEFAULT_SINK_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SinkRotation {
    #[default]
    Daily,
    Never,
}

#[derive(Debug, Clone)]
pub struct SinkCacheConfig {
    pub dir: PathBuf,
    pub capacity: usize,
    pub rotation: SinkRotation,
}

impl SinkCacheConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            capacity: DEFAULT_SINK_CAPACITY,
            rotation: SinkRotation::Daily,
        }
    }
}

/// One named log file.
pub struct LogSink {
    name: String,
    writer: RwLock<Option<SinkWriter>>,
}

struct SinkWriter {
    dispatch: Dispatch,
    _guard: WorkerGuard,
}

impl std::fmt::Debug for LogSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogSink").field("name", &self.name).finish()
    }
}

impl LogSink {
    fn open(config: &SinkCacheConfig, name: &str) -> Result<Self, LogError> {
        let rotation = match config.rotation {
            SinkRotation::Daily => Rotation::DAILY,
            SinkRotation::Never => Rotation::NEVER,
        };
        let appender = RollingFileAppender::builder()
            .rotation(rotation)
            .filename_prefix(file_stem(name))
            .filename_suffix("log")
            .build(&config.dir)
            .map_err(|e| LogError::FileOpen(e.to_string()))?;
        let (writer, guard) = tracing_appender::non_blocking(appender);

        let subscriber = tracing_subscriber::registry().with(
            fmt::layer()
                .json()
                .with_ansi(false)
                .with_target(false)
                .with_writer(writer),
        );
        Ok(Self {
            name: name.to_string(),
            writer: RwLock::new(Some(SinkWriter {
                dispatch: Dispatch::new(subscriber),
                _guard: guard,
            })),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_closed(&self) -> bool {
        self.writer.read().is_none()
    }

    /// Flush pending lines and release the file and its worker thread.
    pub fn close(&self) {
        let writer = self.writer.write().take();
        if writer.is_some() {
            drop(writer);
            tracing::trace!(sink = %self.name, "log sink closed");
        }
    }

    /// Write one line at `level`. Returns false when the sink is closed.
    pub fn write(&self, level: Level, message: &str) -> bool {
        let writer = self.writer.read();
        let Some(writer) = writer.as_ref() else {
            return false;
        };
        tracing::dispatcher::with_default(&writer.dispatch, || {
            if level == Level::ERROR {
                tracing::error!("{}", message);
            } else if level == Level::WARN {
                tracing::warn!("{}", message);
            } else if level == Level::INFO {
                tracing::info!("{}", message);
            } else {
                tracing::debug!("{}", message);
            }
        });
        true
    }
}

/// File stem for a sink name; path separators are flattened.
fn file_stem(name: &str) -> String {
    let stem: String = name
        .chars()
        .map(|c| if matches!(c, '/' | '\\' | ':') { '_' } else { c })
        .collect();
    match stem.trim_matches('.') {
        "" => "default".to_string(),
        s => s.to_string(),
    }
}

pub struct LoggerCache {
    config: SinkCacheConfig,
    sinks: DashMap<String, Arc<LogSink>>,
    resident: AtomicUsize,
    insert_lock: Mutex<()>,
}

impl LoggerCache {
    pub fn new(mut config: SinkCacheConfig) -> Self {
        config.capacity = config.capacity.max(1);
        Self {
            config,
            sinks: DashMap::new(),
            resident: AtomicUsize::new(0),
            insert_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &SinkCacheConfig {
        &self.config
    }

    /// Sink for `name`, opened on first use.
    pub fn get_sink(&self, name: &str) -> Result<Arc<LogSink>, LogError> {
        if let Some(sink) = self.cached(name) {
            return Ok(sink);
        }

        let _guard = self.insert_lock.lock();
        if let Some(sink) = self.cached(name) {
            return Ok(sink);
        }
        if self.resident.load(Ordering::SeqCst) >= self.config.capacity {
            self.evict_half();
        }

        let sink = Arc::new(LogSink::open(&self.config, name)?);
        self.sinks.insert(name.to_string(), Arc::clone(&sink));
        self.resident.fetch_add(1, Ordering::SeqCst);
        Ok(sink)
    }

    fn cached(&self, name: &str) -> Option<Arc<LogSink>> {
        self.sinks.get(name).map(|s| Arc::clone(s.value()))
    }

    /// Drop the first half of the sinks in map iteration order.
    fn evict_half(&self) {
        let count = (self.sinks.len() + 1) / 2;
        let victims: Vec<String> = self
            .sinks
            .iter()
            .take(count)
            .map(|e| e.key().clone())
            .collect();

        let mut evicted = 0;
        for name in victims {
            if let Some((_, sink)) = self.sinks.remove(&name) {
                sink.close();
                self.resident.fetch_sub(1, Ordering::SeqCst);
                evicted += 1;
            }
        }
        metrics::record_sink_evicted(evicted);
        tracing::debug!(evicted, resident = self.len(), "log sinks evicted");
    }

    pub fn contains(&self, name: &str) -> bool {
        self.sinks.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.resident.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close and drop every sink.
    pub fn clear(&self) {
        let _guard = self.insert_lock.lock();
        for entry in self.sinks.iter() {
            entry.value().close();
        }
        self.sinks.clear();
        self.resident.store(0, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(dir: &std::path::Path, capacity: usize) -> LoggerCache {
        LoggerCache::new(SinkCacheConfig {
            dir: dir.to_path_buf(),
            capacity,
            rotation: SinkRotation::Never,
        })
    }

    #[test]
    fn same_name_returns_same_sink() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path(), 4);
        let a = cache.get_sink("orders").unwrap();
        let b = cache.get_sink("orders").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn full_cache_evicts_before_insert() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path(), 4);
        for i in 0..4 {
            cache.get_sink(&format!("sink-{}", i)).unwrap();
        }
        assert_eq!(cache.len(), 4);

        cache.get_sink("sink-new").unwrap();
        assert!(cache.len() <= 4);
        assert!(cache.contains("sink-new"));
    }

    #[test]
    fn sink_writes_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path(), 4);
        let sink = cache.get_sink("audit").unwrap();
        sink.write(Level::INFO, "user 7 logged in");
        drop(sink);
        cache.clear();

        let text = std::fs::read_to_string(dir.path().join("audit.log")).unwrap();
        assert!(text.contains("user 7 logged in"));
        assert!(text.contains("\"level\":\"INFO\""));
    }

    #[test]
    fn evicted_sink_refuses_writes() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path(), 2);
        let first = cache.get_sink("first").unwrap();
        let second = cache.get_sink("second").unwrap();
        cache.get_sink("third").unwrap();

        let evicted = if first.is_closed() { first } else { second };
        assert!(evicted.is_closed());
        assert!(!cache.contains(evicted.name()));
        assert!(!evicted.write(Level::INFO, "lost"));
        assert!(cache.get_sink("third").unwrap().write(Level::INFO, "kept"));
    }

    /// Descriptors of this process that point into `dir`.
    #[cfg(target_os = "linux")]
    fn open_files_in(dir: &std::path::Path) -> usize {
        std::fs::read_dir("/proc/self/fd")
            .unwrap()
            .filter_map(|e| std::fs::read_link(e.ok()?.path()).ok())
            .filter(|target| target.starts_with(dir))
            .count()
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn eviction_closes_files_while_handles_are_held() {
        let dir = tempfile::tempdir().unwrap();
        let dir_path = dir.path().canonicalize().unwrap();
        let cache = cache(&dir_path, 4);

        let held: Vec<Arc<LogSink>> = (0..40)
            .map(|i| cache.get_sink(&format!("sink-{}", i)).unwrap())
            .collect();
        assert!(cache.len() <= 4);
        assert_eq!(held.iter().filter(|s| !s.is_closed()).count(), cache.len());

        // Worker threads release their files just after the guard returns.
        let mut open = open_files_in(&dir_path);
        for _ in 0..100 {
            if open <= 4 {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
            open = open_files_in(&dir_path);
        }
        assert!(open <= 4, "{} files still open", open);
    }

    #[test]
    fn names_are_flattened_to_file_stems() {
        assert_eq!(file_stem("a/b"), "a_b");
        assert_eq!(file_stem(""), "default");
        assert_eq!(file_stem(".."), "default");
    }
}
