//! Operational notifications pushed to a webhook chat channel.
//!
//! Two channels exist: `Error` for faults (with an optional stack) and
//! `Graceful` for lifecycle events. Delivery is fire-and-forget on the
//! blocking pool; failures are logged locally and never surface to callers.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::Level;

use crate::host::{ServiceIdentity, PRODUCE_MODE};

const DEFAULT_URL_PREFIX: &str = "https://oapi.dingtalk.com/robot/send?access_token=";
const TIME_FORMAT: &str = "%Y/%m/%d %H:%M:%S%.3f";

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("webhook request failed: {0}")]
    Request(String),

    #[error("webhook rejected message: status {0}")]
    Status(u16),
}

/// Channel tokens and webhook endpoint.
#[derive(Debug, Clone)]
pub struct NotifyConfig {
    pub error_token: String,
    pub graceful_token: String,
    pub url_prefix: String,
    pub timeout: Duration,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            error_token: String::new(),
            graceful_token: String::new(),
            url_prefix: DEFAULT_URL_PREFIX.to_string(),
            timeout: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Error,
    Graceful,
}

/// A rendered message ready for delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct Notice {
    pub channel: Channel,
    pub content: String,
    pub at_all: bool,
}

impl Notice {
    /// Webhook request body.
    pub fn body(&self) -> serde_json::Value {
        serde_json::json!({
            "msgtype": "text",
            "text": { "content": self.content },
            "at": { "isAtAll": self.at_all },
        })
    }
}

/// Delivery backend. Called from a blocking context.
pub trait NotifySink: Send + Sync + 'static {
    fn deliver(&self, token: &str, notice: &Notice) -> Result<(), NotifyError>;
}

/// Posts notices to `url_prefix + token`.
pub struct WebhookSink {
    url_prefix: String,
    agent: ureq::Agent,
}

impl WebhookSink {
    pub fn new(url_prefix: impl Into<String>, timeout: Duration) -> Self {
        Self {
            url_prefix: url_prefix.into(),
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
        }
    }
}

impl NotifySink for WebhookSink {
    fn deliver(&self, token: &str, notice: &Notice) -> Result<(), NotifyError> {
        let url = format!("{}{}", self.url_prefix, token);
        match self
            .agent
            .post(&url)
            .set("Content-Type", "application/json;charset=utf-8")
            .send_string(&notice.body().to_string())
        {
            Ok(_) => Ok(()),
            Err(ureq::Error::Status(code, _)) => Err(NotifyError::Status(code)),
            Err(e) => Err(NotifyError::Request(e.to_string())),
        }
    }
}

/// Keeps delivered notices in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    delivered: Mutex<Vec<(String, Notice)>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delivered(&self) -> Vec<(String, Notice)> {
        self.delivered.lock().clone()
    }

    pub fn count(&self, channel: Channel) -> usize {
        self.delivered
            .lock()
            .iter()
            .filter(|(_, n)| n.channel == channel)
            .count()
    }
}

impl NotifySink for MemorySink {
    fn deliver(&self, token: &str, notice: &Notice) -> Result<(), NotifyError> {
        self.delivered.lock().push((token.to_string(), notice.clone()));
        Ok(())
    }
}

pub struct Notifier {
    config: NotifyConfig,
    identity: Arc<ServiceIdentity>,
    sink: Arc<dyn NotifySink>,
    pending: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

impl fmt::Debug for Notifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Notifier")
            .field("service", &self.identity.name)
            .field("pending", &self.pending())
            .finish()
    }
}

impl Notifier {
    /// Notifier delivering over the configured webhook.
    pub fn new(config: NotifyConfig, identity: Arc<ServiceIdentity>) -> Self {
        let sink = Arc::new(WebhookSink::new(config.url_prefix.clone(), config.timeout));
        Self::with_sink(config, identity, sink)
    }

    pub fn with_sink(
        config: NotifyConfig,
        identity: Arc<ServiceIdentity>,
        sink: Arc<dyn NotifySink>,
    ) -> Self {
        Self {
            config,
            identity,
            sink,
            pending: Arc::new(AtomicUsize::new(0)),
            idle: Arc::new(Notify::new()),
        }
    }

    /// Render the fixed text template.
    pub fn render(&self, msg: &str, stack: Option<&str>) -> String {
        let id = &self.identity;
        let mut lines = vec![
            format!("{}\n---------------------------", msg),
            format!("Env: {}", id.mode),
            format!("Name: {}", id.name),
            format!("Addr: {}", id.addr),
            format!("HostName: {}", id.hostname),
            format!("Time: {}", chrono::Local::now().format(TIME_FORMAT)),
            format!("SystemIP: {}", id.system_ip),
            format!("PublicIP: {}", id.public_ip),
        ];
        if let Some(stack) = stack.filter(|s| !s.is_empty()) {
            lines.push(format!("\nStack:\n{}", stack));
        }
        let mut content = lines.join("\n");
        content.push('\n');
        content
    }

    /// Fault notification, mentioning everyone in production.
    pub fn error(&self, msg: impl fmt::Display, stack: Option<&str>) {
        self.send(Channel::Error, &msg.to_string(), stack, None);
    }

    /// Lifecycle notification.
    pub fn graceful(&self, msg: impl fmt::Display) {
        self.send(Channel::Graceful, &msg.to_string(), None, None);
    }

    /// Queue a notice and optionally echo its title to the local log.
    pub fn send(&self, channel: Channel, msg: &str, stack: Option<&str>, echo: Option<Level>) {
        if let Some(level) = echo {
            echo_locally(level, msg);
        }

        let token = match channel {
            Channel::Error => &self.config.error_token,
            Channel::Graceful => &self.config.graceful_token,
        };
        if token.is_empty() || msg.is_empty() {
            return;
        }

        let notice = Notice {
            channel,
            content: self.render(msg, stack),
            at_all: self.identity.mode == PRODUCE_MODE,
        };
        let token = token.clone();
        let sink = Arc::clone(&self.sink);
        let guard = PendingGuard::new(Arc::clone(&self.pending), Arc::clone(&self.idle));

        let job = move || {
            let _guard = guard;
            if let Err(e) = sink.deliver(&token, &notice) {
                tracing::warn!(error = %e, channel = ?notice.channel, "notification delivery failed");
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(job);
            }
            Err(_) => {
                std::thread::spawn(job);
            }
        }
    }

    /// Deliveries queued but not finished.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Wait until queued deliveries finish. Returns false on timeout.
    pub async fn flush(&self, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.idle.notified();
                if self.pending() == 0 {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }
}

fn echo_locally(level: Level, msg: &str) {
    if level == Level::ERROR {
        tracing::error!("{}", msg);
    } else if level == Level::WARN {
        tracing::warn!("{}", msg);
    } else if level == Level::INFO {
        tracing::info!("{}", msg);
    } else {
        tracing::debug!("{}", msg);
    }
}

struct PendingGuard {
    pending: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

impl PendingGuard {
    fn new(pending: Arc<AtomicUsize>, idle: Arc<Notify>) -> Self {
        pending.fetch_add(1, Ordering::SeqCst);
        Self { pending, idle }
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(mode: &str) -> Arc<ServiceIdentity> {
        Arc::new(ServiceIdentity {
            mode: mode.into(),
            name: "user".into(),
            hostname: "web-1".into(),
            system_ip: "10.0.0.1".into(),
            public_ip: "1.2.3.4".into(),
            addr: "10.0.0.1:9000".into(),
        })
    }

    fn config() -> NotifyConfig {
        NotifyConfig {
            error_token: "err-token".into(),
            graceful_token: "ok-token".into(),
            ..NotifyConfig::default()
        }
    }

    #[test]
    fn template_lists_identity_and_stack() {
        let notifier = Notifier::with_sink(config(), identity("production"), Arc::new(MemorySink::new()));
        let text = notifier.render("boom", Some("frame 0"));
        assert!(text.starts_with("boom\n---------------------------\nEnv: production\nName: user"));
        assert!(text.contains("HostName: web-1"));
        assert!(text.contains("PublicIP: 1.2.3.4"));
        assert!(text.ends_with("\nStack:\nframe 0\n"));
    }

    #[test]
    fn body_matches_webhook_shape() {
        let notice = Notice {
            channel: Channel::Error,
            content: "x".into(),
            at_all: true,
        };
        let body = notice.body();
        assert_eq!(body["msgtype"], "text");
        assert_eq!(body["text"]["content"], "x");
        assert_eq!(body["at"]["isAtAll"], true);
    }

    #[tokio::test]
    async fn channels_use_their_own_tokens() {
        let sink = Arc::new(MemorySink::new());
        let notifier = Notifier::with_sink(config(), identity("production"), sink.clone());
        notifier.error("boom", None);
        notifier.graceful("ready");
        assert!(notifier.flush(Duration::from_secs(5)).await);

        let delivered = sink.delivered();
        assert_eq!(delivered.len(), 2);
        assert!(delivered.iter().any(|(t, n)| t == "err-token" && n.channel == Channel::Error));
        assert!(delivered.iter().any(|(t, n)| t == "ok-token" && n.at_all));
    }

    #[tokio::test]
    async fn mention_all_only_in_production() {
        let sink = Arc::new(MemorySink::new());
        let notifier = Notifier::with_sink(config(), identity("development"), sink.clone());
        notifier.error("boom", None);
        assert!(notifier.flush(Duration::from_secs(5)).await);
        assert!(!sink.delivered()[0].1.at_all);
    }

    #[tokio::test]
    async fn empty_token_skips_delivery() {
        let sink = Arc::new(MemorySink::new());
        let notifier = Notifier::with_sink(NotifyConfig::default(), identity("production"), sink.clone());
        notifier.error("boom", None);
        assert_eq!(notifier.pending(), 0);
        assert!(sink.delivered().is_empty());
    }
}
