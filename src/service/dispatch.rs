//! Per-call orchestration: resolve, gate, invoke, recover.
//!
//! A fault raised anywhere between handler construction and method return is
//! caught at this boundary, reported once to the notifier and turned into
//! [`RpcError::DispatchPanic`]. It never unwinds into the serving task.

use std::any::Any;
use std::backtrace::Backtrace;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use tracing::Instrument;
use uuid::Uuid;

use super::call::{Call, CallEnv, CallOrigin};
use super::registry::{HandlerRegistry, HandlerVariant};
use super::reply::Payload;
use super::session::{SessionConfig, SessionStore};
use super::signature::SignConfig;
use super::version;
use crate::error::RpcError;
use crate::host::ServiceIdentity;
use crate::notify::Notifier;
use crate::telemetry::metrics;
use crate::value::Args;

/// Argument conventions applied to every inbound call.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Argument naming the requested API version.
    pub version_key: String,
    /// Version used when the caller sends none.
    pub default_version: String,
    pub debug_key: String,
    /// Debug mode is on when the debug argument equals this. Empty disables it.
    pub debug_value: String,
    pub sign: SignConfig,
    pub session: SessionConfig,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            version_key: "version".to_string(),
            default_version: String::new(),
            debug_key: "debug".to_string(),
            debug_value: String::new(),
            sign: SignConfig::default(),
            session: SessionConfig::default(),
        }
    }
}

impl DispatchConfig {
    /// The version argument, or the default version when absent or empty.
    pub fn requested_version(&self, args: &Args) -> String {
        if !self.version_key.is_empty() {
            let v = args.get_string(&self.version_key, "");
            if !v.is_empty() {
                return v;
            }
        }
        self.default_version.clone()
    }
}

pub struct Dispatcher {
    registry: Arc<HandlerRegistry>,
    env: CallEnv,
    notifier: Option<Arc<Notifier>>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<HandlerRegistry>,
        config: DispatchConfig,
        identity: Arc<ServiceIdentity>,
    ) -> Self {
        Self {
            registry,
            env: CallEnv {
                config: Arc::new(config),
                identity,
                sessions: None,
            },
            notifier: None,
        }
    }

    pub fn with_sessions(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.env.sessions = Some(store);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.env.config
    }

    /// Run the call addressed to `path`.
    pub async fn dispatch(
        &self,
        path: &str,
        args: Args,
        origin: CallOrigin,
    ) -> Result<Payload, RpcError> {
        let started = Instant::now();
        let result = self.dispatch_inner(path, args, origin).await;
        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) => e.kind(),
        };
        metrics::record_dispatch(outcome, started.elapsed());
        result
    }

    async fn dispatch_inner(
        &self,
        path: &str,
        args: Args,
        origin: CallOrigin,
    ) -> Result<Payload, RpcError> {
        let variants = self
            .registry
            .variants(path)
            .ok_or_else(|| RpcError::NotFound(path.to_string()))?;

        let requested = self.env.config.requested_version(&args);
        let variant = version::resolve(variants, &requested).ok_or_else(|| {
            tracing::debug!(path, version = %requested, "no variant matches version");
            RpcError::VersionMismatch {
                path: path.to_string(),
                version: requested.clone(),
            }
        })?;

        let call_id = Uuid::new_v4();
        let span = tracing::debug_span!(
            "dispatch",
            %call_id,
            path,
            version = %requested,
            service = %variant.service,
            method = %variant.method,
        );
        let outcome = AssertUnwindSafe(self.run(call_id, variant, requested, args, origin))
            .catch_unwind()
            .instrument(span)
            .await;

        match outcome {
            Ok(result) => result,
            Err(panic) => Err(self.recover(call_id, path, panic)),
        }
    }

    async fn run(
        &self,
        call_id: Uuid,
        variant: &HandlerVariant,
        version: String,
        args: Args,
        origin: CallOrigin,
    ) -> Result<Payload, RpcError> {
        let mut handler = variant.instantiate();
        let mut call = Call::new(variant.path.as_str(), version, args, origin, self.env.clone())
            .with_id(call_id);

        if variant.requires_signature && !call.sign_check() {
            return Err(RpcError::SignatureInvalid);
        }
        if variant.requires_login && !call.login_check(None).await? {
            return Err(RpcError::LoginRequired);
        }

        handler.invoke(&variant.method, &mut call).await?;
        Ok(call.into_payload())
    }

    fn recover(&self, call_id: Uuid, path: &str, panic: Box<dyn Any + Send>) -> RpcError {
        let message = panic_message(panic.as_ref());
        let stack = Backtrace::force_capture().to_string();
        tracing::error!(%call_id, path, panic = %message, "handler panicked");
        if let Some(notifier) = &self.notifier {
            notifier.error(format!("{} panic: {}", path, message), Some(&stack));
        }
        RpcError::DispatchPanic {
            path: path.to_string(),
            message,
        }
    }
}

/// Text of a caught panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_argument_overrides_default() {
        let config = DispatchConfig {
            default_version: "1.0".into(),
            ..DispatchConfig::default()
        };
        assert_eq!(config.requested_version(&Args::new()), "1.0");
        assert_eq!(
            config.requested_version(&Args::new().with("version", "2.1")),
            "2.1"
        );
        assert_eq!(config.requested_version(&Args::new().with("version", "")), "1.0");
    }

    #[test]
    fn panic_messages_are_extracted() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
        let payload: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }
}
