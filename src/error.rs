//! Error taxonomy for dispatch and outbound calls.
//!
//! Caller-facing errors (version, signature, login) are expected outcomes and
//! never alerted. Only faults recovered at the dispatch boundary are alertable.

use thiserror::Error;

use crate::client::discovery::DiscoveryError;
use crate::client::transport::TransportError;
use crate::config::ConfigError;
use crate::service::registry::RegistryError;
use crate::service::session::SessionError;

/// Errors produced by the dispatcher, the client pool and startup.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("invalid config: {0}")]
    ConfigInvalid(String),

    #[error("version compare error")]
    VersionMismatch { path: String, version: String },

    #[error("signature error")]
    SignatureInvalid,

    #[error("please login first")]
    LoginRequired,

    #[error("dispatch panic on {path}: {message}")]
    DispatchPanic { path: String, message: String },

    #[error("pool construction failed for {service}: {reason}")]
    PoolConstructionFailed { service: String, reason: String },

    #[error("call {service}.{method} timed out after {after_ms}ms")]
    Timeout {
        service: String,
        method: String,
        after_ms: u64,
    },

    #[error("no handler registered for path: {0}")]
    NotFound(String),

    #[error("missing required parameters: {0}")]
    MissingParam(String),

    #[error("the operation failed. Please try again later")]
    OperationFailed,

    #[error("service discovery not meeting requirements")]
    DiscoveryUnavailable,

    #[error("no available member for service: {0}")]
    NoAvailableMember(String),

    #[error("circuit open for {0}")]
    CircuitOpen(String),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("session store error: {0}")]
    Session(#[from] SessionError),

    #[error("client for {0} is closed")]
    ClientClosed(String),

    #[error("{message}")]
    Handler { code: i32, message: String },
}

impl RpcError {
    /// Application-level error raised by a handler method.
    pub fn handler(code: i32, message: impl Into<String>) -> Self {
        Self::Handler {
            code,
            message: message.into(),
        }
    }

    /// Returns true if the error must be forwarded to the notifier.
    pub fn is_alertable(&self) -> bool {
        matches!(self, Self::DispatchPanic { .. })
    }

    /// Returns true for authorization and version outcomes returned to callers.
    pub fn is_caller_facing(&self) -> bool {
        matches!(
            self,
            Self::VersionMismatch { .. }
                | Self::SignatureInvalid
                | Self::LoginRequired
                | Self::MissingParam(_)
                | Self::NotFound(_)
        )
    }

    /// Returns true if a caller may retry the same call.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. }
                | Self::Transport(_)
                | Self::CircuitOpen(_)
                | Self::NoAvailableMember(_)
                | Self::ClientClosed(_)
        )
    }

    /// Status code sent to remote callers.
    pub fn status_code(&self) -> i32 {
        match self {
            Self::MissingParam(_) => 400,
            Self::LoginRequired => 401,
            Self::SignatureInvalid => 403,
            Self::NotFound(_) => 404,
            Self::VersionMismatch { .. } => 412,
            Self::CircuitOpen(_) | Self::NoAvailableMember(_) | Self::DiscoveryUnavailable => 503,
            Self::Timeout { .. } => 504,
            Self::Handler { code, .. } => *code,
            _ => 500,
        }
    }

    /// Rebuild a typed error from a remote error frame.
    pub fn from_remote(code: i32, kind: &str, message: String) -> Self {
        match kind {
            "signature_invalid" => Self::SignatureInvalid,
            "login_required" => Self::LoginRequired,
            "operation_failed" => Self::OperationFailed,
            "discovery_unavailable" => Self::DiscoveryUnavailable,
            _ => Self::Handler { code, message },
        }
    }

    /// Short label used for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConfigInvalid(_) => "config_invalid",
            Self::VersionMismatch { .. } => "version_mismatch",
            Self::SignatureInvalid => "signature_invalid",
            Self::LoginRequired => "login_required",
            Self::DispatchPanic { .. } => "dispatch_panic",
            Self::PoolConstructionFailed { .. } => "pool_construction_failed",
            Self::Timeout { .. } => "timeout",
            Self::NotFound(_) => "not_found",
            Self::MissingParam(_) => "missing_param",
            Self::OperationFailed => "operation_failed",
            Self::DiscoveryUnavailable => "discovery_unavailable",
            Self::NoAvailableMember(_) => "no_available_member",
            Self::CircuitOpen(_) => "circuit_open",
            Self::Transport(_) => "transport",
            Self::Session(_) => "session",
            Self::ClientClosed(_) => "client_closed",
            Self::Handler { .. } => "handler",
        }
    }
}

impl From<ConfigError> for RpcError {
    fn from(e: ConfigError) -> Self {
        Self::ConfigInvalid(e.to_string())
    }
}

impl From<RegistryError> for RpcError {
    fn from(e: RegistryError) -> Self {
        Self::ConfigInvalid(e.to_string())
    }
}

impl From<DiscoveryError> for RpcError {
    fn from(e: DiscoveryError) -> Self {
        match e {
            DiscoveryError::NotConfigured => Self::DiscoveryUnavailable,
            other => Self::Transport(TransportError::Io(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caller_facing_errors_are_not_alertable() {
        let errors = [
            RpcError::SignatureInvalid,
            RpcError::LoginRequired,
            RpcError::VersionMismatch {
                path: "user/info".into(),
                version: "1.0".into(),
            },
        ];
        for e in errors {
            assert!(e.is_caller_facing());
            assert!(!e.is_alertable());
        }
    }

    #[test]
    fn panic_is_alertable() {
        let e = RpcError::DispatchPanic {
            path: "p".into(),
            message: "boom".into(),
        };
        assert!(e.is_alertable());
        assert_eq!(e.kind(), "dispatch_panic");
    }

    #[test]
    fn messages_match_wire_texts() {
        assert_eq!(RpcError::SignatureInvalid.to_string(), "signature error");
        assert_eq!(RpcError::LoginRequired.to_string(), "please login first");
        assert_eq!(
            RpcError::DiscoveryUnavailable.to_string(),
            "service discovery not meeting requirements"
        );
    }

    #[test]
    fn remote_kinds_map_back_to_typed_errors() {
        assert!(matches!(
            RpcError::from_remote(403, "signature_invalid", "signature error".into()),
            RpcError::SignatureInvalid
        ));
        match RpcError::from_remote(412, "version_mismatch", "version compare error".into()) {
            RpcError::Handler { code, message } => {
                assert_eq!(code, 412);
                assert_eq!(message, "version compare error");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn timeout_is_retryable() {
        let e = RpcError::Timeout {
            service: "user".into(),
            method: "info".into(),
            after_ms: 15_000,
        };
        assert!(e.is_retryable());
        assert!(!RpcError::SignatureInvalid.is_retryable());
    }
}
