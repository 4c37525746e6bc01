//! Per-call request context handed to handler methods.
//!
//! A `Call` is created at dispatch entry, owned by that dispatch only, and
//! consumed into a [`Payload`] at exit.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

use super::dispatch::DispatchConfig;
use super::reply::{Payload, Record, Reply, ReplyService};
use super::session::{self, SessionStore};
use super::signature;
use crate::error::RpcError;
use crate::host::ServiceIdentity;
use crate::value::{Args, Value};

/// How the call reached the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallOrigin {
    /// Native RPC transport: structured replies are returned as-is.
    #[default]
    Native,
    /// HTTP-style gateway: structured replies are serialized to bytes.
    Gateway,
}

/// Shared, read-only inputs every call is built from.
#[derive(Clone)]
pub struct CallEnv {
    pub config: Arc<DispatchConfig>,
    pub identity: Arc<ServiceIdentity>,
    pub sessions: Option<Arc<dyn SessionStore>>,
}

enum RawBody {
    Text(String),
    Bytes(Vec<u8>),
}

pub struct Call {
    id: Uuid,
    path: String,
    version: String,
    args: Args,
    origin: CallOrigin,
    reply: Reply,
    raw: Option<RawBody>,
    debug_started: Option<Instant>,
    env: CallEnv,
}

impl Call {
    /// Build the context, opening a debug window when the caller sent the
    /// configured debug value.
    pub fn new(
        path: impl Into<String>,
        version: impl Into<String>,
        args: Args,
        origin: CallOrigin,
        env: CallEnv,
    ) -> Self {
        let debug_value = &env.config.debug_value;
        let debug = !debug_value.is_empty()
            && args.get_string(&env.config.debug_key, "") == *debug_value;

        let mut reply = Reply::default();
        let debug_started = if debug {
            reply.service = Some(ReplyService::opened(&env.identity, Utc::now()));
            Some(Instant::now())
        } else {
            None
        };

        Self {
            id: Uuid::new_v4(),
            path: path.into(),
            version: version.into(),
            args,
            origin,
            reply,
            raw: None,
            debug_started,
            env,
        }
    }

    /// Identifier recorded on the dispatch span.
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub(crate) fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Version used to resolve the handler variant.
    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn args(&self) -> &Args {
        &self.args
    }

    pub fn origin(&self) -> CallOrigin {
        self.origin
    }

    pub fn is_debug(&self) -> bool {
        self.debug_started.is_some()
    }

    pub fn identity(&self) -> &ServiceIdentity {
        &self.env.identity
    }

    pub fn get_string(&self, key: &str, default: &str) -> String {
        self.args.get_string(key, default)
    }

    pub fn get_int(&self, key: &str, default: i32) -> i32 {
        self.args.get_int(key, default)
    }

    pub fn get_i64(&self, key: &str, default: i64) -> i64 {
        self.args.get_i64(key, default)
    }

    /// Current structured reply, if the handler has not written raw output.
    pub fn reply(&self) -> Option<&Reply> {
        match self.raw {
            None => Some(&self.reply),
            Some(_) => None,
        }
    }

    fn structured(&mut self) -> &mut Reply {
        self.raw = None;
        &mut self.reply
    }

    /// Set code, message and payload. A `null` payload becomes `{}`.
    pub fn json<T: Serialize>(&mut self, code: i32, msg: &str, data: T) {
        let (code, msg, data) = match serde_json::to_value(data) {
            Ok(serde_json::Value::Null) => (code, msg.to_string(), empty_object()),
            Ok(v) => (code, msg.to_string(), v),
            Err(e) => (500, e.to_string(), empty_object()),
        };
        let reply = self.structured();
        reply.code = code;
        reply.msg = msg;
        reply.data = data;
        self.stamp_debug_end();
    }

    /// `json(200, "", data)`.
    pub fn ok<T: Serialize>(&mut self, data: T) {
        self.json(200, "", data);
    }

    /// Replace only the payload.
    pub fn finish<T: Serialize>(&mut self, data: T) {
        match serde_json::to_value(data) {
            Ok(v) => self.structured().data = v,
            Err(e) => {
                let reply = self.structured();
                reply.code = 500;
                reply.msg = e.to_string();
            }
        }
        self.stamp_debug_end();
    }

    pub fn record(&mut self, record: Record) {
        self.structured().record = Some(record);
    }

    /// Reply with plain text instead of a structured reply.
    pub fn write_string(&mut self, text: impl Into<String>) {
        self.raw = Some(RawBody::Text(text.into()));
    }

    pub fn write_bytes(&mut self, bytes: Vec<u8>) {
        self.raw = Some(RawBody::Bytes(bytes));
    }

    fn stamp_debug_end(&mut self) {
        let Some(started) = self.debug_started else {
            return;
        };
        if let Some(service) = self.reply.service.as_mut() {
            service.end = Some(Utc::now());
            service.runtime = format!("{:?}", started.elapsed());
        }
    }

    /// Check the signature arguments against the shared secret.
    pub fn sign_check(&self) -> bool {
        match signature::verify(&self.args, &self.env.config.sign, Utc::now().timestamp()) {
            Ok(()) => true,
            Err(reason) => {
                tracing::debug!(path = %self.path, %reason, "signature rejected");
                false
            }
        }
    }

    /// Session user data for `token`, or for the token argument when `None`.
    pub async fn logged_user_data(
        &self,
        token: Option<&str>,
    ) -> Result<Option<BTreeMap<String, Value>>, RpcError> {
        let token = match token {
            Some(t) if !t.is_empty() => t.to_string(),
            _ => self.args.get_string(&self.env.config.session.token_key, ""),
        };
        if token.is_empty() {
            return Ok(None);
        }
        let Some(store) = self.env.sessions.as_ref() else {
            tracing::debug!(path = %self.path, "no session store configured");
            return Ok(None);
        };
        let raw = store.get(&self.env.config.session.store_key(&token)).await?;
        Ok(raw.and_then(|r| session::decode_user_data(&r)))
    }

    pub async fn login_check(&self, token: Option<&str>) -> Result<bool, RpcError> {
        Ok(self.logged_user_data(token).await?.is_some())
    }

    /// `userinfo.userid` of the logged-in user, 0 when not logged in.
    pub async fn logged_user_id(&self) -> Result<i64, RpcError> {
        Ok(self
            .logged_user_data(None)
            .await?
            .map(|data| session::user_id(&data))
            .unwrap_or(0))
    }

    /// Finalize into what the transport sends back.
    pub fn into_payload(mut self) -> Payload {
        if let Some(raw) = self.raw.take() {
            return match raw {
                RawBody::Text(text) => Payload::Text(text),
                RawBody::Bytes(bytes) => Payload::Bytes(bytes),
            };
        }
        if self.reply.service.as_ref().is_some_and(|s| s.end.is_none()) {
            self.stamp_debug_end();
        }
        match self.origin {
            CallOrigin::Native => Payload::Reply(self.reply),
            CallOrigin::Gateway => match serde_json::to_vec(&self.reply) {
                Ok(bytes) => Payload::Bytes(bytes),
                Err(e) => {
                    tracing::warn!(path = %self.path, error = %e, "reply serialization failed");
                    Payload::Bytes(Vec::new())
                }
            },
        }
    }
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(Default::default())
}
