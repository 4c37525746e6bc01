//! Session lookup for login-gated handlers.
//!
//! Session payloads are JSON objects stored under `key_prefix + token`.

use std::collections::BTreeMap;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;

use crate::value::Value;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session store unavailable: {0}")]
    Unavailable(String),
}

/// Token argument name and store key prefix.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub token_key: String,
    pub key_prefix: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            token_key: "token".to_string(),
            key_prefix: String::new(),
        }
    }
}

impl SessionConfig {
    pub fn store_key(&self, token: &str) -> String {
        format!("{}{}", self.key_prefix, token)
    }
}

/// External key/value store holding serialized sessions.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Raw session payload for `key`, `None` when absent.
    async fn get(&self, key: &str) -> Result<Option<String>, SessionError>;
}

/// Process-local session store.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    entries: DashMap<String, String>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: impl Into<String>, payload: impl Into<String>) {
        self.entries.insert(key.into(), payload.into());
    }

    pub fn remove(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn get(&self, key: &str) -> Result<Option<String>, SessionError> {
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }
}

/// Decode a session payload; anything but a JSON object is treated as no session.
pub fn decode_user_data(raw: &str) -> Option<BTreeMap<String, Value>> {
    if raw.is_empty() {
        return None;
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Map(map)) => Some(map),
        Ok(_) => None,
        Err(e) => {
            tracing::debug!(error = %e, "session payload is not valid json");
            None
        }
    }
}

/// `userinfo.userid` from decoded user data, 0 when absent.
pub fn user_id(data: &BTreeMap<String, Value>) -> i64 {
    data.get("userinfo")
        .and_then(Value::as_map)
        .and_then(|info| info.get("userid"))
        .and_then(Value::to_i64)
        .unwrap_or(0)
}
