//! Reply structures returned by handlers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::host::ServiceIdentity;

/// Structured handler reply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub code: i32,
    pub msg: String,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record: Option<Record>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<ReplyService>,
}

impl Reply {
    /// Error reply with an empty payload.
    pub fn error(code: i32, msg: impl Into<String>) -> Self {
        Self {
            code,
            msg: msg.into(),
            data: serde_json::Value::Object(Default::default()),
            ..Self::default()
        }
    }
}

/// Audit record attached to a reply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Record {
    #[serde(rename = "type")]
    pub kind: String,
    pub table_name: String,
    pub data_id: serde_json::Value,
    #[serde(rename = "intro")]
    pub note: String,
}

/// Service identity block, present only in debug replies.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplyService {
    pub name: String,
    pub hostname: String,
    pub ip: String,
    pub addr: String,
    /// Elapsed time between dispatch entry and reply finalization.
    pub runtime: String,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl ReplyService {
    pub fn opened(identity: &ServiceIdentity, start: DateTime<Utc>) -> Self {
        Self {
            name: identity.name.clone(),
            hostname: identity.hostname.clone(),
            ip: identity.system_ip.clone(),
            addr: identity.addr.clone(),
            runtime: String::new(),
            start: Some(start),
            end: None,
        }
    }
}

/// What a dispatched call hands back to its transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Payload {
    /// Structured reply, native calls.
    Reply(Reply),
    /// Plain text written by the handler.
    Text(String),
    /// Serialized reply for gateway calls.
    Bytes(Vec<u8>),
}

impl Payload {
    pub fn as_reply(&self) -> Option<&Reply> {
        match self {
            Payload::Reply(r) => Some(r),
            _ => None,
        }
    }

    /// Decode the payload as a structured reply, parsing gateway bytes.
    pub fn into_reply(self) -> Option<Reply> {
        match self {
            Payload::Reply(r) => Some(r),
            Payload::Bytes(b) => serde_json::from_slice(&b).ok(),
            Payload::Text(_) => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Text(t) => Some(t),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_uses_wire_field_names() {
        let record = Record {
            kind: "update".into(),
            table_name: "users".into(),
            data_id: serde_json::json!(5),
            note: "renamed".into(),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["type"], "update");
        assert_eq!(json["intro"], "renamed");
    }

    #[test]
    fn absent_blocks_are_omitted() {
        let json = serde_json::to_string(&Reply::error(500, "x")).unwrap();
        assert!(!json.contains("record"));
        assert!(!json.contains("service"));
    }

    #[test]
    fn gateway_bytes_decode_back_into_replies() {
        let reply = Reply::error(401, "please login first");
        let bytes = serde_json::to_vec(&reply).unwrap();
        assert_eq!(Payload::Bytes(bytes).into_reply(), Some(reply));
        assert_eq!(Payload::Text("ok".into()).into_reply(), None);
    }
}
