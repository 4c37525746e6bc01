//! Semi-structured argument values and the typed accessor over them.
//!
//! Lenient getters (`get_*`) never fail: absent keys yield the caller's
//! default and unconvertible values yield the zero value. Strict getters
//! (`try_*`) report exactly why a value could not be read.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::RpcError;

/// A dynamically shaped argument or payload value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Scalar-to-string conversion; `None` for lists and maps.
    pub fn to_scalar_string(&self) -> Option<String> {
        match self {
            Value::Null => Some(String::new()),
            Value::Bool(b) => Some(b.to_string()),
            Value::Int(i) => Some(i.to_string()),
            Value::Float(f) => Some(f.to_string()),
            Value::Str(s) => Some(s.clone()),
            Value::List(_) | Value::Map(_) => None,
        }
    }

    /// Scalar-to-integer conversion; numeric strings are parsed.
    pub fn to_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Float(f) if f.is_finite() => Some(f.trunc() as i64),
            Value::Bool(b) => Some(i64::from(*b)),
            Value::Str(s) => s.trim().parse::<i64>().ok(),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_scalar_string() {
            Some(s) => f.write_str(&s),
            None => {
                let json = serde_json::to_string(self).map_err(|_| fmt::Error)?;
                f.write_str(&json)
            }
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(m: BTreeMap<String, Value>) -> Self {
        Value::Map(m)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::List(v)
    }
}

/// Reasons a strict argument read can fail.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ArgError {
    #[error("missing argument: {0}")]
    Missing(String),

    #[error("argument {key} is not a valid {expected}")]
    WrongType { key: String, expected: &'static str },
}

impl From<ArgError> for RpcError {
    fn from(e: ArgError) -> Self {
        match e {
            ArgError::Missing(key) => RpcError::MissingParam(key),
            ArgError::WrongType { key, .. } => RpcError::MissingParam(key),
        }
    }
}

/// String-keyed call arguments.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Args(HashMap<String, Value>);

impl Args {
    pub fn new() -> Self {
        Self(HashMap::new())
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Value as a string, or `default` when absent.
    pub fn get_string(&self, key: &str, default: &str) -> String {
        match self.0.get(key) {
            Some(v) => v.to_string(),
            None => default.to_string(),
        }
    }

    /// Value as an `i32`, `default` when absent, 0 when unconvertible.
    pub fn get_int(&self, key: &str, default: i32) -> i32 {
        match self.0.get(key) {
            Some(v) => v
                .to_i64()
                .and_then(|i| i32::try_from(i).ok())
                .unwrap_or(0),
            None => default,
        }
    }

    /// Value as an `i64`, `default` when absent, 0 when unconvertible.
    pub fn get_i64(&self, key: &str, default: i64) -> i64 {
        match self.0.get(key) {
            Some(v) => v.to_i64().unwrap_or(0),
            None => default,
        }
    }

    /// Value as a bool; "1", "true" and non-zero numbers are true.
    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.0.get(key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::Str(s)) => matches!(s.trim(), "1" | "true" | "TRUE" | "True"),
            Some(v) => v.to_i64().map(|i| i != 0).unwrap_or(false),
            None => default,
        }
    }

    pub fn try_string(&self, key: &str) -> Result<String, ArgError> {
        let value = self.0.get(key).ok_or_else(|| ArgError::Missing(key.to_string()))?;
        value.to_scalar_string().ok_or(ArgError::WrongType {
            key: key.to_string(),
            expected: "string",
        })
    }

    pub fn try_i64(&self, key: &str) -> Result<i64, ArgError> {
        let value = self.0.get(key).ok_or_else(|| ArgError::Missing(key.to_string()))?;
        value.to_i64().ok_or(ArgError::WrongType {
            key: key.to_string(),
            expected: "integer",
        })
    }

    pub fn try_map(&self, key: &str) -> Result<&BTreeMap<String, Value>, ArgError> {
        let value = self.0.get(key).ok_or_else(|| ArgError::Missing(key.to_string()))?;
        value.as_map().ok_or(ArgError::WrongType {
            key: key.to_string(),
            expected: "map",
        })
    }
}

impl From<HashMap<String, Value>> for Args {
    fn from(map: HashMap<String, Value>) -> Self {
        Self(map)
    }
}

impl FromIterator<(String, Value)> for Args {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}
