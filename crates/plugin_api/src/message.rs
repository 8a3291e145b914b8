use std::collections::BTreeMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What a plugin sends with `handshake`: who it is and where its own RPC
/// service listens.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub struct Fingerprint {
    pub name: String,
    pub port: u16,
}

/// Static capability metadata, returned by `describe`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
pub struct Description {
    pub description: String,
    pub author: String,
    pub version: String,
    #[serde(default)]
    pub arguments: Vec<Argument>,
}

/// A query argument a plugin understands on `run`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
pub struct Argument {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub default: String,
    #[serde(default)]
    pub optional: bool,
}

impl Argument {
    pub fn optional(name: impl Into<String>, description: impl Into<String>, default: impl Into<String>) -> Self {
        Self { name: name.into(), description: description.into(), default: default.into(), optional: true }
    }
}

/// Query parameters, multi-valued like an URL query string.
pub type Query = BTreeMap<String, Vec<String>>;

/// Payload of `run`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
pub struct InvocationRequest {
    #[serde(default)]
    pub query: Query,
    #[serde(default)]
    pub body: String,
}

impl InvocationRequest {
    pub fn new(body: impl Into<String>) -> Self {
        Self { query: Query::new(), body: body.into() }
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.entry(key.into()).or_default().push(value.into());
        self
    }

    /// First value for `key`, if any.
    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query.get(key).and_then(|v| v.first()).map(String::as_str)
    }
}

/// One result record, shaped like a time-series write.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
pub struct Series {
    pub name: String,
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub points: Vec<Vec<Value>>,
}

/// Result of `run`.
///
/// Errors can't cross the RPC boundary as typed values, so a failing plugin
/// reports a non-empty `error` string. Callers must check it in addition to
/// the transport result.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
pub struct InvocationResponse {
    #[serde(default)]
    pub series: Vec<Series>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl InvocationResponse {
    pub fn ok(series: Vec<Series>) -> Self {
        Self { series, error: None }
    }

    pub fn fail(error: impl Into<String>) -> Self {
        Self { series: vec![], error: Some(error.into()) }
    }

    /// True when the plugin embedded a non-empty error string.
    pub fn is_error(&self) -> bool {
        self.error.as_deref().is_some_and(|e| !e.is_empty())
    }

    pub fn into_result(self) -> Result<Vec<Series>, String> {
        match self.error {
            Some(err) if !err.is_empty() => Err(err),
            _ => Ok(self.series),
        }
    }
}
