use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::{AsRefStr, Display, EnumString};
use thiserror::Error;


/// JSON‑RPC 2.0 core types spoken between the orchestrator and its plugins.
///
/// Every message travels as a single line of JSON over a plain TCP stream, in
/// both directions: plugins call the orchestrator (`handshake`, `ping`) and the
/// orchestrator calls plugins (`describe`, `run`, `ping`).
///
/// ```ignore
/// use serde_json::json;
/// use plugin_api::jsonrpc::{Id, Method, Request};
///
/// let req = Request::call(Id::Number(1), Method::Ping, None);
/// let s = serde_json::to_string(&req).unwrap();
/// ```
pub const JSONRPC_VERSION: &str = "2.0";

pub const PARSE_ERROR: i64 = -32700;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const APPLICATION_ERROR: i64 = -32000;

/// `id` MAY be a string, number or null. We support all forms.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Id {
    Number(i64),
    String(String),
    Null,
}

impl Id {
    /// Key used to match responses to in-flight calls.
    pub fn key(&self) -> String {
        match self {
            Id::Number(n) => format!("n:{n}"),
            Id::String(s) => format!("s:{s}"),
            Id::Null => "null".to_string(),
        }
    }
}

/// JSON‑RPC 2.0 Request object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// Omitted for *notifications*.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Id>,
}

fn default_version() -> String {
    JSONRPC_VERSION.to_owned()
}

/// JSON‑RPC 2.0 Error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Error {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// JSON‑RPC 2.0 Response object.
/// Exactly one of `result` or `error` **must** be present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Error>,
    pub id: Id,
}

/// Lets a reader decode a line without inspecting its shape first.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Request(Request),
    Response(Response),
}

// -----------------------------------------------------------------------------
// Helper constructors
// -----------------------------------------------------------------------------
impl Request {
    /// Create a *call* expecting a response.
    pub fn call(id: Id, method: Method, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            method: method.to_string(),
            params,
            id: Some(id),
        }
    }
}

impl Response {
    pub fn success(id: Id, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn fail(id: Id, code: i64, message: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            result: None,
            error: Some(Error {
                code,
                message: message.into(),
                data,
            }),
            id,
        }
    }
}

// -----------------------------------------------------------------------------
// Methods
// -----------------------------------------------------------------------------

/// Every method either side exposes.
///
/// The orchestrator answers `handshake` and `ping`; plugins answer `describe`,
/// `run` and `ping`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, AsRefStr, Display, Serialize, Deserialize)]
#[strum(serialize_all = "camelCase")]
#[serde(rename_all = "camelCase")]
pub enum Method {
    Handshake,
    Ping,
    Describe,
    Run,
}

// -----------------------------------------------------------------------------
// Transport errors
// -----------------------------------------------------------------------------

/// Failures of the RPC channel itself. Business errors of a plugin never show
/// up here, they travel inside `InvocationResponse::error`.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RpcError {
    #[error("could not connect to {addr}: {message}")]
    Connect { addr: String, message: String },

    #[error("connection closed")]
    ConnectionClosed,

    /// The remote side answered with a JSON-RPC error object; `message` is
    /// passed through verbatim.
    #[error("{message}")]
    Remote { code: i64, message: String },

    #[error("JSON error: {0}")]
    Json(String),
}

impl From<serde_json::Error> for RpcError {
    fn from(e: serde_json::Error) -> Self {
        RpcError::Json(e.to_string())
    }
}
