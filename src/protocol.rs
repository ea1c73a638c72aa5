//! Wire envelopes exchanged with the worker process.
//!
//! Every message is a single JSON object on its own line:
//!
//! ```text
//! host   -> worker  {"id":1,"method":"ping","params":{}}
//! worker -> host    {"id":1,"result":"pong"}
//! worker -> host    {"id":2,"error":"bad args","trace":"Traceback ..."}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outbound request envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Request {
    /// Process-local request id, never reused.
    pub id: u64,
    /// Name of the remote operation.
    pub method: String,
    /// Arbitrary structured parameters.
    pub params: Value,
}

impl Request {
    /// Build a request. `null` params are sent as an empty object, which is
    /// what workers unpacking keyword arguments expect.
    pub fn new(method: impl Into<String>, params: Value, id: u64) -> Self {
        let params = if params.is_null() {
            Value::Object(Default::default())
        } else {
            params
        };

        Self {
            id,
            method: method.into(),
            params,
        }
    }
}

/// Inbound response envelope.
///
/// Workers that fail before reading the request id answer with `"id": null`;
/// such responses deserialize with `id == None` and never match a caller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Response {
    pub id: Option<u64>,
    #[serde(default)]
    pub result: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    /// Worker-side traceback accompanying an error, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
}

impl Response {
    /// Build a success response.
    pub fn success(id: u64, result: Value) -> Self {
        Self {
            id: Some(id),
            result,
            error: None,
            trace: None,
        }
    }

    /// Build an error response.
    pub fn failure(id: u64, error: Value) -> Self {
        Self {
            id: Some(id),
            result: Value::Null,
            error: Some(error),
            trace: None,
        }
    }

    /// Whether this response carries an error.
    ///
    /// A falsy `error` (`null`, `false`, `0` or `""`) counts as success,
    /// matching workers that always emit the field.
    pub fn is_error(&self) -> bool {
        match &self.error {
            None | Some(Value::Null) | Some(Value::Bool(false)) => false,
            Some(Value::String(s)) => !s.is_empty(),
            Some(Value::Number(n)) => n.as_f64().is_some_and(|n| n != 0.0),
            Some(_) => true,
        }
    }
}
