//! Stratum v1 wire messages.
//!
//! Stratum is line-delimited JSON-RPC 1.0 with a few conventions: requests
//! and notifications share one shape (notifications carry `"id": null`), and
//! responses always carry both `result` and `error`, one of them null.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::share::ShareError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcMessage {
    /// Request from a miner, or notification from the pool.
    Request {
        /// Miners use numbers or strings; null for notifications.
        #[serde(default)]
        id: Value,
        method: String,
        #[serde(default)]
        params: Value,
    },

    Response {
        id: Value,
        result: Value,
        error: Value,
    },
}

impl JsonRpcMessage {
    pub fn notification(method: impl Into<String>, params: Value) -> Self {
        JsonRpcMessage::Request {
            id: Value::Null,
            method: method.into(),
            params,
        }
    }

    pub fn result(id: Value, result: Value) -> Self {
        JsonRpcMessage::Response {
            id,
            result,
            error: Value::Null,
        }
    }

    /// Error response in Stratum's `[code, message, traceback]` form.
    pub fn error(id: Value, code: i32, message: impl Into<String>) -> Self {
        JsonRpcMessage::Response {
            id,
            result: Value::Null,
            error: json!([code, message.into(), null]),
        }
    }

    pub fn share_error(id: Value, error: &ShareError) -> Self {
        Self::error(id, error.code(), error.to_string())
    }

    pub fn method(&self) -> Option<&str> {
        match self {
            JsonRpcMessage::Request { method, .. } => Some(method),
            JsonRpcMessage::Response { .. } => None,
        }
    }
}

/// Stratum error code for anything without a more specific one.
pub const OTHER_ERROR: i32 = 20;

/// `mining.set_difficulty`
pub fn set_difficulty(difficulty: f64) -> JsonRpcMessage {
    JsonRpcMessage::notification("mining.set_difficulty", json!([difficulty]))
}

/// `mining.notify`
pub fn notify(params: Value) -> JsonRpcMessage {
    JsonRpcMessage::notification("mining.notify", params)
}

/// String parameter at `index`, if present.
pub fn str_param(params: &Value, index: usize) -> Option<&str> {
    params.get(index).and_then(Value::as_str)
}
