//! JSON-RPC 2.0 envelopes.
//!
//! ```json
//! → {"jsonrpc":"2.0","id":7,"method":"bridge.status","params":{"verbose":true}}
//! ← {"jsonrpc":"2.0","id":7,"result":{...}}
//! ← {"jsonrpc":"2.0","id":7,"error":{"code":-32601,"message":"Method not found"}}
//! ```
//!
//! Request ids come from a single process-wide counter: they are strictly
//! increasing and never reused for the lifetime of the process, so a
//! response can always be matched to exactly one caller by id.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::TransportError;

pub const JSONRPC_VERSION: &str = "2.0";

// Standard JSON-RPC error codes.
pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Returns a fresh request id.  The first id is 1.
pub fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

/// Flat, string-keyed parameter object.
pub type RpcParams = Map<String, Value>;

/// Outbound call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<RpcParams>,
}

impl RpcRequest {
    /// Builds a request with a freshly allocated id.
    pub fn new(method: impl Into<String>, params: Option<RpcParams>) -> Self {
        Self::with_id(next_request_id(), method, params)
    }

    pub fn with_id(id: u64, method: impl Into<String>, params: Option<RpcParams>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: method.into(),
            params,
        }
    }
}

/// Error member of a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Inbound reply.
///
/// `result: null` deserializes as an absent result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    #[serde(default)]
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorObject>,
}

impl RpcResponse {
    pub fn success(id: u64, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id),
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: u64, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id),
            result: None,
            error: Some(RpcErrorObject {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }

    /// Parses a response body.
    pub fn from_slice(body: &[u8]) -> Result<Self, TransportError> {
        serde_json::from_slice(body)
            .map_err(|e| TransportError::ProtocolViolation(format!("malformed response: {e}")))
    }

    /// Applies the resolution rule:
    ///
    /// 1. non-null `error` → [`TransportError::Rpc`]
    /// 2. neither `result` nor `error` → [`TransportError::ProtocolViolation`]
    /// 3. otherwise → the result value
    pub fn into_result(self) -> Result<Value, TransportError> {
        if let Some(err) = self.error {
            return Err(TransportError::Rpc {
                code: err.code,
                message: err.message,
            });
        }
        self.result.ok_or_else(|| {
            TransportError::ProtocolViolation(format!(
                "response {:?} carries neither result nor error",
                self.id
            ))
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
