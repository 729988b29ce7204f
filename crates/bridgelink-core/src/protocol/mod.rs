//! Wire formats spoken with the bridge.
//!
//! - **`rpc`** – JSON-RPC 2.0 request/response envelopes sent over HTTPS POST.
//! - **`ws`** – The push-event WebSocket: URL derivation and framing.

pub mod rpc;
pub mod ws;

pub use rpc::{next_request_id, RpcErrorObject, RpcParams, RpcRequest, RpcResponse};
pub use ws::{derive_ws_url, registration_frame, PushFrame, WsUrlError};
