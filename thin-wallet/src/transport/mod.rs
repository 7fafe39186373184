//! Transport collaborators
//!
//! The wallet core talks to the ledger through two seams:
//!
//! - [`RpcTransport`]: JSON-RPC 2.0 request/response, single or batched
//! - [`FrameConnector`]: a framed duplex channel for push subscriptions
//!
//! Production implementations live in [`http`] and [`ws`]; tests substitute
//! in-memory mocks.

pub mod http;
pub mod ws;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, WalletError};

pub use http::HttpTransport;
pub use ws::WsConnector;

/// JSON-RPC 2.0 request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    pub params: Value,
}

impl RpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.into(),
            params,
        }
    }
}

/// JSON-RPC error object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// JSON-RPC 2.0 response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<RpcErrorObject>,
}

impl RpcResponse {
    pub fn success(id: u64, result: Value) -> Self {
        Self {
            id: Some(id),
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: u64, code: i64, message: impl Into<String>) -> Self {
        Self {
            id: Some(id),
            result: None,
            error: Some(RpcErrorObject {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }

    /// Collapse into the call outcome. A response with neither field
    /// resolves to `null`, matching methods that return nothing.
    pub fn into_result(self) -> Result<Value> {
        match (self.error, self.result) {
            (Some(error), _) => Err(WalletError::protocol(error.code, error.message)),
            (None, Some(result)) => Ok(result),
            (None, None) => Ok(Value::Null),
        }
    }
}

/// Request/response channel to the ledger
#[async_trait]
pub trait RpcTransport: Send + Sync {
    /// Send one request and return its result.
    async fn send(&self, request: RpcRequest) -> Result<Value>;

    /// Send many requests in one round trip. Responses may arrive in any
    /// order and some may be missing; callers correlate by id.
    async fn send_batch(&self, requests: Vec<RpcRequest>) -> Result<Vec<RpcResponse>>;
}

/// One transport frame
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Frame {
    pub payload: Vec<u8>,
    /// Last fragment of a message
    pub is_final: bool,
    /// The peer is closing the connection
    pub is_close: bool,
}

impl Frame {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            payload: text.into().into_bytes(),
            is_final: true,
            is_close: false,
        }
    }

    pub fn fragment(payload: impl Into<Vec<u8>>, is_final: bool) -> Self {
        Self {
            payload: payload.into(),
            is_final,
            is_close: false,
        }
    }

    pub fn close() -> Self {
        Self {
            payload: Vec::new(),
            is_final: true,
            is_close: true,
        }
    }
}

/// Writing half of a framed connection
#[async_trait]
pub trait FrameSink: Send {
    async fn send_frame(&mut self, payload: Vec<u8>) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}

/// Reading half of a framed connection
#[async_trait]
pub trait FrameStream: Send {
    /// Next frame; `Ok(None)` when the stream has ended.
    async fn receive_frame(&mut self) -> Result<Option<Frame>>;
}

/// Opens framed connections
#[async_trait]
pub trait FrameConnector: Send + Sync {
    async fn connect(&self, uri: &str) -> Result<(Box<dyn FrameSink>, Box<dyn FrameStream>)>;
}
