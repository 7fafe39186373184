//! JSON-RPC over HTTP

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use super::{RpcRequest, RpcResponse, RpcTransport};
use crate::error::{Result, WalletError};

/// Timeout for RPC requests
const RPC_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP JSON-RPC client for a single ledger endpoint
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
}

impl HttpTransport {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(RPC_TIMEOUT)
            .build()
            .map_err(WalletError::transport)?;

        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn post<B: serde::Serialize + ?Sized>(&self, body: &B) -> Result<Value> {
        let response = self
            .client
            .post(&self.url)
            .json(body)
            .send()
            .await
            .map_err(WalletError::transport)?;

        if !response.status().is_success() {
            return Err(WalletError::Transport(format!(
                "HTTP error: {}",
                response.status()
            )));
        }

        response.json().await.map_err(WalletError::transport)
    }
}

#[async_trait]
impl RpcTransport for HttpTransport {
    async fn send(&self, request: RpcRequest) -> Result<Value> {
        debug!("RPC {} (id {})", request.method, request.id);
        let body = self.post(&request).await?;
        let response: RpcResponse = serde_json::from_value(body)
            .map_err(|e| WalletError::Transport(format!("malformed RPC response: {}", e)))?;
        response.into_result()
    }

    async fn send_batch(&self, requests: Vec<RpcRequest>) -> Result<Vec<RpcResponse>> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }

        debug!("RPC batch of {} requests", requests.len());
        let body = self.post(&requests).await?;
        decode_batch(body)
    }
}

/// Decode a batch reply. Endpoints answer a rejected batch with a single
/// error object instead of an array.
fn decode_batch(body: Value) -> Result<Vec<RpcResponse>> {
    match body {
        Value::Array(items) => items
            .into_iter()
            .map(|item| {
                serde_json::from_value(item)
                    .map_err(|e| WalletError::Transport(format!("malformed RPC response: {}", e)))
            })
            .collect(),
        other => {
            let response: RpcResponse = serde_json::from_value(other)
                .map_err(|e| WalletError::Transport(format!("malformed RPC response: {}", e)))?;
            match response.error {
                Some(error) => Err(WalletError::protocol(error.code, error.message)),
                None => Err(WalletError::Transport(
                    "expected an array reply to a batch".to_string(),
                )),
            }
        }
    }
}
