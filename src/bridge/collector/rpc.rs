//! JSON-RPC 2.0 messages and the HTTP transport used by the polling strategy

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::config::RpcCall;

// ============================================================================
// SBIO: Pure data structures
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct RpcRequest<'a> {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'a str,
    pub params: &'a [Value],
}

impl<'a> RpcRequest<'a> {
    pub fn for_call(call: &'a RpcCall) -> Self {
        Self {
            jsonrpc: "2.0",
            id: call.id,
            method: &call.method,
            params: &call.params,
        }
    }

    pub fn to_text(&self) -> Result<String, RpcError> {
        serde_json::to_string(self).map_err(|e| RpcError::Parse(e.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
}

/// A reply, or a server push, read off the wire
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RpcResponse {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<RpcErrorObject>,
}

impl RpcResponse {
    pub fn parse(text: &str) -> Result<Self, RpcError> {
        serde_json::from_str(text).map_err(|e| RpcError::Parse(e.to_string()))
    }

    /// Correlation id, when it is a non-negative integer
    pub fn numeric_id(&self) -> Option<u64> {
        self.id.as_ref().and_then(Value::as_u64)
    }

    pub fn into_result(self) -> Result<Value, RpcError> {
        if let Some(error) = self.error {
            return Err(RpcError::Remote {
                code: error.code,
                message: error.message,
            });
        }
        // `null` is a legitimate result (e.g. an unknown block)
        Ok(self.result.unwrap_or(Value::Null))
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    #[error("RPC request failed: {0}")]
    Http(String),

    #[error("RPC call timed out after {0:?}")]
    Timeout(Duration),

    #[error("RPC endpoint returned HTTP {0}")]
    Status(u16),

    #[error("Invalid RPC message: {0}")]
    Parse(String),

    #[error("RPC error {code}: {message}")]
    Remote { code: i64, message: String },

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Upstream closed the connection")]
    Closed,
}

// ============================================================================
// SBIO: Trait for abstraction (allows mocking in tests)
// ============================================================================

#[async_trait]
pub trait RpcClient: Send + Sync {
    /// Issue one call and return its `result` member
    async fn call(&self, url: &str, call: &RpcCall) -> Result<Value, RpcError>;
}

// ============================================================================
// SBIO: I/O implementation (real HTTP client)
// ============================================================================

/// JSON-RPC over HTTP POST, one request per call
#[derive(Clone)]
pub struct HttpRpcClient {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpRpcClient {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout,
        }
    }
}

#[async_trait]
impl RpcClient for HttpRpcClient {
    async fn call(&self, url: &str, call: &RpcCall) -> Result<Value, RpcError> {
        let response = self
            .client
            .post(url)
            .timeout(self.timeout)
            .json(&RpcRequest::for_call(call))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    RpcError::Timeout(self.timeout)
                } else {
                    RpcError::Http(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(RpcError::Status(status.as_u16()));
        }

        let reply: RpcResponse = response
            .json()
            .await
            .map_err(|e| RpcError::Parse(e.to_string()))?;

        reply.into_result()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FieldMapping, StatsField};
    use serde_json::json;

    #[test]
    fn test_request_shape() {
        let call = RpcCall::new(
            2,
            "system_health",
            vec![FieldMapping::new("/peers", StatsField::PeersCount)],
        );
        let text = RpcRequest::for_call(&call).to_text().unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(
            value,
            json!({"jsonrpc": "2.0", "id": 2, "method": "system_health", "params": []})
        );
    }

    #[test]
    fn test_response_result_and_error() {
        let ok = RpcResponse::parse(r#"{"jsonrpc":"2.0","id":1,"result":"0x10"}"#).unwrap();
        assert_eq!(ok.numeric_id(), Some(1));
        assert_eq!(ok.into_result().unwrap(), json!("0x10"));

        let err = RpcResponse::parse(
            r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32601,"message":"Method not found"}}"#,
        )
        .unwrap();
        assert_eq!(
            err.into_result().unwrap_err().to_string(),
            "RPC error -32601: Method not found"
        );
    }

    #[test]
    fn test_push_without_id() {
        let push = RpcResponse::parse(r#"{"jsonrpc":"2.0","method":"chain_newHead","params":{}}"#)
            .unwrap();
        assert_eq!(push.numeric_id(), None);
    }

    #[test]
    fn test_garbage_is_parse_error() {
        assert!(matches!(RpcResponse::parse("not json"), Err(RpcError::Parse(_))));
    }
}
