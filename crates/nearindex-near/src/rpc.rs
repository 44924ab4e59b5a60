//! JSON-RPC 2.0 wire types and a minimal HTTP transport for NEAR nodes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use nearindex_core::IndexerError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// A JSON-RPC 2.0 request. NEAR methods take either a positional array or
/// a named object, so `params` stays a raw [`Value`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    pub params: Value,
    pub id: u64,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            method: method.into(),
            params,
            id,
        }
    }
}

/// Structured cause attached to NEAR node errors, e.g. `UNKNOWN_BLOCK`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcErrorCause {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<Value>,
}

/// A JSON-RPC 2.0 error object with NEAR's `name` / `cause` extensions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<RpcErrorCause>,
}

impl JsonRpcError {
    pub fn cause_name(&self) -> Option<&str> {
        self.cause.as_ref().map(|c| c.name.as_str())
    }

    /// The node does not have the requested block or chunk: it was never
    /// produced, or it has been garbage collected.
    pub fn is_unknown_block(&self) -> bool {
        if matches!(self.cause_name(), Some("UNKNOWN_BLOCK" | "UNKNOWN_CHUNK")) {
            return true;
        }
        self.data
            .as_ref()
            .and_then(Value::as_str)
            .map_or(false, |d| d.contains("DB Not Found Error"))
    }

    /// The node gave up waiting on its own backend.
    pub fn is_node_timeout(&self) -> bool {
        matches!(self.cause_name(), Some("TIMEOUT_ERROR"))
    }
}

impl std::fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JSON-RPC error {}: {}", self.code, self.message)?;
        if let Some(cause) = self.cause_name() {
            write!(f, " ({cause})")?;
        }
        if let Some(data) = &self.data {
            write!(f, ": {data}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn into_result(self) -> Result<Value, JsonRpcError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

// ─── Errors ──────────────────────────────────────────────────────────────────

/// Errors raised by [`HttpRpcClient`].
#[derive(Debug, Error)]
pub enum RpcError {
    /// Connection refused, reset, DNS failure, ...
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Rate limit exceeded (endpoint: {endpoint})")]
    RateLimited { endpoint: String },

    #[error("Request timed out after {ms}ms")]
    Timeout { ms: u64 },

    /// Error object returned by the node.
    #[error("{0}")]
    Node(JsonRpcError),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl RpcError {
    pub fn is_unknown_block(&self) -> bool {
        matches!(self, Self::Node(e) if e.is_unknown_block())
    }
}

impl From<RpcError> for IndexerError {
    fn from(e: RpcError) -> Self {
        match e {
            RpcError::Http(msg) => IndexerError::Connection(msg),
            RpcError::Status { status, body } if status >= 500 => {
                IndexerError::Connection(format!("HTTP {status}: {body}"))
            }
            RpcError::Status { status, body } => IndexerError::Other(format!("HTTP {status}: {body}")),
            RpcError::RateLimited { endpoint } => IndexerError::RateLimited(endpoint),
            RpcError::Timeout { ms } => IndexerError::Timeout { ms },
            RpcError::Node(err) if err.is_node_timeout() => IndexerError::Connection(err.to_string()),
            RpcError::Node(err) => IndexerError::Other(err.to_string()),
            RpcError::InvalidResponse(msg) => IndexerError::Other(format!("invalid RPC response: {msg}")),
        }
    }
}

// ─── HttpRpcClient ───────────────────────────────────────────────────────────

/// JSON-RPC over HTTP POST. Retries are left to the caller.
pub struct HttpRpcClient {
    url: String,
    http: reqwest::Client,
    timeout: Duration,
    next_id: AtomicU64,
}

impl HttpRpcClient {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, RpcError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RpcError::Http(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            url: url.into(),
            http,
            timeout,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Call `method` and deserialize its `result` into `T`.
    pub async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let req = JsonRpcRequest::new(id, method, params);
        tracing::trace!(id, method, url = %self.url, "RPC request");

        let result = self.send_once(&req).await?.into_result().map_err(RpcError::Node)?;
        serde_json::from_value(result)
            .map_err(|e| RpcError::InvalidResponse(format!("{method}: {e}")))
    }

    async fn send_once(&self, req: &JsonRpcRequest) -> Result<JsonRpcResponse, RpcError> {
        let resp = self
            .http
            .post(&self.url)
            .json(req)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = resp.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(RpcError::RateLimited {
                endpoint: self.url.clone(),
            });
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(RpcError::Status {
                status: status.as_u16(),
                body,
            });
        }

        resp.json::<JsonRpcResponse>()
            .await
            .map_err(|e| self.transport_error(e))
    }

    fn transport_error(&self, e: reqwest::Error) -> RpcError {
        if e.is_timeout() {
            RpcError::Timeout {
                ms: self.timeout.as_millis() as u64,
            }
        } else if e.is_decode() {
            RpcError::InvalidResponse(e.to_string())
        } else {
            RpcError::Http(e.to_string())
        }
    }
}

impl std::fmt::Debug for HttpRpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpRpcClient")
            .field("url", &self.url)
            .field("timeout", &self.timeout)
            .finish()
    }
}
