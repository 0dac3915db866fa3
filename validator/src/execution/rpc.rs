// Copyright (c) 2024 Botho Foundation

//! In-process JSON-RPC 2.0 access to the execution node.
//!
//! Requests and responses cross the client boundary as serialized JSON, the
//! same bytes a socket transport would carry, so forwarded requests and
//! typed calls share one code path.

use async_trait::async_trait;
use bth_keystore::{Address, ChainStateReader, KeystoreError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::state::ExecutionBackend;

pub const PARSE_ERROR: i32 = -32700;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;

/// JSON-RPC request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    pub id: Value,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: &str, params: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params,
            id: json!(id),
        }
    }
}

/// JSON-RPC response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
    pub id: Value,
}

/// JSON-RPC error
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn error(id: Value, code: i32, message: &str) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.to_string(),
                data: None,
            }),
            id,
        }
    }
}

/// Serves decoded requests.
#[async_trait]
pub trait RpcHandler: Send + Sync {
    async fn handle(&self, request: JsonRpcRequest) -> JsonRpcResponse;
}

/// Read-only chain queries over the execution backend.
pub struct ChainRpc {
    backend: Arc<ExecutionBackend>,
}

impl ChainRpc {
    pub fn new(backend: Arc<ExecutionBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl RpcHandler for ChainRpc {
    async fn handle(&self, request: JsonRpcRequest) -> JsonRpcResponse {
        let id = request.id.clone();
        match request.method.as_str() {
            "chain_blockNumber" => JsonRpcResponse::success(id, json!(self.backend.height())),
            "chain_appHash" => {
                JsonRpcResponse::success(id, json!(hex::encode(self.backend.app_hash())))
            }
            "chain_getBalance" => match address_param(&request.params) {
                Ok(address) => JsonRpcResponse::success(
                    id,
                    json!(self.backend.account(&address).balance.to_string()),
                ),
                Err(msg) => JsonRpcResponse::error(id, INVALID_PARAMS, &msg),
            },
            "chain_getTransactionCount" => match address_param(&request.params) {
                Ok(address) => {
                    JsonRpcResponse::success(id, json!(self.backend.account(&address).nonce))
                }
                Err(msg) => JsonRpcResponse::error(id, INVALID_PARAMS, &msg),
            },
            _ => JsonRpcResponse::error(
                id,
                METHOD_NOT_FOUND,
                &format!("Method not found: {}", request.method),
            ),
        }
    }
}

/// Address from `["0x.."]` or `{"address": "0x.."}`.
fn address_param(params: &Value) -> Result<Address, String> {
    let raw = params
        .get(0)
        .or_else(|| params.get("address"))
        .and_then(Value::as_str)
        .ok_or_else(|| "Missing address parameter".to_string())?;
    raw.parse()
        .map_err(|_| format!("Invalid address: {}", raw))
}

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("rpc client is closed")]
    Closed,

    #[error("rpc error {code}: {message}")]
    Server { code: i32, message: String },

    #[error("invalid rpc response: {0}")]
    InvalidResponse(String),

    #[error("rpc serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A client attached to an in-process [`RpcHandler`].
///
/// Each attach yields its own client with its own request ids; closing one
/// does not affect the others. All clients fail with [`RpcError::Closed`]
/// once the node they were attached to stops.
pub struct RpcClient {
    handler: Arc<dyn RpcHandler>,
    next_id: AtomicU64,
    closed: AtomicBool,
    node_stopped: CancellationToken,
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl RpcClient {
    pub fn in_process(handler: Arc<dyn RpcHandler>, node_stopped: CancellationToken) -> Self {
        Self {
            handler,
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            node_stopped,
        }
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.node_stopped.is_cancelled()
    }

    /// Call `method` and decode its result.
    pub async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = serde_json::to_vec(&JsonRpcRequest::new(id, method, params))?;
        let response: JsonRpcResponse = serde_json::from_slice(&self.call_raw(&request).await?)?;

        if let Some(error) = response.error {
            return Err(RpcError::Server {
                code: error.code,
                message: error.message,
            });
        }
        let result = response
            .result
            .ok_or_else(|| RpcError::InvalidResponse(format!("no result for {}", method)))?;
        Ok(serde_json::from_value(result)?)
    }

    /// Forward an encoded request verbatim and return the encoded response.
    /// Malformed requests get a parse error response, not an `Err`.
    pub async fn call_raw(&self, request: &[u8]) -> Result<Vec<u8>, RpcError> {
        if self.is_closed() {
            return Err(RpcError::Closed);
        }
        let response = match serde_json::from_slice::<JsonRpcRequest>(request) {
            Ok(request) => self.handler.handle(request).await,
            Err(e) => JsonRpcResponse::error(Value::Null, PARSE_ERROR, &format!("Parse error: {}", e)),
        };
        Ok(serde_json::to_vec(&response)?)
    }
}

/// Typed chain queries over an attached client.
#[derive(Debug)]
pub struct StateClient {
    client: RpcClient,
}

impl StateClient {
    pub fn new(client: RpcClient) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &RpcClient {
        &self.client
    }

    pub async fn block_number(&self) -> Result<u64, RpcError> {
        self.client.call("chain_blockNumber", json!([])).await
    }

    pub async fn app_hash(&self) -> Result<String, RpcError> {
        self.client.call("chain_appHash", json!([])).await
    }

    pub async fn balance(&self, address: &Address) -> Result<u128, RpcError> {
        let raw: String = self
            .client
            .call("chain_getBalance", json!([address.to_string()]))
            .await?;
        raw.parse()
            .map_err(|_| RpcError::InvalidResponse(format!("bad balance {:?}", raw)))
    }

    pub async fn nonce(&self, address: &Address) -> Result<u64, RpcError> {
        self.client
            .call("chain_getTransactionCount", json!([address.to_string()]))
            .await
    }
}

#[async_trait]
impl ChainStateReader for StateClient {
    async fn balance_at(&self, address: &Address) -> bth_keystore::Result<u128> {
        self.balance(address)
            .await
            .map_err(|e| KeystoreError::ChainState(e.to_string()))
    }

    async fn nonce_at(&self, address: &Address) -> bth_keystore::Result<u64> {
        self.nonce(address)
            .await
            .map_err(|e| KeystoreError::ChainState(e.to_string()))
    }
}
