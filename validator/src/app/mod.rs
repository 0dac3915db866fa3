// Copyright (c) 2024 Botho Foundation

//! The application interface between the consensus engine and the execution
//! backend.
//!
//! The consensus engine drives an [`Application`] through the block
//! lifecycle: `begin_block`, `deliver_tx` for every transaction, `end_block`,
//! then `commit`. `check_tx` gates mempool admission and `query` serves
//! reads. The same trait is implemented in process by [`ExecutionApp`] and
//! over a socket by [`RemoteApp`](crate::abci::RemoteApp).

mod execution_app;

pub use execution_app::{AppConfig, BridgeError, ExecutionApp};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::execution::{RpcError, TxError};

pub const CODE_OK: u32 = 0;
pub const CODE_ENCODING_ERROR: u32 = 1;
pub const CODE_UNAUTHORIZED: u32 = 2;
pub const CODE_BAD_NONCE: u32 = 3;
pub const CODE_INSUFFICIENT_FUNDS: u32 = 4;
pub const CODE_MEMPOOL_FULL: u32 = 5;
pub const CODE_UNKNOWN_QUERY: u32 = 6;
pub const CODE_INTERNAL_ERROR: u32 = 7;

/// Response code for a rejected transaction.
pub fn tx_error_code(err: &TxError) -> u32 {
    match err {
        TxError::Malformed(_) => CODE_ENCODING_ERROR,
        TxError::InvalidSignature | TxError::SenderMismatch(_) => CODE_UNAUTHORIZED,
        TxError::BadNonce { .. } => CODE_BAD_NONCE,
        TxError::InsufficientFunds { .. } | TxError::Overflow => CODE_INSUFFICIENT_FUNDS,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfoResponse {
    pub version: String,
    pub last_block_height: u64,
    #[serde(with = "hex::serde")]
    pub last_block_app_hash: [u8; 32],
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub path: String,
    #[serde(with = "hex::serde")]
    pub data: Vec<u8>,
}

impl QueryRequest {
    pub fn new(path: &str, data: impl Into<Vec<u8>>) -> Self {
        Self {
            path: path.to_string(),
            data: data.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub code: u32,
    #[serde(with = "hex::serde")]
    pub value: Vec<u8>,
    pub log: String,
    pub height: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxResponse {
    pub code: u32,
    pub log: String,
}

impl TxResponse {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn rejected(err: &TxError) -> Self {
        Self {
            code: tx_error_code(err),
            log: err.to_string(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == CODE_OK
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitResponse {
    #[serde(with = "hex::serde")]
    pub app_hash: [u8; 32],
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("execution backend error: {0}")]
    Backend(String),

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error("application connection error: {0}")]
    Connection(String),

    #[error("application returned an error: {0}")]
    Remote(String),
}

/// Block lifecycle and queries, as seen by the consensus engine.
#[async_trait]
pub trait Application: Send + Sync {
    async fn info(&self) -> Result<InfoResponse, AppError>;

    async fn query(&self, request: QueryRequest) -> Result<QueryResponse, AppError>;

    async fn check_tx(&self, tx: Vec<u8>) -> Result<TxResponse, AppError>;

    async fn begin_block(&self, height: u64) -> Result<(), AppError>;

    async fn deliver_tx(&self, tx: Vec<u8>) -> Result<TxResponse, AppError>;

    async fn end_block(&self, height: u64) -> Result<(), AppError>;

    async fn commit(&self) -> Result<CommitResponse, AppError>;
}
