// Copyright (c) 2024 Botho Foundation

//! The execution side of the node: account state, transactions, and the
//! in-process RPC surface other components attach to.

mod node;
mod rpc;
mod state;
mod transaction;

pub use node::LocalExecutionNode;
pub use rpc::{
    ChainRpc, JsonRpcError, JsonRpcRequest, JsonRpcResponse, RpcClient, RpcError, RpcHandler,
    StateClient, INTERNAL_ERROR, INVALID_PARAMS, METHOD_NOT_FOUND, PARSE_ERROR,
};
pub use state::{AccountState, ExecutionBackend, StateDb};
pub use transaction::{Transaction, Transfer, TxError};

#[cfg(test)]
pub(crate) use transaction::tests as tx_fixtures;

use async_trait::async_trait;
use bth_keystore::{AccountManager, KeystoreError};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("execution node not running")]
    NotRunning,

    #[error("execution node already running")]
    AlreadyRunning,

    #[error("block {got} out of order, expected {expected}")]
    BlockOutOfOrder { expected: u64, got: u64 },

    #[error("invalid state snapshot {}: {reason}", .path.display())]
    Snapshot { path: PathBuf, reason: String },

    #[error(transparent)]
    Keystore(#[from] KeystoreError),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Lifecycle and access points of an execution node.
#[async_trait]
pub trait ExecutionNode: Send + Sync {
    async fn start(&self) -> Result<(), NodeError>;

    async fn stop(&self) -> Result<(), NodeError>;

    /// The running backend service.
    fn backend(&self) -> Result<Arc<ExecutionBackend>, NodeError>;

    /// A new client over the node's RPC surface.
    async fn attach(&self) -> Result<RpcClient, NodeError>;

    /// Wallets and key files served by this node.
    fn account_manager(&self) -> Arc<AccountManager>;
}
