// Copyright (c) 2024 Botho Foundation

//! Single-validator consensus engine.
//!
//! The node signs blocks with its [`ValidatorKey`], drives the application
//! through the block lifecycle and persists headers in a [`BlockStore`].

mod genesis;
mod key;
mod node;
mod store;

pub use genesis::{
    default_genesis_provider, GenesisAppState, GenesisDoc, GenesisProvider, GenesisValidator,
    MAX_CHAIN_ID_LENGTH,
};
pub use key::ValidatorKey;
pub use node::{ClientCreator, ConsensusNode};
pub use store::{default_db_provider, BlockHeader, BlockStore, DbProvider, SignedBlock, BLOCKS_FILE};

use async_trait::async_trait;
use std::path::PathBuf;
use thiserror::Error;

use crate::abci::ServerError;
use crate::app::{AppError, TxResponse};

#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error("failed to read genesis file {}: {reason}", .path.display())]
    Genesis { path: PathBuf, reason: String },

    #[error("invalid genesis: {0}")]
    InvalidGenesis(String),

    #[error("invalid validator key file {}: {reason}", .path.display())]
    InvalidKey { path: PathBuf, reason: String },

    #[error("corrupt block store {}: {reason}", .path.display())]
    InvalidStore { path: PathBuf, reason: String },

    #[error("application is at height {app} but the block store is at height {store}")]
    HandshakeHeight { app: u64, store: u64 },

    #[error("application hash does not match the stored block at height {height}")]
    AppHashMismatch { height: u64 },

    #[error("genesis chain id {genesis:?} does not match stored chain {store:?}")]
    ChainIdMismatch { genesis: String, store: String },

    #[error("consensus node already started")]
    AlreadyStarted,

    #[error("application error: {0}")]
    App(#[from] AppError),

    #[error("failed to connect to application: {0}")]
    Connect(#[from] ServerError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A running consensus engine.
#[async_trait]
pub trait ConsensusEngine: Send + Sync {
    async fn start(&self) -> Result<(), ConsensusError>;

    async fn stop(&self);

    /// Submit a transaction to the mempool. Rejections from `check_tx` are
    /// reported in the response, not as an error.
    async fn broadcast_tx(&self, tx: Vec<u8>) -> Result<TxResponse, ConsensusError>;

    /// Height of the last committed block.
    fn height(&self) -> u64;
}
