// Copyright (c) 2024 Botho Foundation

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::genesis::{GenesisDoc, GenesisProvider};
use super::key::ValidatorKey;
use super::store::{BlockHeader, BlockStore, DbProvider, SignedBlock};
use super::{ConsensusEngine, ConsensusError};
use crate::abci::RemoteApp;
use crate::app::{Application, TxResponse};
use crate::config::ConsensusConfig;

/// How the consensus node reaches its application.
pub enum ClientCreator {
    /// In-process application
    Local(Arc<dyn Application>),
    /// Application server dialled over the socket protocol
    Remote { address: String, protocol: String },
}

impl ClientCreator {
    /// Local when an application is given, otherwise the configured proxy app.
    pub fn new(local: Option<Arc<dyn Application>>, config: &ConsensusConfig) -> Self {
        match local {
            Some(app) => Self::Local(app),
            None => Self::Remote {
                address: config.proxy_app.clone(),
                protocol: config.abci.clone(),
            },
        }
    }

    pub async fn connect(&self) -> Result<Arc<dyn Application>, ConsensusError> {
        match self {
            Self::Local(app) => Ok(app.clone()),
            Self::Remote { address, protocol } => {
                let app = RemoteApp::connect(address, protocol).await?;
                Ok(Arc::new(app))
            }
        }
    }
}

enum RunState {
    Idle,
    Running(Option<JoinHandle<()>>),
    Stopped,
}

struct NodeInner {
    config: ConsensusConfig,
    key: ValidatorKey,
    genesis: GenesisDoc,
    app: Arc<dyn Application>,
    store: BlockStore,
    /// Admitted transactions. Held across `check_tx` so admission and
    /// recheck never interleave.
    mempool: tokio::sync::Mutex<VecDeque<Vec<u8>>>,
    /// Block committed by the application whose append failed
    unstored: Mutex<Option<SignedBlock>>,
}

/// Solo block producer.
///
/// Blocks are built from the mempool every `block_interval_ms`, executed
/// against the application and appended to the block store signed by the
/// validator key. Only a validator listed in genesis produces blocks.
pub struct ConsensusNode {
    inner: Arc<NodeInner>,
    shutdown: CancellationToken,
    state: Mutex<RunState>,
}

impl ConsensusNode {
    /// Load genesis and the block store, connect to the application and
    /// check that both agree on the last committed block.
    pub async fn new(
        config: &ConsensusConfig,
        key: ValidatorKey,
        creator: ClientCreator,
        genesis_provider: GenesisProvider,
        db_provider: DbProvider,
    ) -> Result<Self, ConsensusError> {
        let genesis = genesis_provider()?;
        genesis.validate()?;
        let store = db_provider(&config.db_dir)?;
        let app = creator.connect().await?;

        handshake(app.as_ref(), &store, &genesis, &key).await?;

        Ok(Self {
            inner: Arc::new(NodeInner {
                config: config.clone(),
                key,
                genesis,
                app,
                store,
                mempool: tokio::sync::Mutex::new(VecDeque::new()),
                unstored: Mutex::new(None),
            }),
            shutdown: CancellationToken::new(),
            state: Mutex::new(RunState::Idle),
        })
    }

    pub fn genesis(&self) -> &GenesisDoc {
        &self.inner.genesis
    }

    pub fn is_validator(&self) -> bool {
        self.inner.genesis.is_validator(&self.inner.key.address())
    }

    pub fn last_block(&self) -> Option<SignedBlock> {
        self.inner.store.last()
    }

    pub async fn pending_txs(&self) -> usize {
        self.inner.mempool.lock().await.len()
    }

    /// Build and commit one block now. `None` when there was nothing to
    /// include and empty blocks are disabled.
    pub async fn produce_block(&self) -> Result<Option<SignedBlock>, ConsensusError> {
        self.inner.produce_block().await
    }
}

async fn handshake(
    app: &dyn Application,
    store: &BlockStore,
    genesis: &GenesisDoc,
    key: &ValidatorKey,
) -> Result<(), ConsensusError> {
    let info = app.info().await?;
    if let Some(last) = store.last() {
        if last.header.chain_id != genesis.chain_id {
            return Err(ConsensusError::ChainIdMismatch {
                genesis: genesis.chain_id.clone(),
                store: last.header.chain_id,
            });
        }
    }

    // The application committed a block that never reached the store
    if info.last_block_height == store.height() + 1 {
        let header = BlockHeader {
            chain_id: genesis.chain_id.clone(),
            height: info.last_block_height,
            time: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            num_txs: 0,
            last_block_hash: store.last_hash()?,
            app_hash: info.last_block_app_hash,
            proposer: key.address(),
        };
        let block = sign_block(key, header, Vec::new())?;
        store.append(block)?;
        warn!(
            height = info.last_block_height,
            "Block store was one block behind the application, rebuilt header from application state"
        );
    }

    let stored = store.height();
    if info.last_block_height != stored {
        return Err(ConsensusError::HandshakeHeight {
            app: info.last_block_height,
            store: stored,
        });
    }
    if let Some(last) = store.last() {
        if last.header.app_hash != info.last_block_app_hash {
            return Err(ConsensusError::AppHashMismatch { height: stored });
        }
    }

    info!(
        chain_id = %genesis.chain_id,
        height = stored,
        app_version = %info.version,
        "Handshake with application complete"
    );
    Ok(())
}

fn sign_block(
    key: &ValidatorKey,
    header: BlockHeader,
    tx_hashes: Vec<String>,
) -> Result<SignedBlock, ConsensusError> {
    let signature = key.sign(&header.signing_bytes()?);
    Ok(SignedBlock {
        header,
        tx_hashes,
        signature: signature.to_bytes().to_vec(),
    })
}

impl NodeInner {
    async fn produce_block(&self) -> Result<Option<SignedBlock>, ConsensusError> {
        let mut mempool = self.mempool.lock().await;

        let unstored = self.unstored.lock().take();
        if let Some(block) = unstored {
            if let Err(e) = self.store.append(block.clone()) {
                *self.unstored.lock() = Some(block);
                return Err(e);
            }
            info!(height = block.header.height, "Stored previously committed block");
        }

        let take = mempool.len().min(self.config.max_block_txs);
        if take == 0 && !self.config.create_empty_blocks {
            return Ok(None);
        }
        // Left in the mempool until the application has committed them
        let txs: Vec<Vec<u8>> = mempool.iter().take(take).cloned().collect();

        let height = self.store.height() + 1;
        let last_block_hash = self.store.last_hash()?;
        self.app.begin_block(height).await?;
        let mut tx_hashes = Vec::with_capacity(txs.len());
        for tx in &txs {
            let response = self.app.deliver_tx(tx.clone()).await?;
            if !response.is_ok() {
                debug!(height, code = response.code, log = %response.log, "Transaction failed in block");
            }
            tx_hashes.push(hex::encode(Sha256::digest(tx)));
        }
        self.app.end_block(height).await?;
        let commit = self.app.commit().await?;
        mempool.drain(..take);

        let header = BlockHeader {
            chain_id: self.genesis.chain_id.clone(),
            height,
            time: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            num_txs: u32::try_from(txs.len()).unwrap_or(u32::MAX),
            last_block_hash,
            app_hash: commit.app_hash,
            proposer: self.key.address(),
        };
        let block = sign_block(&self.key, header, tx_hashes)?;
        if let Err(e) = self.store.append(block.clone()) {
            *self.unstored.lock() = Some(block);
            return Err(e);
        }

        // Committed state moved on; drop what no longer passes check_tx
        let remaining: Vec<Vec<u8>> = mempool.drain(..).collect();
        for tx in remaining {
            let response = self.app.check_tx(tx.clone()).await?;
            if response.is_ok() {
                mempool.push_back(tx);
            } else {
                debug!(code = response.code, log = %response.log, "Evicted transaction on recheck");
            }
        }

        Ok(Some(block))
    }

    async fn broadcast_tx(&self, tx: Vec<u8>) -> Result<TxResponse, ConsensusError> {
        let mut mempool = self.mempool.lock().await;
        let response = self.app.check_tx(tx.clone()).await?;
        if response.is_ok() {
            mempool.push_back(tx);
        }
        Ok(response)
    }
}

async fn produce_loop(inner: Arc<NodeInner>, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(inner.config.block_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        match inner.produce_block().await {
            Ok(Some(block)) => info!(
                height = block.header.height,
                txs = block.header.num_txs,
                app_hash = %hex::encode(block.header.app_hash),
                "Committed block"
            ),
            Ok(None) => {}
            Err(e) => error!("Failed to produce block: {}", e),
        }
    }
}

#[async_trait]
impl ConsensusEngine for ConsensusNode {
    async fn start(&self) -> Result<(), ConsensusError> {
        let mut state = self.state.lock();
        if !matches!(*state, RunState::Idle) {
            return Err(ConsensusError::AlreadyStarted);
        }

        let producer = if self.is_validator() {
            info!(
                address = %self.inner.key.address(),
                interval_ms = self.inner.config.block_interval_ms,
                "Consensus node started, producing blocks"
            );
            Some(tokio::spawn(produce_loop(
                self.inner.clone(),
                self.shutdown.child_token(),
            )))
        } else {
            warn!(
                address = %self.inner.key.address(),
                "Consensus node started; key is not a genesis validator, not producing blocks"
            );
            None
        };
        *state = RunState::Running(producer);
        Ok(())
    }

    async fn stop(&self) {
        self.shutdown.cancel();
        let previous = std::mem::replace(&mut *self.state.lock(), RunState::Stopped);
        if let RunState::Running(Some(producer)) = previous {
            if let Err(e) = producer.await {
                debug!("Block producer ended abnormally: {}", e);
            }
        }
        info!(height = self.inner.store.height(), "Consensus node stopped");
    }

    async fn broadcast_tx(&self, tx: Vec<u8>) -> Result<TxResponse, ConsensusError> {
        self.inner.broadcast_tx(tx).await
    }

    fn height(&self) -> u64 {
        self.inner.store.height()
    }
}
