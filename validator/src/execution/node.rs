// Copyright (c) 2024 Botho Foundation

use async_trait::async_trait;
use bth_keystore::{AccountManager, Address, HdWalletDir, KdfParams, KeyStore};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::rpc::{ChainRpc, RpcClient};
use super::state::ExecutionBackend;
use super::{ExecutionNode, NodeError};
use crate::config::ExecutionConfig;

struct Running {
    backend: Arc<ExecutionBackend>,
    rpc: Arc<ChainRpc>,
    shutdown: CancellationToken,
    refresher: JoinHandle<()>,
}

/// Single-process execution node: transfer ledger, key store and wallet
/// hot-plug polling.
pub struct LocalExecutionNode {
    config: ExecutionConfig,
    alloc: BTreeMap<Address, u128>,
    accounts: Arc<AccountManager>,
    running: Mutex<Option<Running>>,
}

impl LocalExecutionNode {
    /// Open the key store and wallet directory. `alloc` seeds the ledger when
    /// no snapshot exists yet.
    pub fn new(config: &ExecutionConfig, alloc: BTreeMap<Address, u128>) -> Result<Self, NodeError> {
        let kdf = if config.light_kdf {
            KdfParams::LIGHT
        } else {
            KdfParams::STANDARD
        };
        let keystore = KeyStore::open(config.keystore_dir.clone(), kdf)?;
        let hd_wallets = config
            .wallets_dir
            .as_ref()
            .map(|dir| HdWalletDir::open(dir.clone()))
            .transpose()?;

        Ok(Self {
            config: config.clone(),
            alloc,
            accounts: Arc::new(AccountManager::new(keystore, hd_wallets)),
            running: Mutex::new(None),
        })
    }
}

#[async_trait]
impl ExecutionNode for LocalExecutionNode {
    async fn start(&self) -> Result<(), NodeError> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Err(NodeError::AlreadyRunning);
        }

        fs::create_dir_all(&self.config.data_dir)?;
        let backend = Arc::new(ExecutionBackend::open(
            self.config.state_snapshot_path(),
            &self.alloc,
        )?);

        let shutdown = CancellationToken::new();
        let refresher = self
            .accounts
            .spawn_refresh(self.config.wallet_refresh_interval(), shutdown.child_token());

        info!(
            height = backend.height(),
            app_hash = %hex::encode(backend.app_hash()),
            accounts = self.accounts.keystore().accounts().len(),
            "Execution node started"
        );
        *running = Some(Running {
            rpc: Arc::new(ChainRpc::new(backend.clone())),
            backend,
            shutdown,
            refresher,
        });
        Ok(())
    }

    async fn stop(&self) -> Result<(), NodeError> {
        let running = self.running.lock().take().ok_or(NodeError::NotRunning)?;
        running.shutdown.cancel();
        if let Err(e) = running.refresher.await {
            debug!("Wallet refresher ended abnormally: {}", e);
        }
        info!(height = running.backend.height(), "Execution node stopped");
        Ok(())
    }

    fn backend(&self) -> Result<Arc<ExecutionBackend>, NodeError> {
        self.running
            .lock()
            .as_ref()
            .map(|r| r.backend.clone())
            .ok_or(NodeError::NotRunning)
    }

    async fn attach(&self) -> Result<RpcClient, NodeError> {
        let running = self.running.lock();
        let running = running.as_ref().ok_or(NodeError::NotRunning)?;
        Ok(RpcClient::in_process(
            running.rpc.clone(),
            running.shutdown.clone(),
        ))
    }

    fn account_manager(&self) -> Arc<AccountManager> {
        self.accounts.clone()
    }
}
