// Copyright (c) 2024 Botho Foundation

use async_trait::async_trait;
use bth_keystore::Address;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use super::{
    AppError, Application, CommitResponse, InfoResponse, QueryRequest, QueryResponse, TxResponse,
    CODE_ENCODING_ERROR, CODE_INTERNAL_ERROR, CODE_MEMPOOL_FULL, CODE_UNKNOWN_QUERY,
};
use crate::execution::{
    AccountState, ExecutionBackend, RpcClient, RpcError, StateClient, Transaction, TxError,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    /// Transactions admitted by `check_tx` between commits
    pub max_pending_txs: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            max_pending_txs: 5000,
        }
    }
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("execution client unavailable: {0}")]
    Client(#[from] RpcError),

    #[error("execution client reports height {client}, backend is at {backend}")]
    HeightMismatch { backend: u64, client: u64 },
}

/// Mempool view: committed state plus the effects of admitted transactions.
#[derive(Default)]
struct CheckState {
    accounts: HashMap<Address, AccountState>,
    pending: usize,
}

/// Serves the consensus engine from the execution backend.
///
/// Block execution goes straight to the backend; reads go through the
/// attached RPC client.
pub struct ExecutionApp {
    backend: Arc<ExecutionBackend>,
    client: StateClient,
    config: AppConfig,
    check: Mutex<CheckState>,
}

impl ExecutionApp {
    pub async fn new(
        backend: Arc<ExecutionBackend>,
        client: RpcClient,
        config: Option<AppConfig>,
    ) -> Result<Self, BridgeError> {
        let client = StateClient::new(client);
        let reported = client.block_number().await?;
        let height = backend.height();
        if reported != height {
            return Err(BridgeError::HeightMismatch {
                backend: height,
                client: reported,
            });
        }
        info!(height, "Application bridge ready");

        Ok(Self {
            backend,
            client,
            config: config.unwrap_or_default(),
            check: Mutex::new(CheckState::default()),
        })
    }

    fn check_transaction(&self, tx: &Transaction) -> Result<(), TxResponse> {
        tx.verify().map_err(|e| TxResponse::rejected(&e))?;

        let transfer = &tx.transfer;
        let mut check = self.check.lock();
        if check.pending >= self.config.max_pending_txs {
            return Err(TxResponse {
                code: CODE_MEMPOOL_FULL,
                log: "mempool is full".to_string(),
            });
        }

        let current = match check.accounts.get(&transfer.from) {
            Some(state) => *state,
            None => self.backend.account(&transfer.from),
        };
        if current.nonce != transfer.nonce {
            return Err(TxResponse::rejected(&TxError::BadNonce {
                expected: current.nonce,
                got: transfer.nonce,
            }));
        }
        if current.balance < transfer.amount {
            return Err(TxResponse::rejected(&TxError::InsufficientFunds {
                balance: current.balance,
                needed: transfer.amount,
            }));
        }

        check.accounts.insert(
            transfer.from,
            AccountState {
                balance: current.balance - transfer.amount,
                nonce: current.nonce + 1,
            },
        );
        check.pending += 1;
        Ok(())
    }

    async fn query_account(&self, request: &QueryRequest) -> Result<Vec<u8>, QueryResponse> {
        let address: Address = std::str::from_utf8(&request.data)
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .ok_or_else(|| QueryResponse {
                code: CODE_ENCODING_ERROR,
                log: "query data must be an address".to_string(),
                ..Default::default()
            })?;

        let value = match request.path.as_str() {
            "/balance" => self.client.balance(&address).await.map(|b| b.to_string()),
            _ => self.client.nonce(&address).await.map(|n| n.to_string()),
        };
        value.map(String::into_bytes).map_err(|e| QueryResponse {
            code: CODE_INTERNAL_ERROR,
            log: e.to_string(),
            ..Default::default()
        })
    }
}

#[async_trait]
impl Application for ExecutionApp {
    async fn info(&self) -> Result<InfoResponse, AppError> {
        Ok(InfoResponse {
            version: env!("CARGO_PKG_VERSION").to_string(),
            last_block_height: self.backend.height(),
            last_block_app_hash: self.backend.app_hash(),
        })
    }

    async fn query(&self, request: QueryRequest) -> Result<QueryResponse, AppError> {
        let height = self.backend.height();
        let result = match request.path.as_str() {
            "/balance" | "/nonce" => self.query_account(&request).await,
            "/rpc" => Ok(self.client.client().call_raw(&request.data).await?),
            other => Err(QueryResponse {
                code: CODE_UNKNOWN_QUERY,
                log: format!("unknown query path {}", other),
                ..Default::default()
            }),
        };

        Ok(match result {
            Ok(value) => QueryResponse {
                value,
                height,
                ..Default::default()
            },
            Err(response) => QueryResponse { height, ..response },
        })
    }

    async fn check_tx(&self, tx: Vec<u8>) -> Result<TxResponse, AppError> {
        let tx = match Transaction::decode(&tx) {
            Ok(tx) => tx,
            Err(e) => return Ok(TxResponse::rejected(&e)),
        };
        Ok(match self.check_transaction(&tx) {
            Ok(()) => TxResponse::ok(),
            Err(response) => {
                debug!(code = response.code, log = %response.log, "Rejected transaction");
                response
            }
        })
    }

    async fn begin_block(&self, height: u64) -> Result<(), AppError> {
        self.backend
            .begin_block(height)
            .map_err(|e| AppError::Backend(e.to_string()))
    }

    async fn deliver_tx(&self, tx: Vec<u8>) -> Result<TxResponse, AppError> {
        let result = Transaction::decode(&tx).and_then(|tx| self.backend.deliver(&tx));
        Ok(match result {
            Ok(()) => TxResponse::ok(),
            Err(e) => TxResponse::rejected(&e),
        })
    }

    async fn end_block(&self, _height: u64) -> Result<(), AppError> {
        Ok(())
    }

    async fn commit(&self) -> Result<CommitResponse, AppError> {
        let app_hash = self
            .backend
            .commit()
            .map_err(|e| AppError::Backend(e.to_string()))?;
        *self.check.lock() = CheckState::default();
        Ok(CommitResponse { app_hash })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::{CODE_BAD_NONCE, CODE_INSUFFICIENT_FUNDS, CODE_OK, CODE_UNAUTHORIZED};
    use crate::execution::tx_fixtures::{funded_sender, transfer};
    use crate::execution::{ChainRpc, StateDb};
    use bth_keystore::KeyStore;
    use serde_json::{json, Value};
    use std::collections::BTreeMap;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    struct Fixture {
        _dir: TempDir,
        keystore: Arc<KeyStore>,
        sender: Address,
        backend: Arc<ExecutionBackend>,
        app: ExecutionApp,
    }

    async fn fixture(config: Option<AppConfig>) -> Fixture {
        let dir = TempDir::new().unwrap();
        let (keystore, sender) = funded_sender(&dir);
        let alloc = BTreeMap::from([(sender, 100u128)]);
        let backend = Arc::new(ExecutionBackend::new(StateDb::genesis(&alloc), None));
        let client = RpcClient::in_process(
            Arc::new(ChainRpc::new(backend.clone())),
            CancellationToken::new(),
        );
        let app = ExecutionApp::new(backend.clone(), client, config).await.unwrap();
        Fixture {
            _dir: dir,
            keystore,
            sender,
            backend,
            app,
        }
    }

    fn signed(f: &Fixture, amount: u128, nonce: u64) -> Vec<u8> {
        Transaction::sign(transfer(f.sender, amount, nonce), &f.keystore)
            .unwrap()
            .encode()
            .unwrap()
    }

    #[tokio::test]
    async fn test_new_fails_on_closed_client() {
        let backend = Arc::new(ExecutionBackend::new(StateDb::default(), None));
        let client = RpcClient::in_process(
            Arc::new(ChainRpc::new(backend.clone())),
            CancellationToken::new(),
        );
        client.close();
        assert!(matches!(
            ExecutionApp::new(backend, client, None).await,
            Err(BridgeError::Client(RpcError::Closed))
        ));
    }

    #[tokio::test]
    async fn test_new_detects_height_mismatch() {
        let ahead = StateDb {
            height: 3,
            ..Default::default()
        };
        let backend = Arc::new(ExecutionBackend::new(StateDb::default(), None));
        let other = Arc::new(ExecutionBackend::new(ahead, None));
        let client = RpcClient::in_process(Arc::new(ChainRpc::new(other)), CancellationToken::new());
        assert!(matches!(
            ExecutionApp::new(backend, client, None).await,
            Err(BridgeError::HeightMismatch { backend: 0, client: 3 })
        ));
    }

    #[tokio::test]
    async fn test_check_tx_tracks_pending_nonces() {
        let f = fixture(None).await;
        assert_eq!(f.app.check_tx(signed(&f, 10, 0)).await.unwrap().code, CODE_OK);
        // Same nonce again is a replay
        assert_eq!(f.app.check_tx(signed(&f, 10, 0)).await.unwrap().code, CODE_BAD_NONCE);
        assert_eq!(f.app.check_tx(signed(&f, 10, 1)).await.unwrap().code, CODE_OK);
        // Pending spends count against the balance
        assert_eq!(
            f.app.check_tx(signed(&f, 90, 2)).await.unwrap().code,
            CODE_INSUFFICIENT_FUNDS
        );
        assert_eq!(
            f.app.check_tx(b"garbage".to_vec()).await.unwrap().code,
            CODE_ENCODING_ERROR
        );
    }

    #[tokio::test]
    async fn test_check_tx_rejects_bad_signature() {
        let f = fixture(None).await;
        let mut tx = Transaction::sign(transfer(f.sender, 1, 0), &f.keystore).unwrap();
        tx.signature[0] ^= 0xff;
        let response = f.app.check_tx(tx.encode().unwrap()).await.unwrap();
        assert_eq!(response.code, CODE_UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_mempool_bound() {
        let f = fixture(Some(AppConfig { max_pending_txs: 1 })).await;
        assert!(f.app.check_tx(signed(&f, 1, 0)).await.unwrap().is_ok());
        assert_eq!(f.app.check_tx(signed(&f, 1, 1)).await.unwrap().code, CODE_MEMPOOL_FULL);
    }

    #[tokio::test]
    async fn test_block_lifecycle_and_queries() {
        let f = fixture(None).await;
        let genesis = f.app.info().await.unwrap();
        assert_eq!(genesis.last_block_height, 0);

        f.app.begin_block(1).await.unwrap();
        assert!(f.app.deliver_tx(signed(&f, 30, 0)).await.unwrap().is_ok());
        assert_eq!(f.app.deliver_tx(signed(&f, 30, 0)).await.unwrap().code, CODE_BAD_NONCE);
        f.app.end_block(1).await.unwrap();
        let commit = f.app.commit().await.unwrap();

        let info = f.app.info().await.unwrap();
        assert_eq!(info.last_block_height, 1);
        assert_eq!(info.last_block_app_hash, commit.app_hash);
        assert_ne!(commit.app_hash, genesis.last_block_app_hash);
        assert_eq!(f.backend.account(&f.sender).balance, 70);

        let balance = f
            .app
            .query(QueryRequest::new("/balance", f.sender.to_string()))
            .await
            .unwrap();
        assert_eq!(balance.code, CODE_OK);
        assert_eq!(balance.value, b"70".to_vec());
        assert_eq!(balance.height, 1);

        let nonce = f
            .app
            .query(QueryRequest::new("/nonce", f.sender.to_string()))
            .await
            .unwrap();
        assert_eq!(nonce.value, b"1".to_vec());
    }

    #[tokio::test]
    async fn test_commit_resets_check_state() {
        let f = fixture(Some(AppConfig { max_pending_txs: 1 })).await;
        assert!(f.app.check_tx(signed(&f, 1, 0)).await.unwrap().is_ok());
        f.app.begin_block(1).await.unwrap();
        assert!(f.app.deliver_tx(signed(&f, 1, 0)).await.unwrap().is_ok());
        f.app.commit().await.unwrap();
        assert!(f.app.check_tx(signed(&f, 1, 1)).await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_rpc_query_forwarded() {
        let f = fixture(None).await;
        let request = json!({
            "jsonrpc": "2.0",
            "method": "chain_getTransactionCount",
            "params": [f.sender.to_string()],
            "id": 9
        });
        let response = f
            .app
            .query(QueryRequest::new("/rpc", serde_json::to_vec(&request).unwrap()))
            .await
            .unwrap();
        let body: Value = serde_json::from_slice(&response.value).unwrap();
        assert_eq!(body["id"], json!(9));
        assert_eq!(body["result"], json!(0));

        let unknown = f.app.query(QueryRequest::new("/store", Vec::new())).await.unwrap();
        assert_eq!(unknown.code, CODE_UNKNOWN_QUERY);
    }
}
