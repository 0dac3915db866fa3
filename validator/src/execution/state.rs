// Copyright (c) 2024 Botho Foundation

//! Account balances and nonces, and the backend that commits them block by
//! block.

use bth_keystore::Address;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::transaction::{Transaction, TxError};
use super::NodeError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountState {
    pub balance: u128,
    pub nonce: u64,
}

/// Full ledger state at a committed height.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateDb {
    pub height: u64,
    #[serde(with = "hex::serde")]
    pub app_hash: [u8; 32],
    pub accounts: BTreeMap<Address, AccountState>,
}

impl StateDb {
    /// State at height 0 holding the genesis allocation.
    pub fn genesis(alloc: &BTreeMap<Address, u128>) -> Self {
        let mut state = Self {
            height: 0,
            app_hash: [0u8; 32],
            accounts: alloc
                .iter()
                .filter(|(_, balance)| **balance > 0)
                .map(|(address, balance)| {
                    (
                        *address,
                        AccountState {
                            balance: *balance,
                            nonce: 0,
                        },
                    )
                })
                .collect(),
        };
        state.app_hash = state.compute_hash();
        state
    }

    pub fn account(&self, address: &Address) -> AccountState {
        self.accounts.get(address).copied().unwrap_or_default()
    }

    /// Apply the balance and nonce effects of `tx`. The signature is not
    /// checked here.
    pub fn apply(&mut self, tx: &Transaction) -> Result<(), TxError> {
        let transfer = &tx.transfer;
        let sender = self.account(&transfer.from);
        if sender.nonce != transfer.nonce {
            return Err(TxError::BadNonce {
                expected: sender.nonce,
                got: transfer.nonce,
            });
        }
        if sender.balance < transfer.amount {
            return Err(TxError::InsufficientFunds {
                balance: sender.balance,
                needed: transfer.amount,
            });
        }

        let from = self.accounts.entry(transfer.from).or_default();
        from.balance -= transfer.amount;
        from.nonce += 1;

        let to = self.accounts.entry(transfer.to).or_default();
        to.balance = to
            .balance
            .checked_add(transfer.amount)
            .ok_or(TxError::Overflow)?;
        Ok(())
    }

    /// Hash over the height and every account in address order.
    pub fn compute_hash(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(b"bth-state-v1");
        hasher.update(self.height.to_le_bytes());
        for (address, account) in &self.accounts {
            hasher.update(address.as_bytes());
            hasher.update(account.balance.to_le_bytes());
            hasher.update(account.nonce.to_le_bytes());
        }
        hasher.finalize().into()
    }

    pub fn load(path: &Path) -> Result<Option<Self>, NodeError> {
        let contents = match fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let state: Self = serde_json::from_str(&contents).map_err(|e| NodeError::Snapshot {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        if state.compute_hash() != state.app_hash {
            return Err(NodeError::Snapshot {
                path: path.to_path_buf(),
                reason: "app hash does not match contents".to_string(),
            });
        }
        Ok(Some(state))
    }

    /// Write atomically through a temporary file.
    pub fn save(&self, path: &Path) -> Result<(), NodeError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_vec_pretty(self).map_err(|e| NodeError::Snapshot {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, contents)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

/// Committed state plus the block being built on top of it.
pub struct ExecutionBackend {
    committed: RwLock<StateDb>,
    working: Mutex<Option<StateDb>>,
    snapshot: Option<PathBuf>,
}

impl std::fmt::Debug for ExecutionBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionBackend")
            .field("height", &self.height())
            .field("snapshot", &self.snapshot)
            .finish()
    }
}

impl ExecutionBackend {
    /// In-memory backend, optionally persisting each commit to `snapshot`.
    pub fn new(state: StateDb, snapshot: Option<PathBuf>) -> Self {
        Self {
            committed: RwLock::new(state),
            working: Mutex::new(None),
            snapshot,
        }
    }

    /// Restore from `snapshot`, or start from the genesis allocation when
    /// there is none yet.
    pub fn open(snapshot: PathBuf, alloc: &BTreeMap<Address, u128>) -> Result<Self, NodeError> {
        let state = match StateDb::load(&snapshot)? {
            Some(state) => state,
            None => {
                let state = StateDb::genesis(alloc);
                state.save(&snapshot)?;
                state
            }
        };
        Ok(Self::new(state, Some(snapshot)))
    }

    pub fn height(&self) -> u64 {
        self.committed.read().height
    }

    pub fn app_hash(&self) -> [u8; 32] {
        self.committed.read().app_hash
    }

    /// Committed state of `address`.
    pub fn account(&self, address: &Address) -> AccountState {
        self.committed.read().account(address)
    }

    /// Start building block `height` on top of the committed state.
    pub fn begin_block(&self, height: u64) -> Result<(), NodeError> {
        let mut working = self.committed.read().clone();
        let expected = working.height + 1;
        if height != expected {
            return Err(NodeError::BlockOutOfOrder {
                expected,
                got: height,
            });
        }
        working.height = height;
        *self.working.lock() = Some(working);
        Ok(())
    }

    /// Verify and apply `tx` to the block being built.
    pub fn deliver(&self, tx: &Transaction) -> Result<(), TxError> {
        tx.verify()?;
        let mut working = self.working.lock();
        let state = working.get_or_insert_with(|| {
            let mut next = self.committed.read().clone();
            next.height += 1;
            next
        });
        state.apply(tx)
    }

    /// Seal the block being built and return its app hash. Without a block
    /// in progress the committed hash is returned unchanged.
    pub fn commit(&self) -> Result<[u8; 32], NodeError> {
        let Some(mut state) = self.working.lock().take() else {
            return Ok(self.app_hash());
        };
        state.app_hash = state.compute_hash();
        if let Some(path) = &self.snapshot {
            state.save(path)?;
        }
        debug!(height = state.height, app_hash = %hex::encode(state.app_hash), "Committed state");
        let hash = state.app_hash;
        *self.committed.write() = state;
        Ok(hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::transaction::tests::{funded_sender, transfer};
    use tempfile::TempDir;

    fn backend_for(sender: Address, balance: u128, dir: &TempDir) -> ExecutionBackend {
        let alloc = BTreeMap::from([(sender, balance)]);
        ExecutionBackend::open(dir.path().join("state.json"), &alloc).unwrap()
    }

    #[test]
    fn test_genesis_hash_is_stable() {
        let address: Address = "0x00000000000000000000000000000000000000aa".parse().unwrap();
        let alloc = BTreeMap::from([(address, 5u128)]);
        let a = StateDb::genesis(&alloc);
        let b = StateDb::genesis(&alloc);
        assert_eq!(a.app_hash, b.app_hash);
        assert_ne!(a.app_hash, StateDb::genesis(&BTreeMap::new()).app_hash);
    }

    #[test]
    fn test_block_applies_transfer() {
        let dir = TempDir::new().unwrap();
        let (keystore, sender) = funded_sender(&dir);
        let backend = backend_for(sender, 100, &dir);
        let genesis_hash = backend.app_hash();

        let tx = Transaction::sign(transfer(sender, 40, 0), &keystore).unwrap();
        backend.begin_block(1).unwrap();
        backend.deliver(&tx).unwrap();
        // Uncommitted work is not visible
        assert_eq!(backend.account(&sender).balance, 100);

        let hash = backend.commit().unwrap();
        assert_ne!(hash, genesis_hash);
        assert_eq!(backend.height(), 1);
        assert_eq!(backend.account(&sender), AccountState { balance: 60, nonce: 1 });
        assert_eq!(backend.account(&tx.transfer.to).balance, 40);
    }

    #[test]
    fn test_deliver_rejects_replay_and_overdraft() {
        let dir = TempDir::new().unwrap();
        let (keystore, sender) = funded_sender(&dir);
        let backend = backend_for(sender, 10, &dir);

        backend.begin_block(1).unwrap();
        let first = Transaction::sign(transfer(sender, 5, 0), &keystore).unwrap();
        backend.deliver(&first).unwrap();
        assert_eq!(
            backend.deliver(&first),
            Err(TxError::BadNonce { expected: 1, got: 0 })
        );

        let overdraft = Transaction::sign(transfer(sender, 50, 1), &keystore).unwrap();
        assert_eq!(
            backend.deliver(&overdraft),
            Err(TxError::InsufficientFunds { balance: 5, needed: 50 })
        );
    }

    #[test]
    fn test_begin_block_requires_next_height() {
        let dir = TempDir::new().unwrap();
        let backend = ExecutionBackend::open(dir.path().join("state.json"), &BTreeMap::new()).unwrap();
        assert!(matches!(
            backend.begin_block(3),
            Err(NodeError::BlockOutOfOrder { expected: 1, got: 3 })
        ));
    }

    #[test]
    fn test_snapshot_restored_after_restart() {
        let dir = TempDir::new().unwrap();
        let (keystore, sender) = funded_sender(&dir);
        let hash = {
            let backend = backend_for(sender, 100, &dir);
            backend.begin_block(1).unwrap();
            backend
                .deliver(&Transaction::sign(transfer(sender, 1, 0), &keystore).unwrap())
                .unwrap();
            backend.commit().unwrap()
        };

        // A different genesis allocation is ignored once a snapshot exists
        let restored = backend_for(sender, 999, &dir);
        assert_eq!(restored.height(), 1);
        assert_eq!(restored.app_hash(), hash);
        assert_eq!(restored.account(&sender).balance, 99);
    }

    #[test]
    fn test_corrupt_snapshot_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        let mut state = StateDb::genesis(&BTreeMap::new());
        state.height = 7;
        fs::write(&path, serde_json::to_vec(&state).unwrap()).unwrap();

        assert!(matches!(
            ExecutionBackend::open(path, &BTreeMap::new()),
            Err(NodeError::Snapshot { .. })
        ));
    }
}
