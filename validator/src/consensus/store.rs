// Copyright (c) 2024 Botho Foundation

//! Append-only block store.
//!
//! Blocks are kept one JSON document per line in `blocks.jsonl` under the
//! consensus database directory.

use bth_keystore::Address;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

use super::ConsensusError;

pub const BLOCKS_FILE: &str = "blocks.jsonl";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub chain_id: String,
    pub height: u64,
    /// RFC 3339 timestamp
    pub time: String,
    pub num_txs: u32,
    #[serde(with = "hex::serde")]
    pub last_block_hash: [u8; 32],
    /// Application state after executing this block
    #[serde(with = "hex::serde")]
    pub app_hash: [u8; 32],
    pub proposer: Address,
}

impl BlockHeader {
    pub fn signing_bytes(&self) -> Result<Vec<u8>, ConsensusError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn hash(&self) -> Result<[u8; 32], ConsensusError> {
        Ok(Sha256::digest(self.signing_bytes()?).into())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedBlock {
    pub header: BlockHeader,
    /// Hex hashes of the transactions in delivery order
    pub tx_hashes: Vec<String>,
    #[serde(with = "hex::serde")]
    pub signature: Vec<u8>,
}

struct StoreInner {
    file: File,
    last: Option<SignedBlock>,
}

pub struct BlockStore {
    path: PathBuf,
    inner: Mutex<StoreInner>,
}

impl BlockStore {
    /// Open or create the store under `db_dir`, checking that the stored
    /// blocks form an unbroken chain from height 1.
    pub fn open(db_dir: &Path) -> Result<Self, ConsensusError> {
        fs::create_dir_all(db_dir)?;
        let path = db_dir.join(BLOCKS_FILE);
        let invalid = |reason: String| ConsensusError::InvalidStore {
            path: path.clone(),
            reason,
        };

        let mut last: Option<SignedBlock> = None;
        if path.exists() {
            let reader = BufReader::new(File::open(&path)?);
            for (line_no, line) in reader.lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                let block: SignedBlock = serde_json::from_str(&line)
                    .map_err(|e| invalid(format!("line {}: {}", line_no + 1, e)))?;

                let (expected_height, expected_parent) = match &last {
                    Some(prev) => (prev.header.height + 1, prev.header.hash()?),
                    None => (1, [0u8; 32]),
                };
                if block.header.height != expected_height {
                    return Err(invalid(format!(
                        "expected height {}, found {}",
                        expected_height, block.header.height
                    )));
                }
                if block.header.last_block_hash != expected_parent {
                    return Err(invalid(format!(
                        "block {} does not extend its parent",
                        block.header.height
                    )));
                }
                last = Some(block);
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        debug!(
            path = %path.display(),
            height = last.as_ref().map_or(0, |b| b.header.height),
            "Opened block store"
        );
        Ok(Self {
            path,
            inner: Mutex::new(StoreInner { file, last }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Height of the last stored block, 0 when empty.
    pub fn height(&self) -> u64 {
        self.inner.lock().last.as_ref().map_or(0, |b| b.header.height)
    }

    pub fn last(&self) -> Option<SignedBlock> {
        self.inner.lock().last.clone()
    }

    /// Hash of the last stored block, zero when empty.
    pub fn last_hash(&self) -> Result<[u8; 32], ConsensusError> {
        match &self.inner.lock().last {
            Some(block) => block.header.hash(),
            None => Ok([0u8; 32]),
        }
    }

    pub fn append(&self, block: SignedBlock) -> Result<(), ConsensusError> {
        let mut inner = self.inner.lock();
        let expected = inner.last.as_ref().map_or(0, |b| b.header.height) + 1;
        if block.header.height != expected {
            return Err(ConsensusError::InvalidStore {
                path: self.path.clone(),
                reason: format!(
                    "cannot append height {}, next is {}",
                    block.header.height, expected
                ),
            });
        }

        let mut line = serde_json::to_vec(&block)?;
        line.push(b'\n');
        inner.file.write_all(&line)?;
        inner.file.sync_data()?;
        inner.last = Some(block);
        Ok(())
    }
}

/// Opens the block store for a consensus database directory.
pub type DbProvider = fn(&Path) -> Result<BlockStore, ConsensusError>;

pub fn default_db_provider(db_dir: &Path) -> Result<BlockStore, ConsensusError> {
    BlockStore::open(db_dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn block(height: u64, parent: [u8; 32]) -> SignedBlock {
        SignedBlock {
            header: BlockHeader {
                chain_id: "test".to_string(),
                height,
                time: "2024-01-01T00:00:00Z".to_string(),
                num_txs: 0,
                last_block_hash: parent,
                app_hash: [height as u8; 32],
                proposer: Address::default(),
            },
            tx_hashes: Vec::new(),
            signature: vec![0; 64],
        }
    }

    #[test]
    fn test_append_and_reopen() {
        let dir = tempdir().unwrap();
        let store = BlockStore::open(dir.path()).unwrap();
        assert_eq!(store.height(), 0);
        assert_eq!(store.last_hash().unwrap(), [0u8; 32]);

        store.append(block(1, [0u8; 32])).unwrap();
        let parent = store.last_hash().unwrap();
        store.append(block(2, parent)).unwrap();
        drop(store);

        let reopened = default_db_provider(dir.path()).unwrap();
        assert_eq!(reopened.height(), 2);
        assert_eq!(reopened.last().unwrap().header.last_block_hash, parent);
    }

    #[test]
    fn test_append_rejects_gap() {
        let dir = tempdir().unwrap();
        let store = BlockStore::open(dir.path()).unwrap();
        assert!(matches!(
            store.append(block(2, [0u8; 32])),
            Err(ConsensusError::InvalidStore { .. })
        ));
    }

    #[test]
    fn test_open_rejects_broken_chain() {
        let dir = tempdir().unwrap();
        let mut contents = serde_json::to_string(&block(1, [0u8; 32])).unwrap();
        contents.push('\n');
        contents.push_str(&serde_json::to_string(&block(2, [9u8; 32])).unwrap());
        contents.push('\n');
        fs::write(dir.path().join(BLOCKS_FILE), contents).unwrap();

        assert!(matches!(
            BlockStore::open(dir.path()),
            Err(ConsensusError::InvalidStore { .. })
        ));
    }
}
