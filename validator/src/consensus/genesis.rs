// Copyright (c) 2024 Botho Foundation

use bth_keystore::Address;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use super::ConsensusError;
use crate::config::ConsensusConfig;

/// Longest accepted chain id.
pub const MAX_CHAIN_ID_LENGTH: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisValidator {
    pub address: Address,
    #[serde(with = "hex::serde")]
    pub pub_key: [u8; 32],
    pub power: u64,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisAppState {
    /// Initial balances
    #[serde(default)]
    pub accounts: BTreeMap<Address, u128>,
}

/// Chain parameters fixed at height 0.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisDoc {
    pub chain_id: String,
    /// RFC 3339 timestamp
    pub genesis_time: String,
    pub validators: Vec<GenesisValidator>,
    #[serde(default)]
    pub app_state: GenesisAppState,
}

impl GenesisDoc {
    pub fn new(chain_id: &str, validators: Vec<GenesisValidator>) -> Self {
        Self {
            chain_id: chain_id.to_string(),
            genesis_time: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            validators,
            app_state: GenesisAppState::default(),
        }
    }

    pub fn load(path: &Path) -> Result<Self, ConsensusError> {
        let contents = fs::read_to_string(path).map_err(|e| ConsensusError::Genesis {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let doc: Self = serde_json::from_str(&contents).map_err(|e| ConsensusError::Genesis {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        doc.validate()?;
        Ok(doc)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConsensusError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConsensusError> {
        let invalid = |reason: &str| ConsensusError::InvalidGenesis(reason.to_string());

        if self.chain_id.is_empty() {
            return Err(invalid("chain_id is empty"));
        }
        if self.chain_id.len() > MAX_CHAIN_ID_LENGTH {
            return Err(invalid("chain_id is too long"));
        }
        DateTime::parse_from_rfc3339(&self.genesis_time)
            .map_err(|_| invalid("genesis_time is not an RFC 3339 timestamp"))?;
        if self.validators.is_empty() {
            return Err(invalid("no validators"));
        }

        let mut seen = HashSet::new();
        for validator in &self.validators {
            if validator.power == 0 {
                return Err(ConsensusError::InvalidGenesis(format!(
                    "validator {} has zero power",
                    validator.address
                )));
            }
            if !seen.insert(validator.address) {
                return Err(ConsensusError::InvalidGenesis(format!(
                    "duplicate validator {}",
                    validator.address
                )));
            }
        }
        Ok(())
    }

    pub fn is_validator(&self, address: &Address) -> bool {
        self.validators.iter().any(|v| &v.address == address)
    }

    pub fn alloc(&self) -> &BTreeMap<Address, u128> {
        &self.app_state.accounts
    }
}

/// Supplies the genesis document when a consensus node is built.
pub type GenesisProvider = Box<dyn FnOnce() -> Result<GenesisDoc, ConsensusError> + Send>;

/// Reads the configured genesis file.
pub fn default_genesis_provider(config: &ConsensusConfig) -> GenesisProvider {
    let path: PathBuf = config.genesis_file.clone();
    Box::new(move || GenesisDoc::load(&path))
}
