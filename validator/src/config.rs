// Copyright (c) 2024 Botho Foundation

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration for the validator node
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub abci: AbciConfig,
    #[serde(default)]
    pub accounts: AccountsConfig,
    #[serde(default)]
    pub consensus: ConsensusConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionConfig {
    /// Directory holding the committed state snapshot
    pub data_dir: PathBuf,

    /// Directory of encrypted key files
    pub keystore_dir: PathBuf,

    /// Directory of HD wallet files. Hot-plug self-derivation is disabled
    /// when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wallets_dir: Option<PathBuf>,

    /// How often the wallet directories are rescanned for hot-plug events
    #[serde(default = "default_wallet_refresh_secs")]
    pub wallet_refresh_secs: u64,

    /// Use cheap key derivation for new key files (development only)
    #[serde(default)]
    pub light_kdf: bool,
}

fn default_wallet_refresh_secs() -> u64 {
    3
}

impl ExecutionConfig {
    pub fn wallet_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.wallet_refresh_secs.max(1))
    }

    pub fn state_snapshot_path(&self) -> PathBuf {
        self.data_dir.join("state.json")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AbciConfig {
    /// Listen address of the application server, `tcp://host:port`
    #[serde(default = "default_abci_address")]
    pub address: String,

    /// Wire protocol selector. Only "socket" is served.
    #[serde(default = "default_abci_protocol")]
    pub protocol: String,
}

fn default_abci_address() -> String {
    "tcp://127.0.0.1:26658".to_string()
}

fn default_abci_protocol() -> String {
    "socket".to_string()
}

impl Default for AbciConfig {
    fn default() -> Self {
        Self {
            address: default_abci_address(),
            protocol: default_abci_protocol(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccountsConfig {
    /// Comma separated accounts to unlock at startup
    #[serde(default)]
    pub unlock: String,

    /// File with one password per line, matched to `unlock` by position
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConsensusConfig {
    /// Application address dialled when no in-process bridge is available
    #[serde(default = "default_abci_address")]
    pub proxy_app: String,

    /// Protocol used to reach `proxy_app`
    #[serde(default = "default_abci_protocol")]
    pub abci: String,

    pub db_dir: PathBuf,
    pub priv_validator_key_file: PathBuf,
    pub genesis_file: PathBuf,

    #[serde(default = "default_block_interval_ms")]
    pub block_interval_ms: u64,

    #[serde(default = "default_max_block_txs")]
    pub max_block_txs: usize,

    /// Produce blocks even when the mempool is empty
    #[serde(default)]
    pub create_empty_blocks: bool,
}

fn default_block_interval_ms() -> u64 {
    1000
}

fn default_max_block_txs() -> usize {
    1000
}

impl ConsensusConfig {
    pub fn block_interval(&self) -> Duration {
        Duration::from_millis(self.block_interval_ms.max(1))
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Config::with_home(&default_data_dir()).execution
    }
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Config::with_home(&default_data_dir()).consensus
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::with_home(&default_data_dir())
    }
}

impl Config {
    /// Default layout rooted at `home`
    pub fn with_home(home: &Path) -> Self {
        Self {
            execution: ExecutionConfig {
                data_dir: home.join("execution"),
                keystore_dir: home.join("keystore"),
                wallets_dir: Some(home.join("wallets")),
                wallet_refresh_secs: default_wallet_refresh_secs(),
                light_kdf: false,
            },
            abci: AbciConfig::default(),
            accounts: AccountsConfig::default(),
            consensus: ConsensusConfig {
                proxy_app: default_abci_address(),
                abci: default_abci_protocol(),
                db_dir: home.join("consensus").join("data"),
                priv_validator_key_file: home.join("consensus").join("priv_validator_key.json"),
                genesis_file: home.join("consensus").join("genesis.json"),
                block_interval_ms: default_block_interval_ms(),
                max_block_txs: default_max_block_txs(),
                create_empty_blocks: false,
            },
        }
    }

    /// Load config from a file. Relative paths are taken relative to the
    /// directory containing the file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        let mut config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config from {}", path.display()))?;

        let base = path
            .parent()
            .ok_or_else(|| anyhow!("Config path {} has no parent", path.display()))?;
        config.resolve_paths(base);
        Ok(config)
    }

    /// Save config to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(path, contents)
            .with_context(|| format!("Failed to write config to {}", path.display()))?;

        // Unlock lists and password file locations are sensitive
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o600);
            fs::set_permissions(path, perms)
                .with_context(|| format!("Failed to set permissions on {}", path.display()))?;
        }

        Ok(())
    }

    /// Check if config file exists
    pub fn exists(path: &Path) -> bool {
        path.exists()
    }

    fn resolve_paths(&mut self, base: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        resolve(&mut self.execution.data_dir);
        resolve(&mut self.execution.keystore_dir);
        if let Some(dir) = self.execution.wallets_dir.as_mut() {
            resolve(dir);
        }
        if let Some(file) = self.accounts.password_file.as_mut() {
            resolve(file);
        }
        resolve(&mut self.consensus.db_dir);
        resolve(&mut self.consensus.priv_validator_key_file);
        resolve(&mut self.consensus.genesis_file);
    }
}

/// Get the default data directory
pub fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".bth-validator")
}

/// Get the default config file path
pub fn default_config_path() -> PathBuf {
    default_data_dir().join("config.toml")
}

/// The home directory a config file lives in
pub fn home_from_config(config_path: &Path) -> PathBuf {
    config_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(default_data_dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_config_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = Config::with_home(dir.path());
        config.accounts.unlock = "0x0000000000000000000000000000000000000001".to_string();
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_defaults_fill_missing_sections() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
[execution]
data_dir = "exec"
keystore_dir = "keys"

[consensus]
db_dir = "db"
priv_validator_key_file = "key.json"
genesis_file = "genesis.json"
"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.abci.address, "tcp://127.0.0.1:26658");
        assert_eq!(config.abci.protocol, "socket");
        assert_eq!(config.consensus.block_interval_ms, 1000);
        assert_eq!(config.execution.wallet_refresh_secs, 3);
        assert!(config.execution.wallets_dir.is_none());
        assert!(config.accounts.unlock.is_empty());
    }

    #[test]
    fn test_relative_paths_resolved_against_config_dir() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
[execution]
data_dir = "exec"
keystore_dir = "/abs/keys"

[accounts]
password_file = "passwords.txt"

[consensus]
db_dir = "db"
priv_validator_key_file = "key.json"
genesis_file = "genesis.json"
"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.execution.data_dir, dir.path().join("exec"));
        assert_eq!(config.execution.keystore_dir, PathBuf::from("/abs/keys"));
        assert_eq!(
            config.accounts.password_file,
            Some(dir.path().join("passwords.txt"))
        );
        assert_eq!(config.consensus.genesis_file, dir.path().join("genesis.json"));
    }

    #[cfg(unix)]
    #[test]
    fn test_saved_config_is_private() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        Config::with_home(dir.path()).save(&path).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
