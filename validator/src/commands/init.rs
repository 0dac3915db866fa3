// Copyright (c) 2024 Botho Foundation

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::Path;
use tracing::info;

use super::{parse_alloc, print_success};
use crate::config::{home_from_config, Config};
use crate::consensus::{GenesisDoc, GenesisValidator, ValidatorKey};

/// Voting power given to the local validator in a new genesis
const DEFAULT_POWER: u64 = 10;

/// Run the init command
pub fn run(config_path: &Path, chain_id: &str, allocs: &[String], light_kdf: bool) -> Result<Config> {
    if Config::exists(config_path) {
        bail!(
            "Config already exists at {}\nUse a different --config path or delete the existing config.",
            config_path.display()
        );
    }

    let home = home_from_config(config_path);
    let mut config = Config::with_home(&home);
    config.execution.light_kdf = light_kdf;

    for dir in [
        &config.execution.data_dir,
        &config.execution.keystore_dir,
        &config.consensus.db_dir,
    ] {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create directory {}", dir.display()))?;
    }
    if let Some(dir) = &config.execution.wallets_dir {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create directory {}", dir.display()))?;
    }

    let key = ValidatorKey::load_or_generate(&config.consensus.priv_validator_key_file)
        .context("Failed to create validator key")?;

    if config.consensus.genesis_file.exists() {
        println!(
            "Keeping existing genesis file {}",
            config.consensus.genesis_file.display()
        );
    } else {
        let mut genesis = GenesisDoc::new(
            chain_id,
            vec![GenesisValidator {
                address: key.address(),
                pub_key: key.verifying_key().to_bytes(),
                power: DEFAULT_POWER,
                name: "local".to_string(),
            }],
        );
        for entry in allocs {
            let (address, amount) = parse_alloc(entry)?;
            genesis.app_state.accounts.insert(address, amount);
        }
        genesis.validate().context("Invalid genesis")?;
        genesis
            .save(&config.consensus.genesis_file)
            .context("Failed to write genesis file")?;
    }

    config.save(config_path)?;
    info!(config = %config_path.display(), validator = %key.address(), "Validator initialized");

    print_success("Validator initialized.");
    println!("Config saved to:   {}", config_path.display());
    println!("Validator address: {}", key.address());
    println!("Genesis file:      {}", config.consensus.genesis_file.display());
    println!("\nNext steps:");
    println!("  1. Run 'bth-validator account new' to create a signing account");
    println!("  2. Run 'bth-validator run --unlock <address>' to start the node");

    Ok(config)
}
