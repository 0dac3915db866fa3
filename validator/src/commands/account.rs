// Copyright (c) 2024 Botho Foundation

use anyhow::{anyhow, bail, Context, Result};
use bth_keystore::{Account, KdfParams, KeyStore};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use zeroize::Zeroizing;

use super::print_success;
use crate::config::Config;
use crate::passwords::{load_password_list, prompt_new_passphrase, PasswordPrompt, TerminalPrompt};

fn open_keystore(config_path: &Path) -> Result<Arc<KeyStore>> {
    let config =
        Config::load(config_path).context("No config found. Run 'bth-validator init' first.")?;
    let kdf = if config.execution.light_kdf {
        KdfParams::LIGHT
    } else {
        KdfParams::STANDARD
    };
    KeyStore::open(config.execution.keystore_dir.clone(), kdf).with_context(|| {
        format!(
            "Failed to open key store {}",
            config.execution.keystore_dir.display()
        )
    })
}

/// New passphrase from the first line of `password_file`, or asked twice on
/// the terminal.
fn new_passphrase(
    password_file: Option<&Path>,
    prompt: &mut dyn PasswordPrompt,
) -> Result<Zeroizing<String>> {
    match password_file {
        Some(path) => load_password_list(path)
            .with_context(|| format!("Failed to read password file {}", path.display()))?
            .into_iter()
            .next()
            .filter(|password| !password.is_empty())
            .ok_or_else(|| anyhow!("Password file {} is empty", path.display())),
        None => {
            eprintln!("Your new account is locked with a passphrase. Please give a passphrase. Do not forget it!");
            Ok(prompt_new_passphrase(prompt)?)
        }
    }
}

/// Create a new key file.
pub fn new(config_path: &Path, password_file: Option<&Path>) -> Result<Account> {
    let keystore = open_keystore(config_path)?;
    let password = new_passphrase(password_file, &mut TerminalPrompt)?;
    let account = keystore.new_account(&password)?;

    print_success(&format!("Address: {}", account.address));
    println!("Key file: {}", account.url);
    Ok(account)
}

/// List known accounts in the order `--unlock` indexes refer to.
pub fn list(config_path: &Path) -> Result<Vec<Account>> {
    let accounts = open_keystore(config_path)?.accounts();
    if accounts.is_empty() {
        println!("No accounts. Run 'bth-validator account new' to create one.");
    }
    for (index, account) in accounts.iter().enumerate() {
        println!("Account #{}: {} {}", index, account.address, account.url);
    }
    Ok(accounts)
}

/// Import a hex-encoded ed25519 secret key from `key_file`.
pub fn import(config_path: &Path, key_file: &Path, password_file: Option<&Path>) -> Result<Account> {
    let contents = Zeroizing::new(
        fs::read_to_string(key_file)
            .with_context(|| format!("Failed to read key file {}", key_file.display()))?,
    );
    let hex_key = contents.trim();
    let hex_key = hex_key.strip_prefix("0x").unwrap_or(hex_key);

    let mut secret = Zeroizing::new([0u8; 32]);
    if hex::decode_to_slice(hex_key, secret.as_mut_slice()).is_err() {
        bail!("Key file must hold a 32 byte hex-encoded secret key");
    }

    let keystore = open_keystore(config_path)?;
    let password = new_passphrase(password_file, &mut TerminalPrompt)?;
    let account = keystore.import_key(&secret, &password)?;

    print_success(&format!("Imported address: {}", account.address));
    println!("Key file: {}", account.url);
    Ok(account)
}
