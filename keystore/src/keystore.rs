// Copyright (c) 2024 Botho Foundation

//! Directory of encrypted key files.
//!
//! Every file in the key directory holds one sealed ed25519 key. The store
//! caches the address of each file, keeps decrypted keys only for accounts
//! that were explicitly unlocked, and exposes each file as a [`Wallet`] so
//! files dropped into or removed from the directory surface as hot-plug
//! events.

use async_trait::async_trait;
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::account::{Account, Address, KeyUrl};
use crate::cipher::KdfParams;
use crate::derivation::DerivationPath;
use crate::error::{KeystoreError, Result};
use crate::key_file::KeyFile;
use crate::wallet::{diff_wallets, Backend, ChainStateReader, SharedWallet, Wallet, WalletEvent};

/// Url scheme of accounts backed by key files.
pub const KEYSTORE_SCHEME: &str = "keystore";

/// Resolution and unlocking of signing credentials.
///
/// This is the surface the node's account unlocker drives; [`KeyStore`] is
/// the production implementation.
pub trait CredentialStore: Send + Sync {
    /// Turn a user-supplied address (hex, or a decimal index into the account
    /// list) into an account.
    fn resolve_address(&self, address: &str) -> Result<Account>;

    /// Decrypt the key for `account` with `password` and keep it unlocked.
    fn unlock(&self, account: &Account, password: &str) -> Result<()>;
}

struct Unlocked {
    account: Account,
    key: SigningKey,
}

#[derive(Default)]
struct Cache {
    /// Known key files, sorted by url
    accounts: Vec<Account>,
    /// One wallet per key file, in the same order
    wallets: Vec<SharedWallet>,
}

/// Encrypted key files in a single directory.
pub struct KeyStore {
    dir: PathBuf,
    kdf: KdfParams,
    cache: RwLock<Cache>,
    unlocked: Mutex<HashMap<Address, Unlocked>>,
    /// Events produced by local writes, handed out on the next refresh
    pending: Mutex<Vec<WalletEvent>>,
    this: Weak<KeyStore>,
}

impl KeyStore {
    /// Open (creating if needed) the key directory at `dir`.
    pub fn open(dir: impl Into<PathBuf>, kdf: KdfParams) -> Result<Arc<Self>> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let dir = dir.canonicalize()?;

        let store = Arc::new_cyclic(|this| Self {
            dir,
            kdf,
            cache: RwLock::new(Cache::default()),
            unlocked: Mutex::new(HashMap::new()),
            pending: Mutex::new(Vec::new()),
            this: this.clone(),
        });
        // The initial scan is the baseline; nothing has arrived yet.
        store.rescan()?;
        store.pending.lock().clear();
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// All key files, sorted by url.
    pub fn accounts(&self) -> Vec<Account> {
        self.cache.read().accounts.clone()
    }

    pub fn has_address(&self, address: &Address) -> bool {
        self.cache
            .read()
            .accounts
            .iter()
            .any(|a| &a.address == address)
    }

    /// Find the key file for `account`.
    ///
    /// With an empty url every file holding the address matches; more than
    /// one match is reported as [`KeystoreError::AmbiguousAddress`].
    pub fn find(&self, account: &Account) -> Result<Account> {
        let cache = self.cache.read();
        let mut matches: Vec<Account> = cache
            .accounts
            .iter()
            .filter(|a| a.address == account.address)
            .filter(|a| account.url.is_empty() || a.url == account.url)
            .cloned()
            .collect();

        match matches.len() {
            0 => Err(KeystoreError::NotFound),
            1 => Ok(matches.remove(0)),
            _ => Err(KeystoreError::AmbiguousAddress {
                address: account.address,
                matches,
            }),
        }
    }

    /// See [`CredentialStore::resolve_address`].
    pub fn resolve_address(&self, address: &str) -> Result<Account> {
        if Address::is_hex_address(address) {
            return Ok(Account::from_address(address.parse()?));
        }

        let index: usize = address
            .parse()
            .map_err(|_| KeystoreError::InvalidAddress(address.to_string()))?;
        let accounts = self.accounts();
        warn!(
            "Use explicit addresses! Referring to accounts by order in the keystore folder is dangerous and will be removed"
        );
        accounts
            .get(index)
            .cloned()
            .ok_or(KeystoreError::IndexOutOfRange {
                index,
                count: accounts.len(),
            })
    }

    /// See [`CredentialStore::unlock`].
    pub fn unlock(&self, account: &Account, password: &str) -> Result<()> {
        let found = self.find(account)?;
        let key = KeyFile::load(Path::new(&found.url.path))?.decrypt(password)?;

        debug!(address = %found.address, url = %found.url, "Decrypted key");
        self.unlocked.lock().insert(
            found.address,
            Unlocked {
                account: found,
                key,
            },
        );
        Ok(())
    }

    /// Drop the decrypted key for `address`, if any.
    pub fn lock(&self, address: &Address) {
        self.unlocked.lock().remove(address);
    }

    pub fn is_unlocked(&self, address: &Address) -> bool {
        self.unlocked.lock().contains_key(address)
    }

    /// The key file an unlocked address was unlocked from.
    pub fn unlocked_account(&self, address: &Address) -> Option<Account> {
        self.unlocked
            .lock()
            .get(address)
            .map(|u| u.account.clone())
    }

    /// Sign `message` with an unlocked key.
    pub fn sign(&self, address: &Address, message: &[u8]) -> Result<Signature> {
        let unlocked = self.unlocked.lock();
        let entry = unlocked
            .get(address)
            .ok_or(KeystoreError::Locked(*address))?;
        Ok(entry.key.sign(message))
    }

    /// Public key of an unlocked account.
    pub fn verifying_key(&self, address: &Address) -> Result<VerifyingKey> {
        let unlocked = self.unlocked.lock();
        let entry = unlocked
            .get(address)
            .ok_or(KeystoreError::Locked(*address))?;
        Ok(entry.key.verifying_key())
    }

    /// Generate a fresh key, seal it under `password` and store it.
    pub fn new_account(&self, password: &str) -> Result<Account> {
        let mut secret = Zeroizing::new([0u8; 32]);
        rand::thread_rng().fill(&mut secret[..]);
        self.store_key(&SigningKey::from_bytes(&secret), password)
    }

    /// Store an existing secret key. Fails if the address is already present.
    pub fn import_key(&self, secret: &[u8; 32], password: &str) -> Result<Account> {
        let key = SigningKey::from_bytes(secret);
        let address = Address::from_verifying_key(&key.verifying_key());
        if self.has_address(&address) {
            return Err(KeystoreError::AlreadyExists(address));
        }
        self.store_key(&key, password)
    }

    fn store_key(&self, key: &SigningKey, password: &str) -> Result<Account> {
        let file = KeyFile::encrypt(key, password, self.kdf)?;
        let path = self.dir.join(KeyFile::file_name(&file.address));
        file.save(&path)?;
        self.rescan()?;

        Ok(Account::new(file.address, key_url(&path)))
    }

    /// Re-read the directory, updating the cache and queueing events for
    /// files that appeared or vanished.
    fn rescan(&self) -> Result<()> {
        let accounts = scan_dir(&self.dir)?;

        let mut cache = self.cache.write();
        let wallets: Vec<SharedWallet> = accounts
            .iter()
            .map(|account| {
                cache
                    .wallets
                    .iter()
                    .find(|w| w.url() == account.url)
                    .cloned()
                    .unwrap_or_else(|| {
                        Arc::new(KeystoreWallet {
                            account: account.clone(),
                            store: self.this.clone(),
                        }) as SharedWallet
                    })
            })
            .collect();

        let events = diff_wallets(&cache.wallets, &wallets);
        cache.accounts = accounts;
        cache.wallets = wallets;
        let live: Vec<KeyUrl> = cache.accounts.iter().map(|a| a.url.clone()).collect();
        drop(cache);

        // A key whose file is gone can no longer be proven to the operator.
        self.unlocked
            .lock()
            .retain(|_, u| live.contains(&u.account.url));

        self.pending.lock().extend(events);
        Ok(())
    }
}

impl CredentialStore for KeyStore {
    fn resolve_address(&self, address: &str) -> Result<Account> {
        KeyStore::resolve_address(self, address)
    }

    fn unlock(&self, account: &Account, password: &str) -> Result<()> {
        KeyStore::unlock(self, account, password)
    }
}

impl Backend for KeyStore {
    fn wallets(&self) -> Vec<SharedWallet> {
        self.cache.read().wallets.clone()
    }

    fn refresh(&self) -> Result<Vec<WalletEvent>> {
        self.rescan()?;
        Ok(std::mem::take(&mut *self.pending.lock()))
    }
}

#[derive(Deserialize)]
struct AddressOnly {
    address: Address,
}

fn key_url(path: &Path) -> KeyUrl {
    KeyUrl::new(KEYSTORE_SCHEME, path.to_string_lossy().into_owned())
}

/// Read the address of every key file in `dir`, sorted by url.
fn scan_dir(dir: &Path) -> Result<Vec<Account>> {
    let mut accounts = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let name = entry.file_name();
        let name = name.to_string_lossy();
        // Editors and dotfiles are not keys.
        if name.starts_with('.') || name.ends_with('~') || !entry.file_type()?.is_file() {
            continue;
        }

        let parsed = fs::read_to_string(&path)
            .map_err(KeystoreError::from)
            .and_then(|json| serde_json::from_str::<AddressOnly>(&json).map_err(Into::into));
        match parsed {
            Ok(AddressOnly { address }) => accounts.push(Account::new(address, key_url(&path))),
            Err(e) => {
                debug!(path = %path.display(), "Skipping unreadable key file: {}", e);
            }
        }
    }
    accounts.sort_by(|a, b| a.url.cmp(&b.url));
    Ok(accounts)
}

/// A single key file seen as a wallet.
///
/// Key files are always "open"; their keys are unlocked through the store.
pub struct KeystoreWallet {
    account: Account,
    store: Weak<KeyStore>,
}

impl std::fmt::Debug for KeystoreWallet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeystoreWallet")
            .field("account", &self.account)
            .finish()
    }
}

#[async_trait]
impl Wallet for KeystoreWallet {
    fn url(&self) -> KeyUrl {
        self.account.url.clone()
    }

    fn status(&self) -> String {
        let unlocked = self
            .store
            .upgrade()
            .and_then(|s| s.unlocked_account(&self.account.address))
            .map(|a| a.url == self.account.url)
            .unwrap_or(false);
        if unlocked {
            "Unlocked".to_string()
        } else {
            "Locked".to_string()
        }
    }

    fn open(&self, _passphrase: &str) -> Result<()> {
        Ok(())
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }

    fn accounts(&self) -> Vec<Account> {
        vec![self.account.clone()]
    }

    async fn self_derive(
        &self,
        _base: &DerivationPath,
        _chain: &dyn ChainStateReader,
    ) -> Result<Vec<Account>> {
        Ok(Vec::new())
    }
}
