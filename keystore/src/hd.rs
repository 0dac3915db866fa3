// Copyright (c) 2024 Botho Foundation

//! Hierarchical deterministic wallets.
//!
//! An HD wallet file holds a BIP39 mnemonic sealed under a passphrase. Once
//! opened, the wallet derives ed25519 accounts with SLIP-0010 and can
//! self-derive: walk the children of a base path, keeping every account the
//! chain shows as used plus the first unused one.

use async_trait::async_trait;
use bip39::{Language, Mnemonic, MnemonicType, Seed};
use ed25519_dalek::SigningKey;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;
use zeroize::Zeroizing;

use crate::account::{Account, Address, KeyUrl};
use crate::cipher::{KdfParams, SealedSecret};
use crate::derivation::DerivationPath;
use crate::error::{KeystoreError, Result};
use crate::key_file::write_private;
use crate::wallet::{diff_wallets, Backend, ChainStateReader, SharedWallet, Wallet, WalletEvent};

/// Url scheme of HD wallets.
pub const HD_SCHEME: &str = "hd";

/// File extension recognised by [`HdWalletDir`].
pub const HD_WALLET_EXTENSION: &str = "hdwallet";

/// Upper bound on accounts discovered by a single self-derivation pass.
pub const MAX_SELF_DERIVED: u32 = 1000;

/// Current wallet file format version
const HD_WALLET_VERSION: u32 = 1;

/// Encrypted mnemonic file structure
#[derive(Serialize, Deserialize)]
struct HdWalletFile {
    version: u32,
    crypto: SealedSecret,
}

/// Generate a new 24 word mnemonic.
pub fn generate_mnemonic() -> Zeroizing<String> {
    let mnemonic = Mnemonic::new(MnemonicType::Words24, Language::English);
    Zeroizing::new(mnemonic.phrase().to_string())
}

/// Derive the account at `path` from a BIP39 seed.
pub fn derive_account_key(seed: &[u8], path: &DerivationPath) -> SigningKey {
    let secret = Zeroizing::new(slip10_ed25519::derive_ed25519_private_key(
        seed,
        &path.hardened(),
    ));
    SigningKey::from_bytes(&secret)
}

#[derive(Clone, Debug)]
struct DerivedAccount {
    path: DerivationPath,
    account: Account,
}

#[derive(Default)]
struct HdState {
    seed: Option<Zeroizing<Vec<u8>>>,
    derived: Vec<DerivedAccount>,
    /// Next child index to probe, per base path
    next: HashMap<DerivationPath, u32>,
}

/// One HD wallet file.
pub struct HdWallet {
    url: KeyUrl,
    path: PathBuf,
    state: Mutex<HdState>,
}

impl std::fmt::Debug for HdWallet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HdWallet").field("url", &self.url).finish()
    }
}

impl HdWallet {
    pub fn new(path: PathBuf) -> Self {
        Self {
            url: KeyUrl::new(HD_SCHEME, path.to_string_lossy().into_owned()),
            path,
            state: Mutex::new(HdState::default()),
        }
    }

    /// Seal `mnemonic` under `passphrase` and write it to `path`.
    pub fn create(path: &Path, mnemonic: &str, passphrase: &str, kdf: KdfParams) -> Result<()> {
        Mnemonic::from_phrase(mnemonic, Language::English)
            .map_err(|e| KeystoreError::InvalidMnemonic(e.to_string()))?;

        let file = HdWalletFile {
            version: HD_WALLET_VERSION,
            crypto: SealedSecret::seal(mnemonic.as_bytes(), passphrase, kdf)?,
        };
        write_private(path, serde_json::to_string_pretty(&file)?.as_bytes())
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().seed.is_some()
    }

    /// Derivation path of a derived account.
    pub fn path_of(&self, address: &Address) -> Option<DerivationPath> {
        self.state
            .lock()
            .derived
            .iter()
            .find(|d| &d.account.address == address)
            .map(|d| d.path.clone())
    }

    fn account_at(&self, seed: &[u8], path: &DerivationPath) -> Account {
        let key = derive_account_key(seed, path);
        Account::new(Address::from_verifying_key(&key.verifying_key()), self.url.clone())
    }
}

#[async_trait]
impl Wallet for HdWallet {
    fn url(&self) -> KeyUrl {
        self.url.clone()
    }

    fn status(&self) -> String {
        let state = self.state.lock();
        if state.seed.is_none() {
            return "Closed".to_string();
        }
        format!("Open, {} derived account(s)", state.derived.len())
    }

    fn open(&self, passphrase: &str) -> Result<()> {
        if self.is_open() {
            return Ok(());
        }

        let json = fs::read_to_string(&self.path)?;
        let file: HdWalletFile = serde_json::from_str(&json)?;
        if file.version != HD_WALLET_VERSION {
            return Err(KeystoreError::UnsupportedVersion {
                found: file.version,
                expected: HD_WALLET_VERSION,
            });
        }

        let plaintext = file.crypto.open(passphrase)?;
        let phrase = Zeroizing::new(
            String::from_utf8(plaintext.to_vec())
                .map_err(|_| KeystoreError::InvalidMnemonic("invalid encoding".to_string()))?,
        );
        let mnemonic = Mnemonic::from_phrase(&phrase, Language::English)
            .map_err(|e| KeystoreError::InvalidMnemonic(e.to_string()))?;
        let seed = Seed::new(&mnemonic, "");

        self.state.lock().seed = Some(Zeroizing::new(seed.as_bytes().to_vec()));
        Ok(())
    }

    fn close(&self) -> Result<()> {
        *self.state.lock() = HdState::default();
        Ok(())
    }

    fn accounts(&self) -> Vec<Account> {
        self.state
            .lock()
            .derived
            .iter()
            .map(|d| d.account.clone())
            .collect()
    }

    async fn self_derive(
        &self,
        base: &DerivationPath,
        chain: &dyn ChainStateReader,
    ) -> Result<Vec<Account>> {
        let (seed, start) = {
            let state = self.state.lock();
            let seed = state.seed.clone().ok_or(KeystoreError::WalletClosed)?;
            (seed, state.next.get(base).copied().unwrap_or(0))
        };

        // Chain lookups happen without holding the state lock.
        let mut probed = Vec::new();
        let mut index = start;
        while index - start < MAX_SELF_DERIVED {
            let path = base.child(index);
            let account = self.account_at(&seed, &path);
            let nonce = chain.nonce_at(&account.address).await?;
            let balance = chain.balance_at(&account.address).await?;
            let used = nonce > 0 || balance > 0;
            debug!(%path, address = %account.address, used, "Probed derived account");

            probed.push(DerivedAccount { path, account });
            if !used {
                break;
            }
            index += 1;
        }

        let mut state = self.state.lock();
        if state.seed.is_none() {
            return Err(KeystoreError::WalletClosed);
        }
        let mut added = Vec::new();
        for derived in probed {
            if state.derived.iter().any(|d| d.path == derived.path) {
                continue;
            }
            added.push(derived.account.clone());
            state.derived.push(derived);
        }
        state.next.insert(base.clone(), index);
        Ok(added)
    }
}

/// A directory of HD wallet files.
pub struct HdWalletDir {
    dir: PathBuf,
    wallets: Mutex<Vec<Arc<HdWallet>>>,
}

impl HdWalletDir {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Arc<Self>> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let dir = dir.canonicalize()?;

        let backend = Arc::new(Self {
            dir,
            wallets: Mutex::new(Vec::new()),
        });
        backend.refresh()?;
        Ok(backend)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write a new wallet file named `<name>.hdwallet`. It is picked up on the
    /// next refresh.
    pub fn create_wallet(
        &self,
        name: &str,
        mnemonic: &str,
        passphrase: &str,
        kdf: KdfParams,
    ) -> Result<PathBuf> {
        let path = self.dir.join(format!("{}.{}", name, HD_WALLET_EXTENSION));
        HdWallet::create(&path, mnemonic, passphrase, kdf)?;
        Ok(path)
    }

    fn scan(&self) -> Result<Vec<PathBuf>> {
        let mut paths = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.is_file()
                && path.extension().and_then(|e| e.to_str()) == Some(HD_WALLET_EXTENSION)
            {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }
}

impl Backend for HdWalletDir {
    fn wallets(&self) -> Vec<SharedWallet> {
        self.wallets
            .lock()
            .iter()
            .map(|w| w.clone() as SharedWallet)
            .collect()
    }

    fn refresh(&self) -> Result<Vec<WalletEvent>> {
        let paths = self.scan()?;

        let mut current = self.wallets.lock();
        let mut next: Vec<Arc<HdWallet>> = paths
            .into_iter()
            .map(|path| {
                current
                    .iter()
                    .find(|w| w.path == path)
                    .cloned()
                    .unwrap_or_else(|| Arc::new(HdWallet::new(path)))
            })
            .collect();
        next.sort_by_key(|w| w.url());

        let old: Vec<SharedWallet> = current.iter().map(|w| w.clone() as SharedWallet).collect();
        let new: Vec<SharedWallet> = next.iter().map(|w| w.clone() as SharedWallet).collect();
        let events = diff_wallets(&old, &new);
        *current = next;
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wallet::WalletEventKind;
    use std::collections::HashSet;
    use tempfile::TempDir;

    const TEST_MNEMONIC: &str = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon art";

    /// Chain where a fixed set of addresses have been used.
    struct UsedAddresses(HashSet<Address>);

    #[async_trait]
    impl ChainStateReader for UsedAddresses {
        async fn balance_at(&self, _address: &Address) -> Result<u128> {
            Ok(0)
        }

        async fn nonce_at(&self, address: &Address) -> Result<u64> {
            Ok(if self.0.contains(address) { 1 } else { 0 })
        }
    }

    fn address_at(index: u32) -> Address {
        let mnemonic = Mnemonic::from_phrase(TEST_MNEMONIC, Language::English).unwrap();
        let seed = Seed::new(&mnemonic, "");
        let key = derive_account_key(seed.as_bytes(), &DerivationPath::default_base().child(index));
        Address::from_verifying_key(&key.verifying_key())
    }

    fn wallet(dir: &TempDir, passphrase: &str) -> HdWallet {
        let path = dir.path().join("main.hdwallet");
        HdWallet::create(&path, TEST_MNEMONIC, passphrase, KdfParams::LIGHT).unwrap();
        HdWallet::new(path)
    }

    #[test]
    fn test_open_close() {
        let dir = TempDir::new().unwrap();
        let w = wallet(&dir, "");
        assert_eq!(w.status(), "Closed");
        w.open("").unwrap();
        assert!(w.is_open());
        w.close().unwrap();
        assert!(!w.is_open());
    }

    #[test]
    fn test_open_wrong_passphrase() {
        let dir = TempDir::new().unwrap();
        let w = wallet(&dir, "secret");
        assert!(w.open("").unwrap_err().is_decrypt());
    }

    #[test]
    fn test_create_rejects_bad_mnemonic() {
        let dir = TempDir::new().unwrap();
        let err = HdWallet::create(
            &dir.path().join("x.hdwallet"),
            "not a mnemonic",
            "",
            KdfParams::LIGHT,
        )
        .unwrap_err();
        assert!(matches!(err, KeystoreError::InvalidMnemonic(_)));
    }

    #[tokio::test]
    async fn test_self_derive_closed_wallet() {
        let dir = TempDir::new().unwrap();
        let w = wallet(&dir, "");
        let chain = UsedAddresses(HashSet::new());
        let err = w
            .self_derive(&DerivationPath::default_base(), &chain)
            .await
            .unwrap_err();
        assert!(matches!(err, KeystoreError::WalletClosed));
    }

    #[tokio::test]
    async fn test_self_derive_stops_at_first_unused() {
        let dir = TempDir::new().unwrap();
        let w = wallet(&dir, "");
        w.open("").unwrap();

        let chain = UsedAddresses([address_at(0), address_at(1)].into_iter().collect());
        let base = DerivationPath::default_base();
        let added = w.self_derive(&base, &chain).await.unwrap();
        let addresses: Vec<Address> = added.iter().map(|a| a.address).collect();
        assert_eq!(addresses, vec![address_at(0), address_at(1), address_at(2)]);
        assert_eq!(w.path_of(&address_at(2)), Some(base.child(2)));

        // Nothing new on chain: nothing new derived.
        assert!(w.self_derive(&base, &chain).await.unwrap().is_empty());

        // Account 2 gets used: derivation resumes there.
        let chain = UsedAddresses(
            [address_at(0), address_at(1), address_at(2)]
                .into_iter()
                .collect(),
        );
        let added = w.self_derive(&base, &chain).await.unwrap();
        assert_eq!(added.len(), 1);
        assert_eq!(added[0].address, address_at(3));
        assert_eq!(w.accounts().len(), 4);
    }

    #[test]
    fn test_dir_refresh_events() {
        let dir = TempDir::new().unwrap();
        let backend = HdWalletDir::open(dir.path()).unwrap();
        assert!(backend.wallets().is_empty());

        let path = backend
            .create_wallet("first", TEST_MNEMONIC, "", KdfParams::LIGHT)
            .unwrap();
        fs::write(dir.path().join("ignored.txt"), "x").unwrap();

        let events = backend.refresh().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, WalletEventKind::Arrived);

        // Same wallet instance is kept across refreshes.
        let wallet = backend.wallets().remove(0);
        wallet.open("").unwrap();
        assert!(backend.refresh().unwrap().is_empty());
        assert_eq!(backend.wallets()[0].status(), wallet.status());

        fs::remove_file(path).unwrap();
        let events = backend.refresh().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, WalletEventKind::Dropped);
    }

    #[test]
    fn test_generate_mnemonic_is_valid() {
        let phrase = generate_mnemonic();
        assert_eq!(phrase.split_whitespace().count(), 24);
        assert!(Mnemonic::from_phrase(&phrase, Language::English).is_ok());
    }
}
