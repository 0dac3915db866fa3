// Copyright (c) 2024 Botho Foundation

//! Startup unlocking of signing accounts.
//!
//! Each entry of the comma separated unlock list is resolved through the
//! [`CredentialStore`] and unlocked with up to [`UNLOCK_ATTEMPTS`]
//! passphrases. When several key files hold the same address the operator's
//! passphrase is tried against each of them in turn, and the first one it
//! opens is kept.

use bth_keystore::{Account, Address, CredentialStore, KeystoreError};
use std::io;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use crate::passwords::PasswordSource;

/// Passphrase attempts per account before giving up.
pub const UNLOCK_ATTEMPTS: usize = 3;

#[derive(Debug, Error)]
pub enum UnlockError {
    #[error("Could not list accounts: {0}")]
    ResolveAccount(#[source] KeystoreError),

    #[error("Failed to unlock account {address} ({source})")]
    Exhausted {
        address: String,
        source: KeystoreError,
    },

    #[error("None of the listed files could be unlocked.")]
    NoMatchingKeyFile { address: Address },

    #[error("Failed to read passphrase: {0}")]
    PassphraseRead(#[source] io::Error),
}

/// Outcome of unlocking an address backed by several key files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmbiguityResolution {
    /// The key file the passphrase opened
    pub selected: Account,
    /// Every other file for the same address
    pub duplicates: Vec<Account>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnlockedAccount {
    pub account: Account,
    /// Set when the address matched more than one key file
    pub resolution: Option<AmbiguityResolution>,
}

/// Split an unlock list into `(index, entry)` pairs.
///
/// The index is the entry's position in the raw list, blanks included, so
/// it lines up with the password file. Blank entries are skipped.
pub fn split_unlock_list(list: &str) -> Vec<(usize, &str)> {
    list.split(',')
        .enumerate()
        .map(|(i, entry)| (i, entry.trim()))
        .filter(|(_, entry)| !entry.is_empty())
        .collect()
}

/// Unlocks the accounts named in an unlock list.
pub struct AccountUnlocker {
    store: Arc<dyn CredentialStore>,
    passwords: PasswordSource,
}

impl AccountUnlocker {
    pub fn new(store: Arc<dyn CredentialStore>, passwords: PasswordSource) -> Self {
        Self { store, passwords }
    }

    /// Unlock every entry of `list`, stopping at the first failure.
    pub fn unlock_accounts(&mut self, list: &str) -> Result<Vec<UnlockedAccount>, UnlockError> {
        let mut unlocked = Vec::new();
        for (index, address) in split_unlock_list(list) {
            unlocked.push(self.unlock_account(address, index)?);
        }
        Ok(unlocked)
    }

    /// Unlock a single account. `index` selects the preloaded password.
    pub fn unlock_account(
        &mut self,
        address: &str,
        index: usize,
    ) -> Result<UnlockedAccount, UnlockError> {
        let account = self
            .store
            .resolve_address(address)
            .map_err(UnlockError::ResolveAccount)?;

        let mut last_err = KeystoreError::Decrypt;
        for attempt in 1..=UNLOCK_ATTEMPTS {
            let prompt = format!(
                "Unlocking account {} | Attempt {}/{}",
                address, attempt, UNLOCK_ATTEMPTS
            );
            let password = self
                .passwords
                .passphrase(&prompt, index)
                .map_err(UnlockError::PassphraseRead)?;

            match self.store.unlock(&account, &password) {
                Ok(()) => {
                    info!(address = %account.address, "Unlocked account");
                    return Ok(UnlockedAccount {
                        account,
                        resolution: None,
                    });
                }
                Err(KeystoreError::AmbiguousAddress { address, matches }) => {
                    let resolution = self.ambiguous_addr_recovery(address, &matches, &password)?;
                    info!(address = %address, url = %resolution.selected.url, "Unlocked account");
                    return Ok(UnlockedAccount {
                        account: resolution.selected.clone(),
                        resolution: Some(resolution),
                    });
                }
                Err(e) if e.is_decrypt() => last_err = e,
                Err(e) => {
                    last_err = e;
                    break;
                }
            }
        }

        Err(UnlockError::Exhausted {
            address: address.to_string(),
            source: last_err,
        })
    }

    /// Try `password` against each of `matches` in order and keep the first
    /// file it unlocks.
    fn ambiguous_addr_recovery(
        &self,
        address: Address,
        matches: &[Account],
        password: &str,
    ) -> Result<AmbiguityResolution, UnlockError> {
        eprintln!("Multiple key files exist for address {}:", address);
        for account in matches {
            eprintln!("   {}", account.url);
        }
        eprintln!("Testing your passphrase against all of them...");

        let selected = matches
            .iter()
            .find(|candidate| self.store.unlock(candidate, password).is_ok())
            .cloned()
            .ok_or(UnlockError::NoMatchingKeyFile { address })?;

        eprintln!("Your passphrase unlocked {}", selected.url);
        eprintln!("In order to avoid this warning, remove the following duplicate key files:");
        let duplicates: Vec<Account> = matches
            .iter()
            .filter(|account| **account != selected)
            .cloned()
            .collect();
        for account in &duplicates {
            eprintln!("   {}", account.url);
        }
        warn!(
            address = %address,
            duplicates = duplicates.len(),
            "Duplicate key files for unlocked address"
        );

        Ok(AmbiguityResolution {
            selected,
            duplicates,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::passwords::tests::ScriptedPrompt;
    use bth_keystore::{KdfParams, KeyStore, KeyUrl};
    use parking_lot::Mutex;
    use tempfile::TempDir;
    use zeroize::Zeroizing;

    const A: &str = "0x00000000000000000000000000000000000000aa";
    const B: &str = "0x00000000000000000000000000000000000000bb";
    const BROKEN: &str = "0x00000000000000000000000000000000000000ee";

    /// Key files as `(account, password)`; records every unlock call.
    #[derive(Default)]
    struct FakeStore {
        files: Vec<(Account, &'static str)>,
        calls: Mutex<Vec<(Account, String)>>,
    }

    impl FakeStore {
        fn with_file(mut self, address: &str, file: &str, password: &'static str) -> Self {
            let account = Account::new(address.parse().unwrap(), KeyUrl::new("keystore", file));
            self.files.push((account, password));
            self
        }

        fn calls(&self) -> Vec<(Account, String)> {
            self.calls.lock().clone()
        }

        fn passwords_tried(&self) -> Vec<String> {
            self.calls().into_iter().map(|(_, p)| p).collect()
        }
    }

    impl CredentialStore for FakeStore {
        fn resolve_address(&self, address: &str) -> bth_keystore::Result<Account> {
            if !Address::is_hex_address(address) {
                return Err(KeystoreError::InvalidAddress(address.to_string()));
            }
            Ok(Account::from_address(address.parse()?))
        }

        fn unlock(&self, account: &Account, password: &str) -> bth_keystore::Result<()> {
            self.calls.lock().push((account.clone(), password.to_string()));
            if account.address.to_string() == BROKEN {
                return Err(KeystoreError::Io(io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    "permission denied",
                )));
            }
            let matches: Vec<&(Account, &str)> = self
                .files
                .iter()
                .filter(|(a, _)| a.address == account.address)
                .filter(|(a, _)| account.url.is_empty() || a.url == account.url)
                .collect();
            match matches.as_slice() {
                [] => Err(KeystoreError::NotFound),
                [(_, expected)] if *expected == password => Ok(()),
                [_] => Err(KeystoreError::Decrypt),
                many => Err(KeystoreError::AmbiguousAddress {
                    address: account.address,
                    matches: many.iter().map(|(a, _)| a.clone()).collect(),
                }),
            }
        }
    }

    fn preloaded(list: &[&str]) -> PasswordSource {
        PasswordSource::Preloaded(list.iter().map(|p| Zeroizing::new(p.to_string())).collect())
    }

    fn interactive(answers: &[&'static str]) -> PasswordSource {
        PasswordSource::Interactive(Box::new(ScriptedPrompt::new(answers.iter().copied())))
    }

    #[test]
    fn test_split_unlock_list_keeps_raw_indices() {
        assert_eq!(split_unlock_list(""), vec![]);
        assert_eq!(split_unlock_list(" , ,"), vec![]);
        assert_eq!(
            split_unlock_list("a, ,b ,, c"),
            vec![(0, "a"), (2, "b"), (4, "c")]
        );
    }

    #[test]
    fn test_blank_entries_skipped_but_indices_preserved() {
        let store = Arc::new(
            FakeStore::default()
                .with_file(A, "a", "pa")
                .with_file(B, "b", "pb"),
        );
        let list = format!("{}, ,{}", A, B);
        let mut unlocker = AccountUnlocker::new(store.clone(), preloaded(&["pa", "unused", "pb"]));

        let unlocked = unlocker.unlock_accounts(&list).unwrap();
        assert_eq!(unlocked.len(), 2);
        assert_eq!(store.passwords_tried(), vec!["pa", "pb"]);
    }

    #[test]
    fn test_short_password_list_reuses_last_entry() {
        let store = Arc::new(
            FakeStore::default()
                .with_file(A, "a", "shared")
                .with_file(B, "b", "shared"),
        );
        let mut unlocker = AccountUnlocker::new(store.clone(), preloaded(&["shared"]));

        unlocker.unlock_accounts(&format!("{},{}", A, B)).unwrap();
        assert_eq!(store.passwords_tried(), vec!["shared", "shared"]);
    }

    #[test]
    fn test_blank_entry_with_single_password() {
        let store = Arc::new(
            FakeStore::default()
                .with_file(A, "a", "p1")
                .with_file(B, "b", "p1"),
        );
        let mut unlocker = AccountUnlocker::new(store.clone(), preloaded(&["p1"]));

        let unlocked = unlocker.unlock_accounts(&format!("{}, , {}", A, B)).unwrap();
        let addresses: Vec<String> = unlocked
            .iter()
            .map(|u| u.account.address.to_string())
            .collect();
        assert_eq!(addresses, vec![A, B]);
        assert_eq!(store.passwords_tried(), vec!["p1", "p1"]);
        let resolved: Vec<String> = store
            .calls()
            .into_iter()
            .map(|(account, _)| account.address.to_string())
            .collect();
        assert_eq!(resolved, vec![A, B]);
    }

    #[test]
    fn test_three_wrong_passwords_exhaust() {
        let store = Arc::new(FakeStore::default().with_file(A, "a", "right"));
        let mut unlocker =
            AccountUnlocker::new(store.clone(), interactive(&["w1", "w2", "w3", "right"]));

        let err = unlocker.unlock_account(A, 0).unwrap_err();
        assert!(matches!(err, UnlockError::Exhausted { .. }));
        assert_eq!(
            err.to_string(),
            format!(
                "Failed to unlock account {} (could not decrypt key with given password)",
                A
            )
        );
        assert_eq!(store.passwords_tried(), vec!["w1", "w2", "w3"]);
    }

    #[test]
    fn test_retry_until_correct_password() {
        let store = Arc::new(FakeStore::default().with_file(A, "a", "right"));
        let mut unlocker = AccountUnlocker::new(store.clone(), interactive(&["wrong", "right"]));

        let unlocked = unlocker.unlock_account(A, 0).unwrap();
        assert_eq!(unlocked.account.address.to_string(), A);
        assert!(unlocked.resolution.is_none());
        assert_eq!(store.calls().len(), 2);
    }

    #[test]
    fn test_non_decrypt_error_stops_retrying() {
        let store = Arc::new(FakeStore::default());
        let mut unlocker = AccountUnlocker::new(store.clone(), preloaded(&["pw"]));

        let err = unlocker.unlock_account(BROKEN, 0).unwrap_err();
        assert!(err.to_string().contains("permission denied"));
        assert_eq!(store.calls().len(), 1);
    }

    #[test]
    fn test_resolve_failure_is_reported() {
        let store = Arc::new(FakeStore::default());
        let mut unlocker = AccountUnlocker::new(store.clone(), preloaded(&["pw"]));

        let err = unlocker.unlock_accounts("not-an-address").unwrap_err();
        assert!(matches!(err, UnlockError::ResolveAccount(_)));
        assert!(err.to_string().starts_with("Could not list accounts: "));
        assert!(store.calls().is_empty());
    }

    #[test]
    fn test_prompt_failure_is_reported() {
        let store = Arc::new(FakeStore::default().with_file(A, "a", "right"));
        let mut unlocker = AccountUnlocker::new(store, interactive(&[]));

        let err = unlocker.unlock_account(A, 0).unwrap_err();
        assert!(matches!(err, UnlockError::PassphraseRead(_)));
    }

    #[test]
    fn test_ambiguous_address_selects_first_matching_file() {
        let store = Arc::new(
            FakeStore::default()
                .with_file(A, "a-1", "other")
                .with_file(A, "a-2", "pw")
                .with_file(A, "a-3", "pw"),
        );
        let mut unlocker = AccountUnlocker::new(store.clone(), preloaded(&["pw"]));

        let unlocked = unlocker.unlock_account(A, 0).unwrap();
        let resolution = unlocked.resolution.unwrap();
        assert_eq!(resolution.selected.url.path, "a-2");
        assert_eq!(unlocked.account, resolution.selected);

        let duplicates: Vec<&str> = resolution
            .duplicates
            .iter()
            .map(|a| a.url.path.as_str())
            .collect();
        assert_eq!(duplicates, vec!["a-1", "a-3"]);

        // The ambiguous attempt, then a-1 and a-2; a-3 is never tried
        let tried: Vec<String> = store
            .calls()
            .iter()
            .map(|(a, _)| a.url.path.clone())
            .collect();
        assert_eq!(tried, vec!["", "a-1", "a-2"]);
    }

    #[test]
    fn test_ambiguous_address_with_no_matching_file() {
        let store = Arc::new(
            FakeStore::default()
                .with_file(A, "a-1", "x")
                .with_file(A, "a-2", "y"),
        );
        let mut unlocker = AccountUnlocker::new(store.clone(), preloaded(&["pw"]));

        let err = unlocker.unlock_account(A, 0).unwrap_err();
        assert!(matches!(err, UnlockError::NoMatchingKeyFile { .. }));
        assert_eq!(err.to_string(), "None of the listed files could be unlocked.");
        // No retry after the ambiguity was detected
        assert_eq!(store.calls().len(), 3);
    }

    #[test]
    fn test_unlocks_real_key_store() {
        let dir = TempDir::new().unwrap();
        let keystore = KeyStore::open(dir.path(), KdfParams::LIGHT).unwrap();
        let first = keystore.new_account("one").unwrap();
        let second = keystore.new_account("two").unwrap();

        let list = format!("{},{}", first.address, second.address);
        let mut unlocker = AccountUnlocker::new(keystore.clone(), preloaded(&["one", "two"]));
        unlocker.unlock_accounts(&list).unwrap();

        assert!(keystore.is_unlocked(&first.address));
        assert!(keystore.is_unlocked(&second.address));
    }

    #[test]
    fn test_unlock_by_index_in_real_key_store() {
        let dir = TempDir::new().unwrap();
        let keystore = KeyStore::open(dir.path(), KdfParams::LIGHT).unwrap();
        keystore.new_account("pw").unwrap();
        let target = keystore.accounts()[0].clone();

        let mut unlocker = AccountUnlocker::new(keystore.clone(), preloaded(&["pw"]));
        let unlocked = unlocker.unlock_accounts("0").unwrap();
        assert_eq!(unlocked[0].account, target);
        assert!(keystore.is_unlocked(&target.address));
    }
}
