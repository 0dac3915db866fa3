// Copyright (c) 2024 Botho Foundation

//! Errors returned by the key store, wallets and account manager.

use std::io;
use thiserror::Error;

use crate::account::{Account, Address};

/// Errors that can occur while managing local signing credentials.
#[derive(Debug, Error)]
pub enum KeystoreError {
    /// No key file matches the requested account.
    #[error("no key for given address or file")]
    NotFound,

    /// Several key files hold the same address and no url disambiguates them.
    #[error("multiple keys match address ({address})")]
    AmbiguousAddress {
        address: Address,
        matches: Vec<Account>,
    },

    /// The password did not decrypt the key material.
    #[error("could not decrypt key with given password")]
    Decrypt,

    /// A key file for this address already exists.
    #[error("account {0} already exists")]
    AlreadyExists(Address),

    /// The account is not unlocked.
    #[error("account {0} is locked")]
    Locked(Address),

    /// The string is neither a hex address nor an account index.
    #[error("invalid account address or index {0:?}")]
    InvalidAddress(String),

    /// An account index is past the end of the account list.
    #[error("index {index} higher than number of accounts {count}")]
    IndexOutOfRange { index: usize, count: usize },

    /// Operation requires an opened wallet.
    #[error("wallet closed")]
    WalletClosed,

    /// Operation is not supported by this kind of wallet.
    #[error("not supported")]
    NotSupported,

    /// The key or wallet file uses an unknown format version.
    #[error("unsupported key file version: {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },

    /// Key file contents are malformed.
    #[error("invalid key file: {0}")]
    InvalidKeyFile(String),

    /// Mnemonic phrase could not be parsed.
    #[error("invalid mnemonic: {0}")]
    InvalidMnemonic(String),

    /// Derivation path could not be parsed.
    #[error("invalid derivation path: {0}")]
    InvalidDerivationPath(String),

    /// Key derivation or cipher setup failed.
    #[error("crypto error: {0}")]
    Crypto(String),

    /// Chain state lookup failed during self-derivation.
    #[error("chain state unavailable: {0}")]
    ChainState(String),

    /// Filesystem error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// JSON (de)serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl KeystoreError {
    /// True when the error means the password was wrong.
    pub fn is_decrypt(&self) -> bool {
        matches!(self, Self::Decrypt)
    }
}

pub type Result<T> = std::result::Result<T, KeystoreError>;
