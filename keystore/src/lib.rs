// Copyright (c) 2024 Botho Foundation

//! Local signing credentials for the Botho validator.
//!
//! This crate provides:
//! - [`KeyStore`]: a directory of encrypted ed25519 key files with
//!   unlock/lock/sign, and ambiguity detection when several files hold the
//!   same address
//! - [`HdWalletDir`]: encrypted BIP39 mnemonics that self-derive accounts
//!   against chain state
//! - [`AccountManager`]: one sorted view over both, with hot-plug
//!   [`WalletEvent`]s delivered to subscribers in order

#![deny(clippy::print_stdout)]

mod account;
mod cipher;
mod derivation;
mod error;
mod hd;
mod key_file;
mod keystore;
mod manager;
mod wallet;

pub use account::{Account, Address, KeyUrl, ADDRESS_LENGTH};
pub use cipher::KdfParams;
pub use derivation::{DerivationPath, DEFAULT_BASE_DERIVATION_PATH, HARDENED_OFFSET};
pub use error::{KeystoreError, Result};
pub use hd::{
    derive_account_key, generate_mnemonic, HdWallet, HdWalletDir, HD_SCHEME,
    HD_WALLET_EXTENSION, MAX_SELF_DERIVED,
};
pub use key_file::KeyFile;
pub use keystore::{CredentialStore, KeyStore, KeystoreWallet, KEYSTORE_SCHEME};
pub use manager::AccountManager;
pub use wallet::{
    Backend, ChainStateReader, SharedWallet, Wallet, WalletEvent, WalletEventKind,
};
