// Copyright (c) 2024 Botho Foundation

//! Wallet abstraction and hot-plug events.
//!
//! A wallet is one unit of key material that can appear and disappear at
//! runtime: a single key file, or an HD wallet file that derives many
//! accounts. Backends own sets of wallets and report changes to the
//! [`AccountManager`](crate::AccountManager) as [`WalletEvent`]s.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

use crate::account::{Account, Address, KeyUrl};
use crate::derivation::DerivationPath;
use crate::error::Result;

/// Read access to on-chain account state, used to decide how far to
/// self-derive.
#[async_trait]
pub trait ChainStateReader: Send + Sync {
    /// Balance of `address` at the latest committed height.
    async fn balance_at(&self, address: &Address) -> Result<u128>;

    /// Number of transactions sent from `address` at the latest committed height.
    async fn nonce_at(&self, address: &Address) -> Result<u64>;
}

/// A source of accounts that can be opened, closed and (optionally) derived.
#[async_trait]
pub trait Wallet: Send + Sync + fmt::Debug {
    /// Location of the wallet's key material.
    fn url(&self) -> KeyUrl;

    /// Human readable status, for logs.
    fn status(&self) -> String;

    /// Open the wallet. Wallets that need no passphrase ignore it.
    fn open(&self, passphrase: &str) -> Result<()>;

    /// Release any decrypted material held by the wallet.
    fn close(&self) -> Result<()>;

    /// Accounts currently known to the wallet.
    fn accounts(&self) -> Vec<Account>;

    fn contains(&self, account: &Account) -> bool {
        self.accounts().iter().any(|a| {
            a.address == account.address && (account.url.is_empty() || a.url == account.url)
        })
    }

    /// Derive new accounts below `base` for as long as `chain` shows them in
    /// use. Returns the accounts added by this call.
    async fn self_derive(
        &self,
        base: &DerivationPath,
        chain: &dyn ChainStateReader,
    ) -> Result<Vec<Account>>;
}

/// Shared handle to a wallet.
pub type SharedWallet = Arc<dyn Wallet>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WalletEventKind {
    Arrived,
    Dropped,
}

/// A wallet appearing or disappearing.
#[derive(Clone, Debug)]
pub struct WalletEvent {
    pub wallet: SharedWallet,
    pub kind: WalletEventKind,
}

impl WalletEvent {
    pub fn arrived(wallet: SharedWallet) -> Self {
        Self {
            wallet,
            kind: WalletEventKind::Arrived,
        }
    }

    pub fn dropped(wallet: SharedWallet) -> Self {
        Self {
            wallet,
            kind: WalletEventKind::Dropped,
        }
    }

    pub fn is_arrival(&self) -> bool {
        self.kind == WalletEventKind::Arrived
    }
}

/// A set of wallets that can change over time.
pub trait Backend: Send + Sync {
    /// Current wallets, sorted by url.
    fn wallets(&self) -> Vec<SharedWallet>;

    /// Rescan the underlying storage and report what changed since the last
    /// scan.
    fn refresh(&self) -> Result<Vec<WalletEvent>>;
}

/// Compute the events turning `old` into `new`. Both must be sorted by url.
///
/// Events come out in url order; a wallet present in both sets produces
/// nothing.
pub(crate) fn diff_wallets(old: &[SharedWallet], new: &[SharedWallet]) -> Vec<WalletEvent> {
    let mut events = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < old.len() || j < new.len() {
        match (old.get(i), new.get(j)) {
            (Some(o), Some(n)) => match o.url().cmp(&n.url()) {
                std::cmp::Ordering::Less => {
                    events.push(WalletEvent::dropped(o.clone()));
                    i += 1;
                }
                std::cmp::Ordering::Greater => {
                    events.push(WalletEvent::arrived(n.clone()));
                    j += 1;
                }
                std::cmp::Ordering::Equal => {
                    i += 1;
                    j += 1;
                }
            },
            (Some(o), None) => {
                events.push(WalletEvent::dropped(o.clone()));
                i += 1;
            }
            (None, Some(n)) => {
                events.push(WalletEvent::arrived(n.clone()));
                j += 1;
            }
            (None, None) => break,
        }
    }
    events
}
