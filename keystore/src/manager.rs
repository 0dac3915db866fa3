// Copyright (c) 2024 Botho Foundation

//! Aggregation of wallet backends and delivery of hot-plug events.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::hd::HdWalletDir;
use crate::keystore::KeyStore;
use crate::wallet::{Backend, SharedWallet, WalletEvent};

/// Merges the key store and optional HD wallet directory into one sorted
/// wallet list, and forwards their changes to subscribers.
pub struct AccountManager {
    keystore: Arc<KeyStore>,
    backends: Vec<Arc<dyn Backend>>,
    subscribers: Mutex<Vec<mpsc::Sender<WalletEvent>>>,
    /// Serialises refreshes so events reach subscribers in scan order
    refresh_lock: tokio::sync::Mutex<()>,
}

impl AccountManager {
    pub fn new(keystore: Arc<KeyStore>, hd_wallets: Option<Arc<HdWalletDir>>) -> Self {
        let mut backends: Vec<Arc<dyn Backend>> = vec![keystore.clone()];
        if let Some(hd) = hd_wallets {
            backends.push(hd);
        }
        Self {
            keystore,
            backends,
            subscribers: Mutex::new(Vec::new()),
            refresh_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// The key-file backend, used for unlocking and signing.
    pub fn keystore(&self) -> &Arc<KeyStore> {
        &self.keystore
    }

    /// Every wallet from every backend, sorted by url.
    pub fn wallets(&self) -> Vec<SharedWallet> {
        let mut wallets: Vec<SharedWallet> =
            self.backends.iter().flat_map(|b| b.wallets()).collect();
        wallets.sort_by_key(|w| w.url());
        wallets
    }

    /// Deliver future wallet events to `sender`.
    ///
    /// Events are sent in the order backends report them. A full channel
    /// applies backpressure to the refresher; a closed one is dropped.
    pub fn subscribe(&self, sender: mpsc::Sender<WalletEvent>) {
        self.subscribers.lock().push(sender);
    }

    /// Rescan all backends and forward what changed. Returns the number of
    /// events produced.
    pub async fn refresh(&self) -> usize {
        let _guard = self.refresh_lock.lock().await;

        let mut events = Vec::new();
        for backend in &self.backends {
            match backend.refresh() {
                Ok(mut e) => events.append(&mut e),
                Err(e) => warn!("Failed to refresh wallet backend: {}", e),
            }
        }
        if events.is_empty() {
            return 0;
        }

        let subscribers: Vec<mpsc::Sender<WalletEvent>> = self.subscribers.lock().clone();
        let mut closed = Vec::new();
        for event in &events {
            for (i, tx) in subscribers.iter().enumerate() {
                if closed.contains(&i) {
                    continue;
                }
                if tx.send(event.clone()).await.is_err() {
                    debug!("Wallet event subscriber went away");
                    closed.push(i);
                }
            }
        }
        if !closed.is_empty() {
            self.subscribers.lock().retain(|tx| !tx.is_closed());
        }
        events.len()
    }

    /// Poll the backends every `interval` until `shutdown` fires.
    pub fn spawn_refresh(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        manager.refresh().await;
                    }
                }
            }
            debug!("Wallet refresher stopped");
        })
    }
}
