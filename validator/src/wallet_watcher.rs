// Copyright (c) 2024 Botho Foundation

//! Opens wallets as they appear and self-derives their accounts.

use bth_keystore::{
    AccountManager, ChainStateReader, DerivationPath, SharedWallet, WalletEvent, WalletEventKind,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Capacity of the wallet event channel.
pub const WALLET_EVENT_BUFFER: usize = 16;

/// Processes wallet arrivals and departures one at a time, in the order the
/// account manager reports them.
pub struct WalletWatcher {
    wallets: Vec<SharedWallet>,
    events: mpsc::Receiver<WalletEvent>,
    chain: Arc<dyn ChainStateReader>,
    base: DerivationPath,
    shutdown: CancellationToken,
}

impl WalletWatcher {
    /// `wallets` are the wallets already present; `events` reports later
    /// changes.
    pub fn new(
        wallets: Vec<SharedWallet>,
        events: mpsc::Receiver<WalletEvent>,
        chain: Arc<dyn ChainStateReader>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            wallets,
            events,
            chain,
            base: DerivationPath::default_base(),
            shutdown,
        }
    }

    /// Subscribe to `manager` and take a snapshot of its current wallets.
    pub fn subscribe(
        manager: &AccountManager,
        chain: Arc<dyn ChainStateReader>,
        shutdown: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::channel(WALLET_EVENT_BUFFER);
        manager.subscribe(tx);
        Self::new(manager.wallets(), rx, chain, shutdown)
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Run until the shutdown token fires or the event channel closes.
    pub async fn run(mut self) {
        for wallet in std::mem::take(&mut self.wallets) {
            if self.shutdown.is_cancelled() {
                return;
            }
            if let Err(e) = wallet.open("") {
                warn!(url = %wallet.url(), error = %e, "Failed to open wallet");
                continue;
            }
            self.derive(&wallet).await;
        }

        loop {
            let event = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                event = self.events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            self.handle(event).await;
        }
        debug!("Wallet watcher stopped");
    }

    async fn handle(&self, event: WalletEvent) {
        let wallet = event.wallet;
        match event.kind {
            WalletEventKind::Arrived => match wallet.open("") {
                Ok(()) => {
                    info!(url = %wallet.url(), status = %wallet.status(), "New wallet appeared");
                    self.derive(&wallet).await;
                }
                Err(e) => {
                    warn!(url = %wallet.url(), error = %e, "New wallet appeared, failed to open");
                }
            },
            WalletEventKind::Dropped => {
                info!(url = %wallet.url(), "Old wallet dropped");
                if let Err(e) = wallet.close() {
                    debug!(url = %wallet.url(), error = %e, "Failed to close dropped wallet");
                }
            }
        }
    }

    async fn derive(&self, wallet: &SharedWallet) {
        let derived = tokio::select! {
            _ = self.shutdown.cancelled() => return,
            derived = wallet.self_derive(&self.base, self.chain.as_ref()) => derived,
        };
        match derived {
            Ok(accounts) if accounts.is_empty() => {}
            Ok(accounts) => {
                info!(url = %wallet.url(), count = accounts.len(), "Self-derived accounts");
            }
            Err(e) => warn!(url = %wallet.url(), error = %e, "Account self-derivation failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bth_keystore::{
        Account, Address, KdfParams, KeyStore, KeyUrl, KeystoreError, Wallet,
    };
    use parking_lot::Mutex;
    use tempfile::TempDir;

    type Log = Arc<Mutex<Vec<String>>>;

    #[derive(Debug)]
    struct RecordingWallet {
        name: &'static str,
        fail_open: bool,
        fail_derive: bool,
        log: Log,
    }

    impl RecordingWallet {
        fn shared(name: &'static str, log: &Log) -> SharedWallet {
            Arc::new(Self {
                name,
                fail_open: false,
                fail_derive: false,
                log: log.clone(),
            })
        }

        fn locked(name: &'static str, log: &Log) -> SharedWallet {
            Arc::new(Self {
                name,
                fail_open: true,
                fail_derive: false,
                log: log.clone(),
            })
        }

        fn faulty(name: &'static str, log: &Log) -> SharedWallet {
            Arc::new(Self {
                name,
                fail_open: false,
                fail_derive: true,
                log: log.clone(),
            })
        }
    }

    #[async_trait]
    impl Wallet for RecordingWallet {
        fn url(&self) -> KeyUrl {
            KeyUrl::new("test", self.name)
        }

        fn status(&self) -> String {
            "Open".to_string()
        }

        fn open(&self, passphrase: &str) -> bth_keystore::Result<()> {
            assert_eq!(passphrase, "");
            self.log.lock().push(format!("open {}", self.name));
            if self.fail_open {
                return Err(KeystoreError::Decrypt);
            }
            Ok(())
        }

        fn close(&self) -> bth_keystore::Result<()> {
            self.log.lock().push(format!("close {}", self.name));
            Ok(())
        }

        fn accounts(&self) -> Vec<Account> {
            Vec::new()
        }

        async fn self_derive(
            &self,
            base: &DerivationPath,
            _chain: &dyn ChainStateReader,
        ) -> bth_keystore::Result<Vec<Account>> {
            assert_eq!(base.to_string(), "m/44'/60'/0'/0");
            self.log.lock().push(format!("derive {}", self.name));
            if self.fail_derive {
                return Err(KeystoreError::ChainState("unreachable".to_string()));
            }
            Ok(Vec::new())
        }
    }

    struct EmptyChain;

    #[async_trait]
    impl ChainStateReader for EmptyChain {
        async fn balance_at(&self, _address: &Address) -> bth_keystore::Result<u128> {
            Ok(0)
        }

        async fn nonce_at(&self, _address: &Address) -> bth_keystore::Result<u64> {
            Ok(0)
        }
    }

    fn entries(log: &Log) -> Vec<String> {
        log.lock().clone()
    }

    #[tokio::test]
    async fn test_initial_wallets_opened_and_derived() {
        let log: Log = Arc::default();
        let (tx, rx) = mpsc::channel(WALLET_EVENT_BUFFER);
        drop(tx);

        let wallets = vec![
            RecordingWallet::shared("a", &log),
            RecordingWallet::locked("b", &log),
            RecordingWallet::shared("c", &log),
        ];
        WalletWatcher::new(wallets, rx, Arc::new(EmptyChain), CancellationToken::new())
            .run()
            .await;

        assert_eq!(
            entries(&log),
            vec!["open a", "derive a", "open b", "open c", "derive c"]
        );
    }

    #[tokio::test]
    async fn test_events_processed_in_order() {
        let log: Log = Arc::default();
        let (tx, rx) = mpsc::channel(WALLET_EVENT_BUFFER);

        tx.send(WalletEvent::arrived(RecordingWallet::shared("x", &log)))
            .await
            .unwrap();
        tx.send(WalletEvent::dropped(RecordingWallet::shared("y", &log)))
            .await
            .unwrap();
        tx.send(WalletEvent::arrived(RecordingWallet::locked("z", &log)))
            .await
            .unwrap();
        tx.send(WalletEvent::arrived(RecordingWallet::shared("w", &log)))
            .await
            .unwrap();
        drop(tx);

        WalletWatcher::new(Vec::new(), rx, Arc::new(EmptyChain), CancellationToken::new())
            .run()
            .await;

        assert_eq!(
            entries(&log),
            vec!["open x", "derive x", "close y", "open z", "open w", "derive w"]
        );
    }

    #[tokio::test]
    async fn test_derivation_failure_does_not_stop_loop() {
        let log: Log = Arc::default();
        let (tx, rx) = mpsc::channel(WALLET_EVENT_BUFFER);
        tx.send(WalletEvent::arrived(RecordingWallet::faulty("bad", &log)))
            .await
            .unwrap();
        tx.send(WalletEvent::arrived(RecordingWallet::shared("good", &log)))
            .await
            .unwrap();
        drop(tx);

        WalletWatcher::new(Vec::new(), rx, Arc::new(EmptyChain), CancellationToken::new())
            .run()
            .await;

        assert_eq!(
            entries(&log),
            vec!["open bad", "derive bad", "open good", "derive good"]
        );
    }

    #[tokio::test]
    async fn test_cancellation_stops_watcher() {
        let (_tx, rx) = mpsc::channel(WALLET_EVENT_BUFFER);
        let token = CancellationToken::new();
        let handle =
            WalletWatcher::new(Vec::new(), rx, Arc::new(EmptyChain), token.clone()).spawn();

        token.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .expect("watcher did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn test_subscribe_receives_manager_events() {
        let dir = TempDir::new().unwrap();
        let keystore = KeyStore::open(dir.path().join("keys"), KdfParams::LIGHT).unwrap();
        keystore.new_account("pw").unwrap();
        let manager = Arc::new(AccountManager::new(keystore.clone(), None));
        manager.refresh().await;

        let token = CancellationToken::new();
        let watcher = WalletWatcher::subscribe(&manager, Arc::new(EmptyChain), token.clone());
        assert_eq!(watcher.wallets.len(), 1);
        let handle = watcher.spawn();

        keystore.new_account("pw").unwrap();
        assert_eq!(manager.refresh().await, 1);

        token.cancel();
        handle.await.unwrap();
    }
}
