// Copyright (c) 2024 Botho Foundation

//! Validator startup.
//!
//! [`start_services`] brings the node up in a fixed order: the execution
//! node, its backend service, account unlocking and the wallet watcher, the
//! in-process client, the application bridge, the application server and
//! finally the consensus node. Each stage either succeeds or stops startup
//! with a [`StartupError`] saying how the process should exit.

use anyhow::Context;
use bth_keystore::CredentialStore;
use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::abci::{AbciServer, ApplicationServer};
use crate::app::{Application, ExecutionApp};
use crate::config::Config;
use crate::consensus::{
    default_db_provider, default_genesis_provider, ClientCreator, ConsensusEngine, ConsensusError,
    ConsensusNode, DbProvider, GenesisDoc, GenesisProvider, ValidatorKey,
};
use crate::execution::{ExecutionBackend, ExecutionNode, LocalExecutionNode, StateClient};
use crate::passwords::PasswordSource;
use crate::unlock::{AccountUnlocker, UnlockedAccount};
use crate::wallet_watcher::WalletWatcher;

/// Why startup stopped.
#[derive(Debug, Error)]
pub enum StartupError {
    /// Unrecoverable; reported as `Fatal: <message>`
    #[error("{0}")]
    Fatal(String),

    /// Reported as the bare message
    #[error("{0}")]
    Exit(String),

    /// The consensus node could not be built or started. Everything started
    /// before it is still running and handed back in `services`.
    #[error("{source}")]
    Consensus {
        source: ConsensusError,
        services: Box<Services>,
    },
}

fn fatal(message: impl std::fmt::Display) -> StartupError {
    StartupError::Fatal(message.to_string())
}

fn exit(message: impl std::fmt::Display) -> StartupError {
    StartupError::Exit(message.to_string())
}

/// Builds the pieces [`start_services`] wires together.
pub trait NodeComponents: Send + Sync {
    fn execution_node(&self, config: &Config) -> anyhow::Result<Arc<dyn ExecutionNode>>;

    fn password_source(&self, config: &Config) -> io::Result<PasswordSource>;

    fn genesis_provider(&self, config: &Config) -> GenesisProvider {
        default_genesis_provider(&config.consensus)
    }

    fn db_provider(&self) -> DbProvider {
        default_db_provider
    }
}

/// Everything in this process, configured from files on disk.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalComponents;

impl NodeComponents for LocalComponents {
    fn execution_node(&self, config: &Config) -> anyhow::Result<Arc<dyn ExecutionNode>> {
        let genesis_file = &config.consensus.genesis_file;
        let alloc = if genesis_file.exists() {
            GenesisDoc::load(genesis_file)?.alloc().clone()
        } else {
            warn!(path = %genesis_file.display(), "No genesis file, execution state starts empty");
            BTreeMap::new()
        };
        let node = LocalExecutionNode::new(&config.execution, alloc)
            .context("Failed to open the execution node")?;
        Ok(Arc::new(node))
    }

    fn password_source(&self, config: &Config) -> io::Result<PasswordSource> {
        PasswordSource::from_file(config.accounts.password_file.as_deref())
    }
}

/// Handles to the running node.
pub struct Services {
    pub execution: Arc<dyn ExecutionNode>,
    pub backend: Arc<ExecutionBackend>,
    /// Accounts unlocked at startup
    pub unlocked: Vec<UnlockedAccount>,
    /// Application bridge, which owns the attached in-process client
    pub app: Arc<ExecutionApp>,
    pub app_server: Arc<AbciServer>,
    pub consensus: Option<Arc<ConsensusNode>>,
    watcher: JoinHandle<()>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services")
            .field("height", &self.backend.height())
            .field("unlocked", &self.unlocked.len())
            .field("app_server", &self.app_server.local_addr())
            .field("consensus", &self.consensus.is_some())
            .finish_non_exhaustive()
    }
}

impl Services {
    /// Stop everything in reverse start order.
    pub async fn stop(self) {
        self.shutdown.cancel();
        if let Some(consensus) = &self.consensus {
            consensus.stop().await;
        }
        self.app_server.stop().await;
        if let Err(e) = self.watcher.await {
            debug!("Wallet watcher ended abnormally: {}", e);
        }
        if let Err(e) = self.execution.stop().await {
            warn!("Failed to stop execution node: {}", e);
        }
        info!("Validator stopped");
    }
}

/// Start every service in order.
pub async fn start_services(
    config: &Config,
    components: &dyn NodeComponents,
) -> Result<Services, StartupError> {
    let shutdown = CancellationToken::new();

    // Execution node
    let execution = components
        .execution_node(config)
        .map_err(|e| fatal(format!("{:#}", e)))?;
    execution.start().await.map_err(fatal)?;

    let backend = execution
        .backend()
        .map_err(|e| fatal(format!("execution backend service not running: {}", e)))?;

    // Accounts
    let manager = execution.account_manager();
    let passwords = components
        .password_source(config)
        .map_err(|e| fatal(format!("Failed to read password file: {}", e)))?;
    let store: Arc<dyn CredentialStore> = manager.keystore().clone();
    let unlock_list = config.accounts.unlock.clone();
    let unlocked = tokio::task::spawn_blocking(move || {
        AccountUnlocker::new(store, passwords).unlock_accounts(&unlock_list)
    })
    .await
    .map_err(|e| fatal(format!("Account unlocking aborted: {}", e)))?
    .map_err(fatal)?;

    let watcher_client = execution
        .attach()
        .await
        .map_err(|e| fatal(format!("Failed to attach to self: {}", e)))?;
    let watcher = WalletWatcher::subscribe(
        &manager,
        Arc::new(StateClient::new(watcher_client)),
        shutdown.child_token(),
    )
    .spawn();

    // Application bridge
    let client = execution.attach().await.map_err(|e| {
        fatal(format!(
            "Failed to attach to the in-process execution node: {}",
            e
        ))
    })?;
    let app = Arc::new(
        ExecutionApp::new(backend.clone(), client, None)
            .await
            .map_err(exit)?,
    );

    let app_server = Arc::new(
        AbciServer::new(&config.abci.address, &config.abci.protocol, app.clone())
            .map_err(exit)?,
    );
    app_server.start().await.map_err(exit)?;

    let mut services = Services {
        execution,
        backend,
        unlocked,
        app,
        app_server,
        consensus: None,
        watcher,
        shutdown,
    };

    // Consensus
    match start_consensus(config, components, services.app.clone()).await {
        Ok(consensus) => {
            services.consensus = Some(consensus);
            info!(
                height = services.backend.height(),
                unlocked = services.unlocked.len(),
                "Validator started"
            );
            Ok(services)
        }
        Err(source) => Err(StartupError::Consensus {
            source,
            services: Box::new(services),
        }),
    }
}

async fn start_consensus(
    config: &Config,
    components: &dyn NodeComponents,
    app: Arc<ExecutionApp>,
) -> Result<Arc<ConsensusNode>, ConsensusError> {
    let key = ValidatorKey::load_or_generate(&config.consensus.priv_validator_key_file)?;
    let app: Arc<dyn Application> = app;
    let creator = ClientCreator::new(Some(app), &config.consensus);
    let node = ConsensusNode::new(
        &config.consensus,
        key,
        creator,
        components.genesis_provider(config),
        components.db_provider(),
    )
    .await?;
    node.start().await?;
    Ok(Arc::new(node))
}
