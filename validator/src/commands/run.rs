// Copyright (c) 2024 Botho Foundation

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::abci::ApplicationServer;
use crate::config::Config;
use crate::consensus::ConsensusEngine;
use crate::services::{start_services, LocalComponents, StartupError};

/// Command line overrides for `run`.
#[derive(Debug, Default, Clone)]
pub struct RunOptions {
    pub unlock: Option<String>,
    pub password_file: Option<PathBuf>,
    pub abci_addr: Option<String>,
    pub abci_protocol: Option<String>,
}

impl RunOptions {
    pub fn apply(&self, config: &mut Config) {
        if let Some(unlock) = &self.unlock {
            config.accounts.unlock = unlock.clone();
        }
        if let Some(file) = &self.password_file {
            config.accounts.password_file = Some(file.clone());
        }
        if let Some(address) = &self.abci_addr {
            config.abci.address = address.clone();
        }
        if let Some(protocol) = &self.abci_protocol {
            config.abci.protocol = protocol.clone();
        }
    }
}

/// Run the validator until Ctrl+C.
///
/// Fatal and exit startup failures come back as a [`StartupError`] inside
/// the returned error so the binary can pick the exit style.
pub fn run(config_path: &Path, options: &RunOptions) -> Result<()> {
    let mut config =
        Config::load(config_path).context("No config found. Run 'bth-validator init' first.")?;
    options.apply(&mut config);

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run_async(config))
}

async fn run_async(config: Config) -> Result<()> {
    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    ctrlc::set_handler(move || signal.cancel())?;

    let services = match start_services(&config, &LocalComponents).await {
        Ok(services) => services,
        Err(StartupError::Consensus { source, services }) => {
            services.stop().await;
            return Err(source).context("Failed to start consensus node");
        }
        Err(e) => return Err(e.into()),
    };

    for unlocked in &services.unlocked {
        if let Some(resolution) = &unlocked.resolution {
            for duplicate in &resolution.duplicates {
                super::print_warning(&format!(
                    "Duplicate key file for {}: {}",
                    unlocked.account.address, duplicate.url
                ));
            }
        }
    }

    println!("Validator running. Press Ctrl+C to stop.");
    if let Some(addr) = services.app_server.local_addr() {
        println!("Application server: tcp://{}", addr);
    }

    shutdown.cancelled().await;
    info!(
        height = services.consensus.as_ref().map_or(0, |c| c.height()),
        "Shutting down"
    );
    services.stop().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_override_config() {
        let mut config = Config::with_home(Path::new("/var/lib/bth"));
        let untouched = config.clone();
        RunOptions::default().apply(&mut config);
        assert_eq!(config, untouched);

        let options = RunOptions {
            unlock: Some("0,1".to_string()),
            password_file: Some(PathBuf::from("/etc/bth/passwords")),
            abci_addr: Some("tcp://0.0.0.0:26658".to_string()),
            abci_protocol: Some("grpc".to_string()),
        };
        options.apply(&mut config);
        assert_eq!(config.accounts.unlock, "0,1");
        assert_eq!(
            config.accounts.password_file.as_deref(),
            Some(Path::new("/etc/bth/passwords"))
        );
        assert_eq!(config.abci.address, "tcp://0.0.0.0:26658");
        assert_eq!(config.abci.protocol, "grpc");
    }
}
