// Copyright (c) 2024 Botho Foundation

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use bth_validator::commands::{self, run::RunOptions};
use bth_validator::services::StartupError;
use bth_validator::{config, telemetry};

#[derive(Parser)]
#[command(name = "bth-validator")]
#[command(about = "Botho validator node", long_about = None)]
struct Cli {
    /// Path to config file (default: ~/.bth-validator/config.toml)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the config, validator key and genesis file
    Init {
        /// Chain identifier written to genesis
        #[arg(long, default_value = "bth-local")]
        chain_id: String,

        /// Genesis balance as address=amount (repeatable)
        #[arg(long = "alloc")]
        allocs: Vec<String>,

        /// Cheap key derivation for new key files (development only)
        #[arg(long)]
        light_kdf: bool,
    },

    /// Run the validator
    Run {
        /// Comma separated accounts to unlock (addresses or indexes)
        #[arg(long)]
        unlock: Option<String>,

        /// Password file, one password per line
        #[arg(long = "password")]
        password_file: Option<PathBuf>,

        /// Application server listen address
        #[arg(long)]
        abci_addr: Option<String>,

        /// Application server protocol
        #[arg(long)]
        abci_protocol: Option<String>,
    },

    /// Manage signing accounts
    Account {
        #[command(subcommand)]
        command: AccountCommands,
    },
}

#[derive(Subcommand)]
enum AccountCommands {
    /// Create a new account
    New {
        /// Read the passphrase from the first line of this file
        #[arg(long = "password")]
        password_file: Option<PathBuf>,
    },

    /// List accounts
    List,

    /// Import a hex-encoded secret key
    Import {
        /// File holding the secret key
        key_file: PathBuf,

        /// Read the passphrase from the first line of this file
        #[arg(long = "password")]
        password_file: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    telemetry::init_tracing(cli.verbose)?;

    let config_path = cli
        .config
        .map(PathBuf::from)
        .unwrap_or_else(config::default_config_path);

    match cli.command {
        Commands::Init {
            chain_id,
            allocs,
            light_kdf,
        } => commands::init::run(&config_path, &chain_id, &allocs, light_kdf).map(|_| ()),
        Commands::Run {
            unlock,
            password_file,
            abci_addr,
            abci_protocol,
        } => {
            let options = RunOptions {
                unlock,
                password_file,
                abci_addr,
                abci_protocol,
            };
            match commands::run::run(&config_path, &options) {
                Err(e) => match e.downcast_ref::<StartupError>() {
                    Some(StartupError::Fatal(message)) => {
                        eprintln!("Fatal: {}", message);
                        std::process::exit(1);
                    }
                    Some(StartupError::Exit(message)) => {
                        eprintln!("{}", message);
                        std::process::exit(1);
                    }
                    _ => Err(e),
                },
                Ok(()) => Ok(()),
            }
        }
        Commands::Account { command } => match command {
            AccountCommands::New { password_file } => {
                commands::account::new(&config_path, password_file.as_deref()).map(|_| ())
            }
            AccountCommands::List => commands::account::list(&config_path).map(|_| ()),
            AccountCommands::Import {
                key_file,
                password_file,
            } => commands::account::import(&config_path, &key_file, password_file.as_deref())
                .map(|_| ()),
        },
    }
}
