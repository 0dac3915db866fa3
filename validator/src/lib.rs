// Copyright (c) 2024 Botho Foundation

//! Botho validator node library.
//!
//! Boots a validator made of an execution node and a consensus engine joined
//! through an application bridge, and unlocks the operator's signing
//! accounts on the way up.

#![deny(clippy::print_stdout)]

pub mod abci;
pub mod app;
pub mod config;
pub mod consensus;
pub mod execution;
pub mod passwords;
pub mod services;
pub mod telemetry;
pub mod unlock;
pub mod wallet_watcher;

// Re-export commands module for CLI binary
pub mod commands;
