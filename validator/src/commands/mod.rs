// Copyright (c) 2024 Botho Foundation

//! CLI command implementations.
//!
//! These modules implement the user-facing CLI commands and legitimately
//! use stdout for output.

#![allow(clippy::print_stdout)]

pub mod account;
pub mod init;
pub mod run;

use anyhow::{anyhow, Context, Result};
use bth_keystore::Address;

/// Print a success message
pub fn print_success(message: &str) {
    println!("\x1b[32m{}\x1b[0m", message);
}

/// Print a warning message
pub fn print_warning(message: &str) {
    println!("\x1b[33mWarning:\x1b[0m {}", message);
}

/// Parse an `address=amount` genesis allocation.
pub fn parse_alloc(entry: &str) -> Result<(Address, u128)> {
    let (address, amount) = entry
        .split_once('=')
        .ok_or_else(|| anyhow!("Allocation {:?} must be address=amount", entry))?;
    let address: Address = address
        .trim()
        .parse()
        .with_context(|| format!("Invalid allocation address {:?}", address))?;
    let amount: u128 = amount
        .trim()
        .parse()
        .with_context(|| format!("Invalid allocation amount {:?}", amount))?;
    Ok((address, amount))
}
