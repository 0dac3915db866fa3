// Copyright (c) 2024 Botho Foundation

//! Account identifiers and key material locators.

use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use crate::error::KeystoreError;

/// Length of an account address in bytes.
pub const ADDRESS_LENGTH: usize = 20;

/// A 20-byte account address.
///
/// Addresses are derived from an ed25519 verifying key as the trailing 20
/// bytes of its SHA-256 digest and are rendered as `0x`-prefixed lowercase
/// hex.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address([u8; ADDRESS_LENGTH]);

impl Address {
    pub const fn new(bytes: [u8; ADDRESS_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Derive the address owned by a verifying key.
    pub fn from_verifying_key(key: &VerifyingKey) -> Self {
        let digest = Sha256::digest(key.as_bytes());
        let mut bytes = [0u8; ADDRESS_LENGTH];
        bytes.copy_from_slice(&digest[digest.len() - ADDRESS_LENGTH..]);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; ADDRESS_LENGTH] {
        &self.0
    }

    /// Hex without the `0x` prefix, as used in key file names.
    pub fn to_plain_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Check whether a string looks like a hex address.
    pub fn is_hex_address(s: &str) -> bool {
        let digits = strip_hex_prefix(s);
        digits.len() == ADDRESS_LENGTH * 2 && digits.chars().all(|c| c.is_ascii_hexdigit())
    }
}

fn strip_hex_prefix(s: &str) -> &str {
    s.strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s)
}

impl FromStr for Address {
    type Err = KeystoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if !Self::is_hex_address(s) {
            return Err(KeystoreError::InvalidAddress(s.to_string()));
        }
        let mut bytes = [0u8; ADDRESS_LENGTH];
        hex::decode_to_slice(strip_hex_prefix(s), &mut bytes)
            .map_err(|_| KeystoreError::InvalidAddress(s.to_string()))?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self)
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Locator of the key material backing an account or wallet.
///
/// Rendered as `scheme://path`. Ordering is by scheme, then path, which gives
/// the stable wallet order reported by the account manager.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KeyUrl {
    pub scheme: String,
    pub path: String,
}

impl KeyUrl {
    pub fn new(scheme: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            path: path.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.scheme.is_empty() && self.path.is_empty()
    }
}

impl fmt::Display for KeyUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.scheme.is_empty() {
            write!(f, "{}", self.path)
        } else {
            write!(f, "{}://{}", self.scheme, self.path)
        }
    }
}

/// A signing credential: an address plus the location of its key material.
///
/// An empty url means "whichever key file holds this address".
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Account {
    pub address: Address,
    pub url: KeyUrl,
}

impl Account {
    pub fn new(address: Address, url: KeyUrl) -> Self {
        Self { address, url }
    }

    /// An account that matches any key file holding `address`.
    pub fn from_address(address: Address) -> Self {
        Self {
            address,
            url: KeyUrl::default(),
        }
    }
}
