// Copyright (c) 2024 Botho Foundation

//! BIP32-style derivation paths.
//!
//! Keys are derived with SLIP-0010 over ed25519, which only defines hardened
//! children; unhardened components are hardened during derivation but keep
//! their written form for display.

use std::fmt;
use std::str::FromStr;

use crate::error::KeystoreError;

/// Offset marking a hardened path component.
pub const HARDENED_OFFSET: u32 = 0x8000_0000;

/// Root path below which self-derivation discovers accounts.
pub const DEFAULT_BASE_DERIVATION_PATH: &str = "m/44'/60'/0'/0";

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct DerivationPath(Vec<u32>);

impl DerivationPath {
    pub fn new(components: Vec<u32>) -> Self {
        Self(components)
    }

    /// The path accounts are self-derived under by default.
    pub fn default_base() -> Self {
        Self(vec![
            HARDENED_OFFSET + 44,
            HARDENED_OFFSET + 60,
            HARDENED_OFFSET,
            0,
        ])
    }

    /// This path extended with one more component.
    pub fn child(&self, index: u32) -> Self {
        let mut components = self.0.clone();
        components.push(index);
        Self(components)
    }

    pub fn components(&self) -> &[u32] {
        &self.0
    }

    /// Components with the hardened bit forced, as SLIP-0010 ed25519 requires.
    pub fn hardened(&self) -> Vec<u32> {
        self.0.iter().map(|c| c | HARDENED_OFFSET).collect()
    }
}

impl FromStr for DerivationPath {
    type Err = KeystoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let mut parts = s.split('/');
        if parts.next() != Some("m") {
            return Err(KeystoreError::InvalidDerivationPath(format!(
                "{}: must start with m/",
                s
            )));
        }

        let mut components = Vec::new();
        for part in parts {
            let part = part.trim();
            let (digits, hardened) = match part.strip_suffix('\'') {
                Some(d) => (d, true),
                None => (part, false),
            };
            let value: u32 = digits.parse().map_err(|_| {
                KeystoreError::InvalidDerivationPath(format!("{}: bad component {:?}", s, part))
            })?;
            if value >= HARDENED_OFFSET {
                return Err(KeystoreError::InvalidDerivationPath(format!(
                    "{}: component {} out of range",
                    s, part
                )));
            }
            components.push(if hardened { value + HARDENED_OFFSET } else { value });
        }

        if components.is_empty() {
            return Err(KeystoreError::InvalidDerivationPath(format!(
                "{}: empty path",
                s
            )));
        }
        Ok(Self(components))
    }
}

impl fmt::Display for DerivationPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m")?;
        for c in &self.0 {
            if *c >= HARDENED_OFFSET {
                write!(f, "/{}'", c - HARDENED_OFFSET)?;
            } else {
                write!(f, "/{}", c)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_base_matches_constant() {
        let parsed: DerivationPath = DEFAULT_BASE_DERIVATION_PATH.parse().unwrap();
        assert_eq!(parsed, DerivationPath::default_base());
        assert_eq!(parsed.to_string(), DEFAULT_BASE_DERIVATION_PATH);
    }

    #[test]
    fn test_child_and_hardening() {
        let path = DerivationPath::default_base().child(5);
        assert_eq!(path.to_string(), "m/44'/60'/0'/0/5");
        assert!(path.hardened().iter().all(|c| *c >= HARDENED_OFFSET));
    }

    #[test]
    fn test_parse_errors() {
        assert!("44'/60'".parse::<DerivationPath>().is_err());
        assert!("m".parse::<DerivationPath>().is_err());
        assert!("m/x".parse::<DerivationPath>().is_err());
        assert!("m/2147483648".parse::<DerivationPath>().is_err());
    }
}
