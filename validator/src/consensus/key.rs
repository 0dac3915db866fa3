// Copyright (c) 2024 Botho Foundation

//! The validator's block signing key.

use bth_keystore::Address;
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::info;
use zeroize::{Zeroize, Zeroizing};

use super::ConsensusError;

#[derive(Serialize, Deserialize)]
struct KeyJson {
    address: Address,
    #[serde(with = "hex::serde")]
    pub_key: [u8; 32],
    priv_key: String,
}

impl Drop for KeyJson {
    fn drop(&mut self) {
        self.priv_key.zeroize();
    }
}

/// Plaintext ed25519 key used to sign block headers.
pub struct ValidatorKey {
    signing: SigningKey,
    address: Address,
}

impl std::fmt::Debug for ValidatorKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValidatorKey")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

impl ValidatorKey {
    pub fn generate() -> Self {
        let mut secret = Zeroizing::new([0u8; 32]);
        rand::thread_rng().fill(&mut secret[..]);
        Self::from_signing_key(SigningKey::from_bytes(&secret))
    }

    fn from_signing_key(signing: SigningKey) -> Self {
        let address = Address::from_verifying_key(&signing.verifying_key());
        Self { signing, address }
    }

    /// Load the key at `path`, creating and saving a new one if the file
    /// does not exist.
    pub fn load_or_generate(path: &Path) -> Result<Self, ConsensusError> {
        if path.exists() {
            return Self::load(path);
        }
        let key = Self::generate();
        key.save(path)?;
        info!(address = %key.address, path = %path.display(), "Generated validator key");
        Ok(key)
    }

    pub fn load(path: &Path) -> Result<Self, ConsensusError> {
        let invalid = |reason: String| ConsensusError::InvalidKey {
            path: path.to_path_buf(),
            reason,
        };
        let contents = Zeroizing::new(fs::read_to_string(path)?);
        let json: KeyJson = serde_json::from_str(&contents).map_err(|e| invalid(e.to_string()))?;

        let mut secret = Zeroizing::new([0u8; 32]);
        hex::decode_to_slice(&json.priv_key, secret.as_mut_slice())
            .map_err(|_| invalid("priv_key must be 32 hex-encoded bytes".to_string()))?;
        let key = Self::from_signing_key(SigningKey::from_bytes(&secret));

        if key.verifying_key().to_bytes() != json.pub_key {
            return Err(invalid("pub_key does not match priv_key".to_string()));
        }
        if key.address != json.address {
            return Err(invalid(format!(
                "address {} does not match key, expected {}",
                json.address, key.address
            )));
        }
        Ok(key)
    }

    /// Write the key with owner-only permissions.
    pub fn save(&self, path: &Path) -> Result<(), ConsensusError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = KeyJson {
            address: self.address,
            pub_key: self.verifying_key().to_bytes(),
            priv_key: hex::encode(self.signing.as_bytes()),
        };
        let contents = Zeroizing::new(serde_json::to_string_pretty(&json)?);
        fs::write(path, contents.as_bytes())?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing.verifying_key()
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing.sign(message)
    }
}
