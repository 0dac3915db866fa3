// Copyright (c) 2024 Botho Foundation

//! Password-based encryption of key material.
//!
//! Secrets are sealed with:
//! - Argon2id for password-based key derivation
//! - ChaCha20-Poly1305 for authenticated encryption
//!
//! The Argon2 parameters travel with the ciphertext so files written with
//! lighter parameters (tests, low-memory devices) stay readable.

use argon2::{
    password_hash::{rand_core::OsRng, SaltString},
    Argon2, PasswordHasher,
};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use rand::Rng;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::error::{KeystoreError, Result};

const KDF_NAME: &str = "argon2id";
const NONCE_LEN: usize = 12;

/// Argon2 cost parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    pub memory_kb: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl KdfParams {
    /// Tuned for security vs. usability: 64 MB, 3 passes, 4 lanes.
    pub const STANDARD: Self = Self {
        memory_kb: 65536,
        iterations: 3,
        parallelism: 4,
    };

    /// Cheap parameters for tests and throwaway keys.
    pub const LIGHT: Self = Self {
        memory_kb: 1024,
        iterations: 1,
        parallelism: 1,
    };
}

impl Default for KdfParams {
    fn default() -> Self {
        Self::STANDARD
    }
}

/// A sealed secret as stored on disk.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SealedSecret {
    kdf: String,
    kdf_params: KdfParams,
    /// Argon2 salt (base64, as produced by `SaltString`)
    salt: String,
    /// ChaCha20-Poly1305 nonce (hex)
    nonce: String,
    /// Encrypted secret (hex)
    ciphertext: String,
}

impl SealedSecret {
    /// Encrypt `secret` under `password`.
    pub fn seal(secret: &[u8], password: &str, params: KdfParams) -> Result<Self> {
        let salt = SaltString::generate(&mut OsRng);
        let key = derive_key(password, salt.as_str(), &params)?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill(&mut nonce_bytes);

        let cipher = ChaCha20Poly1305::new_from_slice(key.as_ref())
            .map_err(|_| KeystoreError::Crypto("failed to create cipher".to_string()))?;
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), secret)
            .map_err(|_| KeystoreError::Crypto("encryption failed".to_string()))?;

        Ok(Self {
            kdf: KDF_NAME.to_string(),
            kdf_params: params,
            salt: salt.to_string(),
            nonce: hex::encode(nonce_bytes),
            ciphertext: hex::encode(ciphertext),
        })
    }

    /// Decrypt with `password`. A wrong password yields [`KeystoreError::Decrypt`].
    pub fn open(&self, password: &str) -> Result<Zeroizing<Vec<u8>>> {
        if self.kdf != KDF_NAME {
            return Err(KeystoreError::InvalidKeyFile(format!(
                "unsupported kdf {}",
                self.kdf
            )));
        }

        let key = derive_key(password, &self.salt, &self.kdf_params)?;

        let nonce_bytes = hex::decode(&self.nonce)
            .map_err(|_| KeystoreError::InvalidKeyFile("invalid nonce format".to_string()))?;
        if nonce_bytes.len() != NONCE_LEN {
            return Err(KeystoreError::InvalidKeyFile("invalid nonce length".to_string()));
        }
        let ciphertext = hex::decode(&self.ciphertext)
            .map_err(|_| KeystoreError::InvalidKeyFile("invalid ciphertext format".to_string()))?;

        let cipher = ChaCha20Poly1305::new_from_slice(key.as_ref())
            .map_err(|_| KeystoreError::Crypto("failed to create cipher".to_string()))?;
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_slice())
            .map_err(|_| KeystoreError::Decrypt)?;

        Ok(Zeroizing::new(plaintext))
    }
}

/// Derive a 32-byte encryption key from password using Argon2id
fn derive_key(password: &str, salt: &str, params: &KdfParams) -> Result<Zeroizing<[u8; 32]>> {
    let salt = SaltString::from_b64(salt)
        .map_err(|_| KeystoreError::InvalidKeyFile("invalid salt format".to_string()))?;

    let argon2 = Argon2::new(
        argon2::Algorithm::Argon2id,
        argon2::Version::V0x13,
        argon2::Params::new(params.memory_kb, params.iterations, params.parallelism, Some(32))
            .map_err(|_| KeystoreError::Crypto("invalid argon2 parameters".to_string()))?,
    );

    let hash = argon2
        .hash_password(password.as_bytes(), &salt)
        .map_err(|_| KeystoreError::Crypto("key derivation failed".to_string()))?;
    let output = hash
        .hash
        .ok_or_else(|| KeystoreError::Crypto("no hash output".to_string()))?;

    let mut key = Zeroizing::new([0u8; 32]);
    key.copy_from_slice(&output.as_bytes()[..32]);
    Ok(key)
}
