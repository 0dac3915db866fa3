// Copyright (c) 2024 Botho Foundation

//! On-disk format of a single encrypted signing key.

use chrono::Utc;
use ed25519_dalek::SigningKey;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::Path;

use crate::account::Address;
use crate::cipher::{KdfParams, SealedSecret};
use crate::error::{KeystoreError, Result};

/// Current key file format version
const KEY_FILE_VERSION: u32 = 1;

/// Encrypted key file structure
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeyFile {
    version: u32,
    pub address: Address,
    crypto: SealedSecret,
}

impl KeyFile {
    /// Seal a signing key under `password`.
    pub fn encrypt(key: &SigningKey, password: &str, params: KdfParams) -> Result<Self> {
        Ok(Self {
            version: KEY_FILE_VERSION,
            address: Address::from_verifying_key(&key.verifying_key()),
            crypto: SealedSecret::seal(key.as_bytes(), password, params)?,
        })
    }

    /// Recover the signing key. Fails with [`KeystoreError::Decrypt`] on a wrong password.
    pub fn decrypt(&self, password: &str) -> Result<SigningKey> {
        if self.version != KEY_FILE_VERSION {
            return Err(KeystoreError::UnsupportedVersion {
                found: self.version,
                expected: KEY_FILE_VERSION,
            });
        }

        let secret = self.crypto.open(password)?;
        let bytes: [u8; 32] = secret
            .as_slice()
            .try_into()
            .map_err(|_| KeystoreError::InvalidKeyFile("secret is not 32 bytes".to_string()))?;
        let key = SigningKey::from_bytes(&bytes);

        let derived = Address::from_verifying_key(&key.verifying_key());
        if derived != self.address {
            return Err(KeystoreError::InvalidKeyFile(format!(
                "key content mismatch: have account {}, want {}",
                derived, self.address
            )));
        }
        Ok(key)
    }

    /// File name for a new key file: `UTC--<timestamp>--<hexaddr>`.
    pub fn file_name(address: &Address) -> String {
        format!(
            "UTC--{}--{}",
            Utc::now().format("%Y-%m-%dT%H-%M-%S%.9fZ"),
            address.to_plain_hex()
        )
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        write_private(path, json.as_bytes())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }
}

/// Write a file readable only by its owner, creating parent directories.
pub(crate) fn write_private(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)?;
        file.write_all(contents)?;
    }

    #[cfg(not(unix))]
    {
        let mut file = fs::File::create(path)?;
        file.write_all(contents)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_encrypt_decrypt() {
        let key = SigningKey::from_bytes(&[3u8; 32]);
        let file = KeyFile::encrypt(&key, "pw", KdfParams::LIGHT).unwrap();
        let back = file.decrypt("pw").unwrap();
        assert_eq!(back.as_bytes(), key.as_bytes());
        assert!(file.decrypt("wrong").unwrap_err().is_decrypt());
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let key = SigningKey::from_bytes(&[4u8; 32]);
        let file = KeyFile::encrypt(&key, "pw", KdfParams::LIGHT).unwrap();
        let path = dir.path().join(KeyFile::file_name(&file.address));
        file.save(&path).unwrap();

        let loaded = KeyFile::load(&path).unwrap();
        assert_eq!(loaded.address, file.address);
        assert_eq!(loaded.decrypt("pw").unwrap().as_bytes(), key.as_bytes());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_file_name_ends_with_address() {
        let addr = Address::new([0x11; 20]);
        let name = KeyFile::file_name(&addr);
        assert!(name.starts_with("UTC--"));
        assert!(name.ends_with(&addr.to_plain_hex()));
    }
}
