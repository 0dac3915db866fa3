// Copyright (c) 2024 Botho Foundation

//! Signed value transfers.

use bth_keystore::{Address, KeyStore, KeystoreError};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Reasons a transaction is rejected.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TxError {
    #[error("malformed transaction: {0}")]
    Malformed(String),

    #[error("invalid signature")]
    InvalidSignature,

    #[error("public key does not belong to sender {0}")]
    SenderMismatch(Address),

    #[error("invalid nonce: expected {expected}, got {got}")]
    BadNonce { expected: u64, got: u64 },

    #[error("insufficient funds: balance {balance}, need {needed}")]
    InsufficientFunds { balance: u128, needed: u128 },

    #[error("balance overflow")]
    Overflow,
}

/// The unsigned body of a transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    pub from: Address,
    pub to: Address,
    pub amount: u128,
    pub nonce: u64,
}

impl Transfer {
    /// Bytes covered by the signature.
    pub fn signing_bytes(&self) -> Result<Vec<u8>, TxError> {
        serde_json::to_vec(self).map_err(|e| TxError::Malformed(e.to_string()))
    }
}

/// A transfer signed by the sender's ed25519 key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub transfer: Transfer,
    #[serde(with = "hex::serde")]
    pub public_key: [u8; 32],
    #[serde(with = "hex::serde")]
    pub signature: Vec<u8>,
}

impl Transaction {
    /// Sign `transfer` with the sender's key, which must be unlocked in
    /// `keystore`.
    pub fn sign(transfer: Transfer, keystore: &KeyStore) -> Result<Self, KeystoreError> {
        let message = transfer
            .signing_bytes()
            .map_err(|e| KeystoreError::Crypto(e.to_string()))?;
        let signature = keystore.sign(&transfer.from, &message)?;
        let public_key = keystore.verifying_key(&transfer.from)?.to_bytes();
        Ok(Self {
            transfer,
            public_key,
            signature: signature.to_bytes().to_vec(),
        })
    }

    /// Check that the key belongs to the sender and signed the body.
    pub fn verify(&self) -> Result<(), TxError> {
        let key =
            VerifyingKey::from_bytes(&self.public_key).map_err(|_| TxError::InvalidSignature)?;
        if Address::from_verifying_key(&key) != self.transfer.from {
            return Err(TxError::SenderMismatch(self.transfer.from));
        }
        let signature =
            Signature::from_slice(&self.signature).map_err(|_| TxError::InvalidSignature)?;
        key.verify(&self.transfer.signing_bytes()?, &signature)
            .map_err(|_| TxError::InvalidSignature)
    }

    pub fn encode(&self) -> Result<Vec<u8>, TxError> {
        serde_json::to_vec(self).map_err(|e| TxError::Malformed(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, TxError> {
        serde_json::from_slice(bytes).map_err(|e| TxError::Malformed(e.to_string()))
    }

    /// SHA-256 of the encoded transaction.
    pub fn hash(&self) -> Result<[u8; 32], TxError> {
        Ok(Sha256::digest(self.encode()?).into())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use bth_keystore::KdfParams;
    use std::sync::Arc;
    use tempfile::TempDir;

    /// A key store with one unlocked account.
    pub(crate) fn funded_sender(dir: &TempDir) -> (Arc<KeyStore>, Address) {
        let keystore = KeyStore::open(dir.path().join("keys"), KdfParams::LIGHT).unwrap();
        let account = keystore.new_account("pw").unwrap();
        keystore.unlock(&account, "pw").unwrap();
        (keystore, account.address)
    }

    pub(crate) fn transfer(from: Address, amount: u128, nonce: u64) -> Transfer {
        Transfer {
            from,
            to: "0x00000000000000000000000000000000000000cc".parse().unwrap(),
            amount,
            nonce,
        }
    }

    #[test]
    fn test_signed_transaction_verifies() {
        let dir = TempDir::new().unwrap();
        let (keystore, sender) = funded_sender(&dir);
        let tx = Transaction::sign(transfer(sender, 10, 0), &keystore).unwrap();
        tx.verify().unwrap();

        let decoded = Transaction::decode(&tx.encode().unwrap()).unwrap();
        assert_eq!(decoded, tx);
        decoded.verify().unwrap();
    }

    #[test]
    fn test_tampered_amount_rejected() {
        let dir = TempDir::new().unwrap();
        let (keystore, sender) = funded_sender(&dir);
        let mut tx = Transaction::sign(transfer(sender, 10, 0), &keystore).unwrap();
        tx.transfer.amount = 1_000;
        assert_eq!(tx.verify(), Err(TxError::InvalidSignature));
    }

    #[test]
    fn test_foreign_sender_rejected() {
        let dir = TempDir::new().unwrap();
        let (keystore, sender) = funded_sender(&dir);
        let mut tx = Transaction::sign(transfer(sender, 10, 0), &keystore).unwrap();
        let other: Address = "0x00000000000000000000000000000000000000dd".parse().unwrap();
        tx.transfer.from = other;
        assert_eq!(tx.verify(), Err(TxError::SenderMismatch(other)));
    }

    #[test]
    fn test_locked_sender_cannot_sign() {
        let dir = TempDir::new().unwrap();
        let (keystore, sender) = funded_sender(&dir);
        keystore.lock(&sender);
        assert!(matches!(
            Transaction::sign(transfer(sender, 1, 0), &keystore),
            Err(KeystoreError::Locked(_))
        ));
    }

    #[test]
    fn test_decode_garbage() {
        assert!(matches!(
            Transaction::decode(b"not json"),
            Err(TxError::Malformed(_))
        ));
    }
}
