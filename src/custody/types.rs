//! Custody types and errors.

use alloy::primitives::Address;
use thiserror::Error;

use crate::ledger::LedgerError;

/// Ciphertext or context did not match.
#[derive(Debug, Error)]
pub enum DecryptionError {
    #[error("malformed ciphertext: {0}")]
    Malformed(String),

    #[error("authentication failed (wrong secret or context)")]
    Authentication,
}

/// Errors from key derivation and the wallet registry.
#[derive(Debug, Error)]
pub enum CustodyError {
    #[error("invalid master seed: {0}")]
    Seed(String),

    #[error("derivation failed for {path}: {message}")]
    Derivation { path: String, message: String },

    #[error("encryption error: {0}")]
    Encryption(String),

    #[error("decryption error: {0}")]
    Decryption(#[from] DecryptionError),

    #[error("decrypted key for {user_id} controls {actual}, expected {expected}")]
    KeyMismatch {
        user_id: String,
        expected: Address,
        actual: Address,
    },

    #[error("address {address} derived for {user_id} already belongs to {owner}")]
    AddressCollision {
        user_id: String,
        address: Address,
        owner: String,
    },

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

/// Result type for custody operations.
pub type CustodyResult<T> = Result<T, CustodyError>;

/// Output of deterministic derivation for one user.
#[derive(Clone)]
pub struct DerivedWallet {
    pub user_id: String,
    pub address: Address,
    /// Uncompressed SEC1 public key, hex.
    pub public_key: String,
    pub encrypted_private_key: String,
    pub derivation_path: String,
}

impl std::fmt::Debug for DerivedWallet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DerivedWallet")
            .field("user_id", &self.user_id)
            .field("address", &self.address)
            .field("derivation_path", &self.derivation_path)
            .finish()
    }
}
