//! Deterministic per-user key derivation.
//!
//! # Derivation Path
//!
//! ```text
//! sha256(user id) ── first 93 bits ──► a (31 bits) | b (31 bits) | c (31 bits)
//!
//! m/44'/60'/a'/b/c
//! ```
//!
//! Three 31-bit components keep every index inside the BIP-32 range while
//! spreading users over 2^93 paths. The registry still rejects an address that
//! is already owned by another user.

use alloy::primitives::{Address, B256};
use alloy::signers::local::coins_bip39::English;
use alloy::signers::local::{MnemonicBuilder, PrivateKeySigner};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::blockchain::wallet::Wallet;
use crate::custody::cipher::KeyCipher;
use crate::custody::types::{CustodyError, CustodyResult, DerivedWallet};
use crate::ledger::models::UserWallet;

const COMPONENT_MASK: u128 = 0x7fff_ffff;

/// BIP-44 path for a user id.
pub fn derivation_path(user_id: &str) -> String {
    let digest = Sha256::digest(user_id.as_bytes());
    let mut head = [0u8; 16];
    head[4..].copy_from_slice(&digest[..12]);
    // 96 bits read big-endian; drop the lowest 3 to keep the first 93.
    let bits = u128::from_be_bytes(head) >> 3;

    let a = (bits >> 62) & COMPONENT_MASK;
    let b = (bits >> 31) & COMPONENT_MASK;
    let c = bits & COMPONENT_MASK;
    format!("m/44'/60'/{a}'/{b}/{c}")
}

/// AEAD context binding a ciphertext to its owner.
pub fn key_context(user_id: &str, address: &Address) -> String {
    format!("{user_id}:{}", address.to_string().to_lowercase())
}

/// Derives user wallets from the master seed and guards their keys.
pub struct KeyDeriver {
    seed_phrase: Zeroizing<String>,
    cipher: KeyCipher,
    chain_id: u64,
}

impl KeyDeriver {
    /// Validate the seed by deriving the first account before accepting it.
    pub fn new(seed_phrase: &str, encryption_secret: &str, chain_id: u64) -> CustodyResult<Self> {
        let deriver = Self {
            seed_phrase: Zeroizing::new(seed_phrase.trim().to_string()),
            cipher: KeyCipher::new(encryption_secret)?,
            chain_id,
        };
        deriver
            .signer_at("m/44'/60'/0'/0/0")
            .map_err(|e| CustodyError::Seed(e.to_string()))?;
        Ok(deriver)
    }

    fn signer_at(&self, path: &str) -> CustodyResult<PrivateKeySigner> {
        let derivation_error = |e: alloy::signers::local::LocalSignerError| CustodyError::Derivation {
            path: path.to_string(),
            message: e.to_string(),
        };
        MnemonicBuilder::<English>::default()
            .phrase(self.seed_phrase.as_str())
            .derivation_path(path)
            .map_err(derivation_error)?
            .build()
            .map_err(derivation_error)
    }

    /// Derive the wallet of `user_id`.
    ///
    /// Address, public key and path are a pure function of the seed and the
    /// user id; the ciphertext uses a fresh nonce each time.
    pub fn derive_wallet(&self, user_id: &str) -> CustodyResult<DerivedWallet> {
        let path = derivation_path(user_id);
        let signer = self.signer_at(&path)?;
        let address = signer.address();

        let public_key = hex::encode(
            signer
                .credential()
                .verifying_key()
                .to_encoded_point(false)
                .as_bytes(),
        );
        let private_key = Zeroizing::new(signer.to_bytes().0);
        let encrypted_private_key = self
            .cipher
            .encrypt(private_key.as_ref(), &key_context(user_id, &address))?;

        Ok(DerivedWallet {
            user_id: user_id.to_string(),
            address,
            public_key,
            encrypted_private_key,
            derivation_path: path,
        })
    }

    /// The collection wallet at a fixed path.
    pub fn master_wallet(&self, path: &str) -> CustodyResult<Wallet> {
        Ok(Wallet::from_signer(self.signer_at(path)?, self.chain_id))
    }

    /// Decrypt a stored key for signing.
    ///
    /// The decrypted key must control the stored address.
    pub fn signing_wallet(&self, wallet: &UserWallet) -> CustodyResult<Wallet> {
        let context = key_context(&wallet.user_id, &wallet.address);
        let key = self.cipher.decrypt(&wallet.encrypted_private_key, &context)?;
        if key.len() != 32 {
            return Err(CustodyError::Encryption(format!(
                "decrypted key for {} has {} bytes",
                wallet.user_id,
                key.len()
            )));
        }

        let signer = PrivateKeySigner::from_bytes(&B256::from_slice(&key)).map_err(|e| {
            CustodyError::Derivation {
                path: wallet.derivation_path.clone(),
                message: e.to_string(),
            }
        })?;
        if signer.address() != wallet.address {
            return Err(CustodyError::KeyMismatch {
                user_id: wallet.user_id.clone(),
                expected: wallet.address,
                actual: signer.address(),
            });
        }
        Ok(Wallet::from_signer(signer, self.chain_id))
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }
}

impl std::fmt::Debug for KeyDeriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyDeriver")
            .field("chain_id", &self.chain_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::address;
    use chrono::Utc;

    const PHRASE: &str = "test test test test test test test test test test test junk";

    fn deriver() -> KeyDeriver {
        KeyDeriver::new(PHRASE, "encryption secret", 31337).unwrap()
    }

    fn stored(derived: &DerivedWallet) -> UserWallet {
        UserWallet {
            user_id: derived.user_id.clone(),
            address: derived.address,
            public_key: derived.public_key.clone(),
            encrypted_private_key: derived.encrypted_private_key.clone(),
            derivation_path: derived.derivation_path.clone(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_path_shape() {
        let path = derivation_path("user-1");
        assert!(path.starts_with("m/44'/60'/"));
        let parts: Vec<&str> = path.split('/').collect();
        assert_eq!(parts.len(), 6);
        assert!(parts[3].ends_with('\''));
        for part in &parts[3..] {
            let index: u64 = part.trim_end_matches('\'').parse().unwrap();
            assert!(index < (1 << 31));
        }
        assert_eq!(path, derivation_path("user-1"));
        assert_ne!(path, derivation_path("user-2"));
    }

    #[test]
    fn test_master_wallet_matches_known_account() {
        let master = deriver().master_wallet("m/44'/60'/0'/0/0").unwrap();
        assert_eq!(
            master.address(),
            address!("f39Fd6e51aad88F6F4ce6aB8827279cffFb92266")
        );
        assert_eq!(master.chain_id(), 31337);
    }

    #[test]
    fn test_derivation_is_deterministic() {
        let a = deriver().derive_wallet("alice").unwrap();
        let b = deriver().derive_wallet("alice").unwrap();
        assert_eq!(a.address, b.address);
        assert_eq!(a.public_key, b.public_key);
        assert_eq!(a.derivation_path, b.derivation_path);
        assert_eq!(a.public_key.len(), 130);
        assert!(a.public_key.starts_with("04"));

        let other = deriver().derive_wallet("bob").unwrap();
        assert_ne!(a.address, other.address);
    }

    #[test]
    fn test_signing_wallet_round_trip() {
        let deriver = deriver();
        let derived = deriver.derive_wallet("alice").unwrap();
        let wallet = deriver.signing_wallet(&stored(&derived)).unwrap();
        assert_eq!(wallet.address(), derived.address);
    }

    #[test]
    fn test_signing_wallet_rejects_moved_ciphertext() {
        let deriver = deriver();
        let alice = deriver.derive_wallet("alice").unwrap();
        let bob = deriver.derive_wallet("bob").unwrap();

        let mut forged = stored(&bob);
        forged.encrypted_private_key = alice.encrypted_private_key;
        let err = deriver.signing_wallet(&forged).unwrap_err();
        assert!(matches!(err, CustodyError::Decryption(_)));
    }

    #[test]
    fn test_invalid_seed_fails_fast() {
        let err = KeyDeriver::new("not a mnemonic", "secret", 1).unwrap_err();
        assert!(matches!(err, CustodyError::Seed(_)));
    }
}
