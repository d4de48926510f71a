//! Encryption of private keys at rest.
//!
//! ```text
//! encryption secret
//!    │
//!    └── HKDF-SHA256(salt="custody-sweeper-v1", info="key-encryption") ──► 32-byte key
//!
//! stored form:  v1:<nonce hex>:<ciphertext hex>
//! AAD:          "<user id>:<lowercase address>"
//! ```
//!
//! Binding the ciphertext to its owner means a row copied onto another user
//! fails to decrypt instead of silently signing with the wrong key.

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::custody::types::{CustodyError, CustodyResult, DecryptionError};

const FORMAT_VERSION: &str = "v1";
const HKDF_SALT: &[u8] = b"custody-sweeper-v1";
const HKDF_INFO: &[u8] = b"key-encryption";
const NONCE_LEN: usize = 12;

/// Authenticated encryption keyed from the operator's secret.
pub struct KeyCipher {
    key: Zeroizing<[u8; 32]>,
}

impl KeyCipher {
    pub fn new(secret: &str) -> CustodyResult<Self> {
        if secret.trim().is_empty() {
            return Err(CustodyError::Encryption("encryption secret is empty".to_string()));
        }
        let hk = Hkdf::<Sha256>::new(Some(HKDF_SALT), secret.as_bytes());
        let mut key = Zeroizing::new([0u8; 32]);
        hk.expand(HKDF_INFO, key.as_mut())
            .map_err(|e| CustodyError::Encryption(format!("key expansion failed: {e}")))?;
        Ok(Self { key })
    }

    /// Encrypt `plaintext` bound to `context`.
    pub fn encrypt(&self, plaintext: &[u8], context: &str) -> CustodyResult<String> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);

        let cipher = ChaCha20Poly1305::new_from_slice(self.key.as_ref())
            .map_err(|_| CustodyError::Encryption("failed to create cipher".to_string()))?;
        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: plaintext,
                    aad: context.as_bytes(),
                },
            )
            .map_err(|_| CustodyError::Encryption("encryption failed".to_string()))?;

        Ok(format!(
            "{FORMAT_VERSION}:{}:{}",
            hex::encode(nonce_bytes),
            hex::encode(ciphertext)
        ))
    }

    /// Decrypt a value produced by [`KeyCipher::encrypt`] with the same context.
    pub fn decrypt(&self, encrypted: &str, context: &str) -> Result<Zeroizing<Vec<u8>>, DecryptionError> {
        let mut parts = encrypted.splitn(3, ':');
        let (Some(version), Some(nonce_hex), Some(ciphertext_hex)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(DecryptionError::Malformed("expected version:nonce:ciphertext".to_string()));
        };
        if version != FORMAT_VERSION {
            return Err(DecryptionError::Malformed(format!("unsupported version '{version}'")));
        }

        let nonce_bytes =
            hex::decode(nonce_hex).map_err(|_| DecryptionError::Malformed("invalid nonce encoding".to_string()))?;
        if nonce_bytes.len() != NONCE_LEN {
            return Err(DecryptionError::Malformed("invalid nonce length".to_string()));
        }
        let ciphertext = hex::decode(ciphertext_hex)
            .map_err(|_| DecryptionError::Malformed("invalid ciphertext encoding".to_string()))?;

        let cipher = ChaCha20Poly1305::new_from_slice(self.key.as_ref())
            .map_err(|_| DecryptionError::Malformed("failed to create cipher".to_string()))?;
        let plaintext = cipher
            .decrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: ciphertext.as_slice(),
                    aad: context.as_bytes(),
                },
            )
            .map_err(|_| DecryptionError::Authentication)?;
        Ok(Zeroizing::new(plaintext))
    }
}

impl std::fmt::Debug for KeyCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyCipher").finish_non_exhaustive()
    }
}
