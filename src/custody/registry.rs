//! Wallet registry: the ledger table plus an in-memory address index.

use std::sync::Arc;

use alloy::primitives::Address;
use chrono::Utc;
use dashmap::DashMap;

use crate::blockchain::wallet::Wallet;
use crate::custody::keys::KeyDeriver;
use crate::custody::types::{CustodyError, CustodyResult};
use crate::ledger::models::UserWallet;
use crate::ledger::Ledger;

/// Maps user ids to deposit addresses and back.
///
/// The index answers the observer's "is this a user address?" question for
/// every transaction in every block without touching the database. Wallets
/// created by another process (the operator CLI) reach it via [`refresh`].
///
/// [`refresh`]: WalletRegistry::refresh
pub struct WalletRegistry {
    ledger: Ledger,
    deriver: Arc<KeyDeriver>,
    by_address: DashMap<Address, String>,
}

impl WalletRegistry {
    /// Build the registry and index every stored wallet.
    pub fn load(ledger: Ledger, deriver: Arc<KeyDeriver>) -> CustodyResult<Self> {
        let by_address = DashMap::new();
        for wallet in ledger.list_wallets()? {
            by_address.insert(wallet.address, wallet.user_id);
        }
        tracing::info!(wallets = by_address.len(), "Wallet registry loaded");
        Ok(Self {
            ledger,
            deriver,
            by_address,
        })
    }

    /// Deposit address of a user, deriving and storing it on first use.
    pub fn get_deposit_address(&self, user_id: &str) -> CustodyResult<Address> {
        if let Some(wallet) = self.ledger.wallet_by_user(user_id)? {
            return Ok(wallet.address);
        }

        let derived = self.deriver.derive_wallet(user_id)?;
        if let Some(owner) = self.by_address.get(&derived.address) {
            if owner.value() != user_id {
                tracing::error!(
                    user_id,
                    address = %derived.address,
                    owner = %owner.value(),
                    "Derived address collides with an existing user"
                );
                return Err(CustodyError::AddressCollision {
                    user_id: user_id.to_string(),
                    address: derived.address,
                    owner: owner.value().clone(),
                });
            }
        }

        let wallet = UserWallet {
            user_id: derived.user_id,
            address: derived.address,
            public_key: derived.public_key,
            encrypted_private_key: derived.encrypted_private_key,
            derivation_path: derived.derivation_path,
            created_at: Utc::now(),
        };
        self.ledger.insert_wallet(&wallet)?;
        self.by_address.insert(wallet.address, wallet.user_id.clone());

        tracing::info!(
            user_id,
            address = %wallet.address,
            path = %wallet.derivation_path,
            "Deposit wallet created"
        );
        Ok(wallet.address)
    }

    /// Index wallets another process stored since the last look.
    ///
    /// A row count is compared first; the table is only re-read when it
    /// grew. Returns how many addresses were added.
    pub fn refresh(&self) -> CustodyResult<usize> {
        if self.ledger.wallet_count()? <= self.by_address.len() {
            return Ok(0);
        }
        let mut added = 0;
        for wallet in self.ledger.list_wallets()? {
            if !self.by_address.contains_key(&wallet.address) {
                tracing::info!(user_id = %wallet.user_id, address = %wallet.address, "Wallet registered elsewhere, indexed");
                self.by_address.insert(wallet.address, wallet.user_id);
                added += 1;
            }
        }
        Ok(added)
    }

    /// Owner of a deposit address, if any.
    pub fn user_for(&self, address: &Address) -> Option<String> {
        self.by_address.get(address).map(|entry| entry.value().clone())
    }

    pub fn addresses(&self) -> Vec<Address> {
        self.by_address.iter().map(|entry| *entry.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.by_address.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_address.is_empty()
    }

    pub fn wallet(&self, user_id: &str) -> CustodyResult<Option<UserWallet>> {
        Ok(self.ledger.wallet_by_user(user_id)?)
    }

    pub fn wallet_by_address(&self, address: &Address) -> CustodyResult<Option<UserWallet>> {
        Ok(self.ledger.wallet_by_address(address)?)
    }

    /// Decrypted signer for a stored wallet.
    pub fn signing_wallet(&self, wallet: &UserWallet) -> CustodyResult<Wallet> {
        self.deriver.signing_wallet(wallet)
    }

    pub fn deriver(&self) -> &Arc<KeyDeriver> {
        &self.deriver
    }
}

impl std::fmt::Debug for WalletRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalletRegistry")
            .field("wallets", &self.by_address.len())
            .finish()
    }
}
