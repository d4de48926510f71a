//! Signing wallet.
//!
//! # Security
//! - Keys reach a `Wallet` only through the custody layer or the environment
//! - Keys are never logged or serialized
//! - Nonces are not tracked here; the submission actor owns them

use alloy::eips::eip2718::Encodable2718;
use alloy::network::{EthereumWallet, TransactionBuilder};
use alloy::primitives::{Address, Bytes, TxHash};
use alloy::rpc::types::TransactionRequest;
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::Signer;

use crate::blockchain::types::{BlockchainError, BlockchainResult};

/// Wallet for transaction signing.
#[derive(Clone)]
pub struct Wallet {
    /// The underlying signer (private key).
    signer: PrivateKeySigner,
    /// Chain ID for EIP-155 replay protection.
    chain_id: u64,
}

impl Wallet {
    /// Wrap an already constructed signer.
    pub fn from_signer(signer: PrivateKeySigner, chain_id: u64) -> Self {
        Self { signer, chain_id }
    }

    /// Get the wallet's address.
    pub fn address(&self) -> Address {
        self.signer.address()
    }

    /// Get the chain ID this wallet is configured for.
    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    /// Sign a fully populated transaction request.
    ///
    /// Returns the transaction hash and the EIP-2718 encoded bytes ready for
    /// `eth_sendRawTransaction`.
    pub async fn sign_transaction(
        &self,
        request: TransactionRequest,
    ) -> BlockchainResult<(TxHash, Bytes)> {
        let request = request.with_from(self.address()).with_chain_id(self.chain_id);
        let signer = EthereumWallet::from(self.signer.clone());
        let envelope = request
            .build(&signer)
            .await
            .map_err(|e| BlockchainError::Wallet(format!("Signing failed: {}", e)))?;

        let hash = *envelope.tx_hash();
        Ok((hash, envelope.encoded_2718().into()))
    }
}

impl std::fmt::Debug for Wallet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wallet")
            .field("address", &self.address())
            .field("chain_id", &self.chain_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::{keccak256, U256};

    // Well-known test private key (Anvil's first account)
    const TEST_PRIVATE_KEY: &str = "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

    fn test_wallet(chain_id: u64) -> Wallet {
        Wallet::from_signer(TEST_PRIVATE_KEY.parse().unwrap(), chain_id)
    }

    #[test]
    fn test_wallet_address() {
        let wallet = test_wallet(1);
        assert_eq!(
            wallet.address().to_string().to_lowercase(),
            "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266"
        );
        assert_eq!(wallet.chain_id(), 1);
    }

    #[test]
    fn test_debug_does_not_leak_key() {
        let wallet = test_wallet(1);
        let rendered = format!("{:?}", wallet);
        assert!(!rendered.contains(TEST_PRIVATE_KEY));
    }

    #[tokio::test]
    async fn test_sign_transaction() {
        let wallet = test_wallet(31337);
        let request = TransactionRequest::default()
            .with_to(Address::ZERO)
            .with_value(U256::from(1))
            .with_nonce(0)
            .with_gas_limit(21_000)
            .with_gas_price(1_000_000_000);

        let (hash, raw) = wallet.sign_transaction(request).await.unwrap();
        assert!(!raw.is_empty());
        assert_eq!(keccak256(&raw), hash);
    }
}
