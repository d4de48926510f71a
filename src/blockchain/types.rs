//! Chain-specific types and error definitions.

use alloy::primitives::{Address, Bytes, TxHash, U256};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::blockchain::asset::TokenType;

// Re-export BlockchainConfig from config module to avoid duplication
pub use crate::config::schema::BlockchainConfig;

/// Errors that can occur during blockchain operations.
#[derive(Debug, Error)]
pub enum BlockchainError {
    /// RPC connection or request failed.
    #[error("RPC error: {0}")]
    Rpc(String),

    /// RPC request timed out.
    #[error("RPC timeout after {0} seconds")]
    Timeout(u64),

    /// Transaction receipt did not appear in time.
    #[error("Transaction {0} not mined within {1} seconds")]
    ReceiptTimeout(TxHash, u64),

    /// Transaction was reverted on-chain.
    #[error("Transaction reverted: {0}")]
    Reverted(String),

    /// Signing or key handling failed.
    #[error("Wallet error: {0}")]
    Wallet(String),

    /// Gas price exceeded maximum allowed.
    #[error("Gas price {current_gwei} gwei exceeds maximum {max_gwei} gwei")]
    GasPriceTooHigh { current_gwei: u64, max_gwei: u64 },

    /// Nonce management error.
    #[error("Nonce error: {0}")]
    Nonce(String),

    /// Chain configuration mismatch.
    #[error("Chain ID mismatch: expected {expected}, got {actual}")]
    ChainMismatch { expected: u64, actual: u64 },

    /// Contract call returned data we could not decode.
    #[error("ABI error: {0}")]
    Abi(String),

    /// The submission actor is gone (shutdown in progress).
    #[error("Blockchain not available: {0}")]
    NotAvailable(String),
}

impl BlockchainError {
    /// Whether the failure is a deadline rather than an RPC-level error.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::ReceiptTimeout(..))
    }
}

/// Result type for blockchain operations.
pub type BlockchainResult<T> = Result<T, BlockchainError>;

/// Transaction confirmation status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmationStatus {
    /// Transaction is pending in mempool.
    Pending,
    /// Transaction has been mined but not enough confirmations.
    Confirming { current: u64, required: u64 },
    /// Transaction is confirmed with required block depth.
    Confirmed { block_number: u64, confirmations: u64 },
    /// Transaction was mined but reverted.
    Failed(String),
}

impl ConfirmationStatus {
    /// Classify a receipt against the current head.
    ///
    /// `confirmations = head - receipt.block_number`.
    pub fn evaluate(receipt: Option<&TxReceipt>, head: u64, required: u64) -> Self {
        let Some(receipt) = receipt else {
            return Self::Pending;
        };
        let Some(block_number) = receipt.block_number else {
            return Self::Pending;
        };
        if !receipt.success {
            return Self::Failed("Transaction reverted".to_string());
        }
        let confirmations = head.saturating_sub(block_number);
        if confirmations >= required {
            Self::Confirmed {
                block_number,
                confirmations,
            }
        } else {
            Self::Confirming {
                current: confirmations,
                required,
            }
        }
    }
}

/// A transaction as seen inside a fetched block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainTransaction {
    pub hash: TxHash,
    pub from: Address,
    pub to: Option<Address>,
    pub value: U256,
}

/// A block with its transactions.
#[derive(Debug, Clone, Default)]
pub struct ChainBlock {
    pub number: u64,
    pub transactions: Vec<ChainTransaction>,
}

/// The parts of a receipt the pipeline relies on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxReceipt {
    pub tx_hash: TxHash,
    /// `None` while the node reports the receipt without inclusion data.
    pub block_number: Option<u64>,
    pub success: bool,
    pub gas_used: u64,
    pub effective_gas_price: u128,
}

impl TxReceipt {
    /// Fee actually paid, in wei.
    pub fn fee(&self) -> U256 {
        U256::from(self.gas_used) * U256::from(self.effective_gas_price)
    }
}

/// A decoded `Transfer(from, to, value)` log of a token contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenTransfer {
    pub token: Address,
    pub tx_hash: TxHash,
    pub log_index: u64,
    pub block_number: u64,
    pub from: Address,
    pub to: Address,
    pub value: U256,
}

/// A signed, ready-to-broadcast transaction plus the metadata that produced it.
#[derive(Debug, Clone)]
pub struct SignedTransfer {
    pub hash: TxHash,
    pub raw: Bytes,
    pub from: Address,
    /// Transaction-level recipient (the token contract for token transfers).
    pub to: Address,
    pub value: U256,
    pub nonce: u64,
    pub gas_limit: u64,
    pub gas_price: u128,
    /// What the transfer moves, and to whom, at the asset level.
    pub asset: TokenType,
    pub recipient: Address,
    pub amount: U256,
}

impl SignedTransfer {
    /// Upper bound on the fee this transaction can burn.
    pub fn max_fee(&self) -> U256 {
        U256::from(self.gas_limit) * U256::from(self.gas_price)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn receipt(block: Option<u64>, success: bool) -> TxReceipt {
        TxReceipt {
            tx_hash: TxHash::ZERO,
            block_number: block,
            success,
            gas_used: 21_000,
            effective_gas_price: 2_000_000_000,
        }
    }

    #[test]
    fn test_default_config() {
        let config = BlockchainConfig::default();
        assert_eq!(config.rpc_timeout_secs, 10);
        assert_eq!(config.confirmation_blocks, 6);
    }

    #[test]
    fn test_error_display() {
        let err = BlockchainError::Timeout(10);
        assert_eq!(err.to_string(), "RPC timeout after 10 seconds");
        assert!(err.is_timeout());

        let err = BlockchainError::GasPriceTooHigh {
            current_gwei: 600,
            max_gwei: 500,
        };
        assert!(err.to_string().contains("600"));
        assert!(!err.is_timeout());
    }

    #[test]
    fn test_confirmation_evaluation() {
        assert_eq!(ConfirmationStatus::evaluate(None, 100, 6), ConfirmationStatus::Pending);
        assert_eq!(
            ConfirmationStatus::evaluate(Some(&receipt(None, true)), 100, 6),
            ConfirmationStatus::Pending
        );
        assert_eq!(
            ConfirmationStatus::evaluate(Some(&receipt(Some(96), true)), 100, 6),
            ConfirmationStatus::Confirming { current: 4, required: 6 }
        );
        assert_eq!(
            ConfirmationStatus::evaluate(Some(&receipt(Some(94), true)), 100, 6),
            ConfirmationStatus::Confirmed { block_number: 94, confirmations: 6 }
        );
        assert!(matches!(
            ConfirmationStatus::evaluate(Some(&receipt(Some(90), false)), 100, 6),
            ConfirmationStatus::Failed(_)
        ));
    }

    #[test]
    fn test_receipt_fee() {
        assert_eq!(receipt(Some(1), true).fee(), U256::from(42_000_000_000_000u64));
    }
}
