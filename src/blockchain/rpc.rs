//! The chain access seam used by the whole pipeline.
//!
//! Everything above this trait talks in the crate's own chain types, so the
//! observer and the engines can run against [`BlockchainClient`] in production
//! and against an in-memory chain in tests.
//!
//! [`BlockchainClient`]: crate::blockchain::client::BlockchainClient

use alloy::primitives::{Address, Bytes, TxHash, U256};
use async_trait::async_trait;

use crate::blockchain::types::{
    BlockchainResult, ChainBlock, SignedTransfer, TokenTransfer, TxReceipt,
};

/// Read and write access to an EVM chain.
#[async_trait]
pub trait ChainRpc: Send + Sync {
    /// Chain id reported by the node.
    async fn chain_id(&self) -> BlockchainResult<u64>;

    /// Latest block number.
    async fn block_number(&self) -> BlockchainResult<u64>;

    /// Block with full transactions, `None` if the node does not have it yet.
    async fn block_with_transactions(&self, number: u64) -> BlockchainResult<Option<ChainBlock>>;

    /// Receipt for a transaction, `None` while it is unmined.
    async fn transaction_receipt(&self, hash: TxHash) -> BlockchainResult<Option<TxReceipt>>;

    /// Native balance in wei.
    async fn balance(&self, address: Address) -> BlockchainResult<U256>;

    /// Pending transaction count for an address.
    async fn transaction_count(&self, address: Address) -> BlockchainResult<u64>;

    /// Current legacy gas price in wei.
    async fn gas_price(&self) -> BlockchainResult<u128>;

    /// Gas estimate for a call.
    async fn estimate_gas(
        &self,
        from: Address,
        to: Address,
        value: U256,
        data: Bytes,
    ) -> BlockchainResult<u64>;

    /// Read-only contract call returning the raw ABI output.
    async fn call(&self, to: Address, data: Bytes) -> BlockchainResult<Bytes>;

    /// Broadcast a signed transaction, returning its hash.
    async fn send_transaction(&self, tx: &SignedTransfer) -> BlockchainResult<TxHash>;

    /// `Transfer` logs emitted by the given token contracts in a block range.
    async fn token_transfers(
        &self,
        tokens: &[Address],
        from_block: u64,
        to_block: u64,
    ) -> BlockchainResult<Vec<TokenTransfer>>;
}
