//! Blockchain RPC client with timeout and error handling.
//!
//! # Responsibilities
//! - Connect to JSON-RPC endpoint (primary + failovers)
//! - Query chain state (block number, blocks, balances, receipts, logs)
//! - Broadcast signed transactions
//! - Handle timeouts and network errors gracefully

use alloy::consensus::Transaction as _;
use alloy::eips::BlockNumberOrTag;
use alloy::network::{TransactionBuilder, TransactionResponse as _};
use alloy::primitives::{Address, Bytes, TxHash, U256};
use alloy::providers::{Provider, ProviderBuilder};
use alloy::rpc::types::{Filter, TransactionRequest};
use alloy::sol_types::SolEvent;
use alloy::transports::TransportResult;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

use crate::blockchain::asset::IERC20;
use crate::blockchain::rpc::ChainRpc;
use crate::blockchain::types::{
    BlockchainConfig, BlockchainError, BlockchainResult, ChainBlock, ChainTransaction,
    SignedTransfer, TokenTransfer, TxReceipt,
};
use crate::observability::metrics;

type SharedProvider = Arc<dyn Provider + Send + Sync>;

/// Blockchain RPC client wrapper with failover support.
#[derive(Clone)]
pub struct BlockchainClient {
    /// List of providers (primary + failovers).
    providers: Vec<SharedProvider>,
    /// Configuration.
    config: BlockchainConfig,
    /// Request timeout duration.
    timeout_duration: Duration,
}

impl BlockchainClient {
    /// Create a new blockchain client.
    ///
    /// An unreachable endpoint is not an error here; the chain id check is
    /// logged and the pipeline relies on per-call failures instead.
    pub async fn new(config: BlockchainConfig) -> BlockchainResult<Self> {
        let timeout_duration = Duration::from_secs(config.rpc_timeout_secs);
        let mut providers = Vec::new();

        // 1. Add primary provider
        let primary_url: url::Url = config.rpc_url.parse().map_err(|e| {
            BlockchainError::Rpc(format!("Invalid RPC URL '{}': {}", config.rpc_url, e))
        })?;
        providers.push(Arc::new(ProviderBuilder::new().connect_http(primary_url)) as SharedProvider);

        // 2. Add failover providers
        for url_str in &config.failover_urls {
            match url_str.parse::<url::Url>() {
                Ok(url) => {
                    providers.push(Arc::new(ProviderBuilder::new().connect_http(url)) as SharedProvider)
                }
                Err(_) => tracing::warn!(url = %url_str, "Ignoring invalid failover RPC URL"),
            }
        }

        let client = Self {
            providers,
            config: config.clone(),
            timeout_duration,
        };

        match client.verify_chain_id().await {
            Ok(()) => {
                tracing::info!(
                    rpc_url = %config.rpc_url,
                    chain_id = config.chain_id,
                    failovers = config.failover_urls.len(),
                    "Blockchain client initialized"
                );
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    "Blockchain client initialized but chain verification failed"
                );
            }
        }

        Ok(client)
    }

    /// Verify the connected chain ID matches configuration.
    pub async fn verify_chain_id(&self) -> BlockchainResult<()> {
        let actual = self.chain_id().await?;
        if actual != self.config.chain_id {
            return Err(BlockchainError::ChainMismatch {
                expected: self.config.chain_id,
                actual,
            });
        }
        Ok(())
    }

    /// Run one RPC operation against each provider in turn until one answers.
    async fn with_failover<T, F, Fut>(&self, op: &'static str, f: F) -> BlockchainResult<T>
    where
        F: Fn(SharedProvider) -> Fut + Send + Sync,
        Fut: Future<Output = TransportResult<T>> + Send,
        T: Send,
    {
        let mut all_timed_out = true;
        for (i, provider) in self.providers.iter().enumerate() {
            match timeout(self.timeout_duration, f(Arc::clone(provider))).await {
                Ok(Ok(result)) => {
                    metrics::record_rpc_call(op, true);
                    return Ok(result);
                }
                Ok(Err(e)) => {
                    all_timed_out = false;
                    tracing::warn!(provider_idx = i, op, error = %e, "RPC error, trying next provider");
                }
                Err(_) => {
                    tracing::warn!(provider_idx = i, op, "RPC timeout, trying next provider");
                }
            }
        }
        metrics::record_rpc_call(op, false);
        if all_timed_out {
            Err(BlockchainError::Timeout(self.config.rpc_timeout_secs))
        } else {
            Err(BlockchainError::Rpc(format!("All RPC providers failed: {op}")))
        }
    }
}

#[async_trait]
impl ChainRpc for BlockchainClient {
    async fn chain_id(&self) -> BlockchainResult<u64> {
        self.with_failover("get_chain_id", |p| async move { p.get_chain_id().await })
            .await
    }

    async fn block_number(&self) -> BlockchainResult<u64> {
        self.with_failover("get_block_number", |p| async move { p.get_block_number().await })
            .await
    }

    async fn block_with_transactions(&self, number: u64) -> BlockchainResult<Option<ChainBlock>> {
        let block = self
            .with_failover("get_block", |p| async move {
                p.get_block_by_number(BlockNumberOrTag::Number(number))
                    .full()
                    .await
            })
            .await?;

        let Some(block) = block else {
            return Ok(None);
        };

        let transactions = block
            .transactions
            .as_transactions()
            .unwrap_or_default()
            .iter()
            .map(|tx| ChainTransaction {
                hash: tx.tx_hash(),
                from: tx.from(),
                to: tx.to(),
                value: tx.value(),
            })
            .collect();

        Ok(Some(ChainBlock {
            number: block.header.number,
            transactions,
        }))
    }

    async fn transaction_receipt(&self, hash: TxHash) -> BlockchainResult<Option<TxReceipt>> {
        let receipt = self
            .with_failover("get_transaction_receipt", |p| async move {
                p.get_transaction_receipt(hash).await
            })
            .await?;

        Ok(receipt.map(|r| TxReceipt {
            tx_hash: r.transaction_hash,
            block_number: r.block_number,
            success: r.status(),
            gas_used: r.gas_used,
            effective_gas_price: r.effective_gas_price,
        }))
    }

    async fn balance(&self, address: Address) -> BlockchainResult<U256> {
        self.with_failover("get_balance", |p| async move { p.get_balance(address).await })
            .await
    }

    async fn transaction_count(&self, address: Address) -> BlockchainResult<u64> {
        self.with_failover("get_transaction_count", |p| async move {
            p.get_transaction_count(address).pending().await
        })
        .await
    }

    async fn gas_price(&self) -> BlockchainResult<u128> {
        self.with_failover("get_gas_price", |p| async move { p.get_gas_price().await })
            .await
    }

    async fn estimate_gas(
        &self,
        from: Address,
        to: Address,
        value: U256,
        data: Bytes,
    ) -> BlockchainResult<u64> {
        let request = TransactionRequest::default()
            .with_from(from)
            .with_to(to)
            .with_value(value)
            .with_input(data);

        self.with_failover("estimate_gas", |p| {
            let request = request.clone();
            async move { p.estimate_gas(request).await }
        })
        .await
    }

    async fn call(&self, to: Address, data: Bytes) -> BlockchainResult<Bytes> {
        let request = TransactionRequest::default().with_to(to).with_input(data);

        self.with_failover("eth_call", |p| {
            let request = request.clone();
            async move { p.call(request).await }
        })
        .await
    }

    async fn send_transaction(&self, tx: &SignedTransfer) -> BlockchainResult<TxHash> {
        let raw = tx.raw.clone();
        let hash = self
            .with_failover("send_raw_transaction", |p| {
                let raw = raw.clone();
                async move {
                    let pending = p.send_raw_transaction(&raw).await?;
                    Ok(*pending.tx_hash())
                }
            })
            .await?;

        tracing::info!(tx_hash = %hash, from = %tx.from, nonce = tx.nonce, "Transaction broadcast");
        Ok(hash)
    }

    async fn token_transfers(
        &self,
        tokens: &[Address],
        from_block: u64,
        to_block: u64,
    ) -> BlockchainResult<Vec<TokenTransfer>> {
        if tokens.is_empty() || from_block > to_block {
            return Ok(Vec::new());
        }

        let filter = Filter::new()
            .address(tokens.to_vec())
            .event_signature(IERC20::Transfer::SIGNATURE_HASH)
            .from_block(from_block)
            .to_block(to_block);

        let logs = self
            .with_failover("get_logs", |p| {
                let filter = filter.clone();
                async move { p.get_logs(&filter).await }
            })
            .await?;

        let mut transfers = Vec::with_capacity(logs.len());
        for log in logs {
            let (Some(tx_hash), Some(block_number)) = (log.transaction_hash, log.block_number) else {
                // Pending logs carry no inclusion data yet.
                continue;
            };
            let log_index = log.log_index.unwrap_or_default();
            match log.log_decode::<IERC20::Transfer>() {
                Ok(decoded) => {
                    let event = &decoded.inner.data;
                    transfers.push(TokenTransfer {
                        token: decoded.inner.address,
                        tx_hash,
                        log_index,
                        block_number,
                        from: event.from,
                        to: event.to,
                        value: event.value,
                    });
                }
                Err(e) => {
                    tracing::debug!(tx_hash = %tx_hash, error = %e, "Skipping undecodable Transfer log");
                }
            }
        }
        Ok(transfers)
    }
}

impl std::fmt::Debug for BlockchainClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockchainClient")
            .field("rpc_url", &self.config.rpc_url)
            .field("providers", &self.providers.len())
            .field("chain_id", &self.config.chain_id)
            .field("timeout_secs", &self.config.rpc_timeout_secs)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> BlockchainConfig {
        BlockchainConfig {
            // Nothing listens on port 1; every call fails fast.
            rpc_url: "http://127.0.0.1:1".to_string(),
            failover_urls: Vec::new(),
            chain_id: 31337,
            rpc_timeout_secs: 2,
            ..BlockchainConfig::default()
        }
    }

    #[tokio::test]
    async fn test_client_creation() {
        let result = BlockchainClient::new(test_config()).await;
        // Client creation should succeed even if RPC is unreachable
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_invalid_primary_url() {
        let mut config = test_config();
        config.rpc_url = "not a url".to_string();
        let err = BlockchainClient::new(config).await.unwrap_err();
        assert!(err.to_string().contains("Invalid RPC URL"));
    }

    #[tokio::test]
    async fn test_rpc_failover() {
        let mut config = test_config();
        config.failover_urls.push("http://127.0.0.1:2".to_string());
        config.failover_urls.push("::garbage::".to_string());

        let client = BlockchainClient::new(config).await.unwrap();
        assert_eq!(client.providers.len(), 2);

        let result = client.block_number().await;
        assert!(result.is_err());
    }
}
