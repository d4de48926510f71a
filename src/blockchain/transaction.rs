//! Transaction building, signing, broadcast and receipt monitoring.
//!
//! # Responsibilities
//! - Quote gas prices with the configured safety multiplier and ceiling
//! - Serialize every signature through one actor that owns nonces
//! - Wait for receipts with a bounded deadline
//!
//! # Design Decisions
//! - One `TxSubmitter` per process; all engines hold a `SubmitterHandle`
//! - Nonces are cached per address and re-synced from the chain's pending
//!   count after any broadcast failure

use alloy::network::TransactionBuilder;
use alloy::primitives::{Address, TxHash, U256};
use alloy::rpc::types::TransactionRequest;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout};

use crate::blockchain::asset::TokenType;
use crate::blockchain::rpc::ChainRpc;
use crate::blockchain::types::{
    BlockchainConfig, BlockchainError, BlockchainResult, SignedTransfer, TxReceipt,
};
use crate::blockchain::wallet::Wallet;

const SUBMIT_QUEUE_DEPTH: usize = 64;

/// A transfer the caller wants signed and broadcast.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub wallet: Wallet,
    pub asset: TokenType,
    pub recipient: Address,
    pub amount: U256,
    pub gas_limit: u64,
    pub gas_price: u128,
}

struct SubmitCommand {
    request: TransferRequest,
    reply: oneshot::Sender<BlockchainResult<SignedTransfer>>,
}

/// Single consumer of all signing requests.
pub struct TxSubmitter {
    rpc: Arc<dyn ChainRpc>,
    rx: mpsc::Receiver<SubmitCommand>,
    nonces: HashMap<Address, u64>,
}

/// Cloneable front end to the [`TxSubmitter`] actor.
#[derive(Clone)]
pub struct SubmitterHandle {
    tx: mpsc::Sender<SubmitCommand>,
    rpc: Arc<dyn ChainRpc>,
    gas_price_multiplier: f64,
    max_gas_price_gwei: u64,
    receipt_poll: Duration,
}

impl TxSubmitter {
    /// Spawn the actor and return a handle to it.
    pub fn spawn(
        rpc: Arc<dyn ChainRpc>,
        config: &BlockchainConfig,
        shutdown: broadcast::Receiver<()>,
    ) -> (SubmitterHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(SUBMIT_QUEUE_DEPTH);
        let actor = Self {
            rpc: Arc::clone(&rpc),
            rx,
            nonces: HashMap::new(),
        };
        let handle = SubmitterHandle {
            tx,
            rpc,
            gas_price_multiplier: config.gas_price_multiplier,
            max_gas_price_gwei: config.max_gas_price_gwei,
            receipt_poll: Duration::from_millis(config.receipt_poll_ms),
        };
        (handle, tokio::spawn(actor.run(shutdown)))
    }

    async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!("Transaction submitter started");
        loop {
            tokio::select! {
                command = self.rx.recv() => {
                    let Some(SubmitCommand { request, reply }) = command else {
                        break;
                    };
                    let result = self.submit(request).await;
                    // The caller may have given up waiting; the nonce is still consumed.
                    let _ = reply.send(result);
                }
                _ = shutdown.recv() => {
                    tracing::info!("Transaction submitter received shutdown signal");
                    break;
                }
            }
        }
    }

    async fn submit(&mut self, request: TransferRequest) -> BlockchainResult<SignedTransfer> {
        let from = request.wallet.address();
        let nonce = match self.nonces.get(&from) {
            Some(nonce) => *nonce,
            None => self.rpc.transaction_count(from).await?,
        };

        let call = request.asset.build_transfer(request.recipient, request.amount);
        let tx_request = TransactionRequest::default()
            .with_to(call.to)
            .with_value(call.value)
            .with_input(call.data)
            .with_nonce(nonce)
            .with_gas_limit(request.gas_limit)
            .with_gas_price(request.gas_price);

        let (hash, raw) = request.wallet.sign_transaction(tx_request).await?;
        let signed = SignedTransfer {
            hash,
            raw,
            from,
            to: call.to,
            value: call.value,
            nonce,
            gas_limit: request.gas_limit,
            gas_price: request.gas_price,
            asset: request.asset,
            recipient: request.recipient,
            amount: request.amount,
        };

        match self.rpc.send_transaction(&signed).await {
            Ok(_) => {
                self.nonces.insert(from, nonce + 1);
                Ok(signed)
            }
            Err(e) => {
                self.nonces.remove(&from);
                tracing::warn!(from = %from, nonce, error = %e, "Broadcast failed, nonce will be re-synced");
                Err(e)
            }
        }
    }
}

impl SubmitterHandle {
    /// Sign and broadcast through the actor.
    pub async fn submit(&self, request: TransferRequest) -> BlockchainResult<SignedTransfer> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SubmitCommand { request, reply })
            .await
            .map_err(|_| BlockchainError::NotAvailable("transaction submitter stopped".to_string()))?;
        rx.await
            .map_err(|_| BlockchainError::NotAvailable("transaction submitter dropped request".to_string()))?
    }

    /// Current gas price with the safety multiplier applied.
    ///
    /// Fails when the raw network price exceeds the configured ceiling.
    pub async fn gas_price(&self) -> BlockchainResult<u128> {
        let gas_price = self.rpc.gas_price().await?;
        let gas_price_gwei = gas_price / 1_000_000_000;

        if gas_price_gwei > self.max_gas_price_gwei as u128 {
            return Err(BlockchainError::GasPriceTooHigh {
                current_gwei: gas_price_gwei as u64,
                max_gwei: self.max_gas_price_gwei,
            });
        }

        Ok((gas_price as f64 * self.gas_price_multiplier) as u128)
    }

    /// Wait until a transaction is mined.
    ///
    /// A reverted transaction is reported as [`BlockchainError::Reverted`].
    pub async fn wait_for_receipt(&self, tx_hash: TxHash, timeout_secs: u64) -> BlockchainResult<TxReceipt> {
        let result = timeout(Duration::from_secs(timeout_secs), async {
            let mut ticker = interval(self.receipt_poll);
            loop {
                ticker.tick().await;

                match self.rpc.transaction_receipt(tx_hash).await? {
                    Some(receipt) if receipt.block_number.is_some() => {
                        if !receipt.success {
                            return Err(BlockchainError::Reverted(tx_hash.to_string()));
                        }
                        return Ok(receipt);
                    }
                    _ => tracing::debug!(tx_hash = %tx_hash, "Transaction pending"),
                }
            }
        })
        .await;

        match result {
            Ok(receipt) => receipt,
            Err(_) => Err(BlockchainError::ReceiptTimeout(tx_hash, timeout_secs)),
        }
    }

    /// The chain this handle submits to.
    pub fn rpc(&self) -> &Arc<dyn ChainRpc> {
        &self.rpc
    }
}

impl std::fmt::Debug for SubmitterHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubmitterHandle")
            .field("gas_price_multiplier", &self.gas_price_multiplier)
            .field("max_gas_price_gwei", &self.max_gas_price_gwei)
            .finish()
    }
}
