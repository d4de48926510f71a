//! Consolidation of one wallet/asset balance into the master wallet.
//!
//! # Sequence
//! ```text
//! outstanding attempt? → cooldown check → gas price → balance + gas estimate
//!     → amount (native: balance - gasLimit*gasPrice, token: full balance)
//!     → sweep row (processing) → decrypt key → submit → receipt
//!     → sweep completed + covered deposits marked swept
//! ```
//!
//! Nothing is broadcast unless the wallet can pay for the transfer's gas.
//! An attempt whose transaction was broadcast but not seen mined stays
//! `processing`; the pair is not swept again until its receipt settles it.

use std::sync::Arc;

use alloy::primitives::{Address, TxHash, U256};
use chrono::Utc;
use thiserror::Error;
use uuid::Uuid;

use crate::blockchain::asset::TokenType;
use crate::blockchain::transaction::{SubmitterHandle, TransferRequest};
use crate::blockchain::types::{BlockchainError, TxReceipt};
use crate::custody::{CustodyError, WalletRegistry};
use crate::incidents::ErrorType;
use crate::ledger::models::{Sweep, UserWallet};
use crate::ledger::{Ledger, LedgerError};
use crate::observability::metrics;

/// Errors and skips of a sweep attempt.
#[derive(Debug, Error)]
pub enum SweepError {
    #[error("{token} from {address} already swept by {sweep_id} within the cooldown")]
    Cooldown {
        address: Address,
        token: TokenType,
        sweep_id: Uuid,
    },

    #[error("no {token} balance at {address}")]
    NothingToSweep { address: Address, token: TokenType },

    #[error("insufficient native balance for gas: required {required} wei, available {available} wei")]
    InsufficientBalanceForGas { required: U256, available: U256 },

    #[error("custody error: {0}")]
    Custody(#[from] CustodyError),

    #[error("RPC error: {0}")]
    Rpc(#[from] BlockchainError),

    #[error("broadcast failed: {0}")]
    Broadcast(BlockchainError),

    #[error("sweep {tx_hash} not confirmed: {source}")]
    Receipt {
        tx_hash: TxHash,
        #[source]
        source: BlockchainError,
    },

    #[error("sweep {sweep_id} is still waiting for {tx_hash} to be mined")]
    AwaitingReceipt { sweep_id: Uuid, tx_hash: TxHash },

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

impl SweepError {
    /// Skips are expected outcomes and are not incidents.
    pub fn is_skip(&self) -> bool {
        matches!(self, Self::Cooldown { .. } | Self::NothingToSweep { .. })
    }

    /// The transaction went out and its fate is unknown.
    fn is_unsettled(&self) -> bool {
        matches!(self, Self::Receipt { source, .. } if !matches!(source, BlockchainError::Reverted(_)))
    }

    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::Cooldown { .. } | Self::NothingToSweep { .. } => ErrorType::SweepFail,
            Self::InsufficientBalanceForGas { .. } => ErrorType::GasFail,
            Self::Custody(CustodyError::Ledger(e)) | Self::Ledger(e) => e.error_type(),
            Self::Custody(_) => ErrorType::WalletError,
            Self::Rpc(e) if e.is_timeout() => ErrorType::TimeoutError,
            Self::Rpc(_) => ErrorType::RpcError,
            Self::Broadcast(_) => ErrorType::TxFail,
            Self::Receipt { source, .. } if source.is_timeout() => ErrorType::TimeoutError,
            Self::Receipt { .. } => ErrorType::TxFail,
            Self::AwaitingReceipt { .. } => ErrorType::TimeoutError,
        }
    }
}

/// A completed sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepResult {
    pub sweep_id: Uuid,
    pub tx_hash: TxHash,
    pub token: TokenType,
    pub amount: U256,
    pub gas_used: u64,
    pub gas_cost: U256,
    pub deposits_swept: usize,
}

/// What a sweep will send, decided before anything is written.
struct SweepPlan {
    amount: U256,
    observed_balance: U256,
    gas_limit: u64,
    gas_price: u128,
}

pub struct SweepEngine {
    submitter: SubmitterHandle,
    ledger: Ledger,
    registry: Arc<WalletRegistry>,
    confirmations_required: u64,
    cooldown: chrono::Duration,
    receipt_timeout_secs: u64,
}

impl SweepEngine {
    pub fn new(
        submitter: SubmitterHandle,
        ledger: Ledger,
        registry: Arc<WalletRegistry>,
        confirmations_required: u64,
        cooldown_secs: u64,
        receipt_timeout_secs: u64,
    ) -> Self {
        Self {
            submitter,
            ledger,
            registry,
            confirmations_required,
            cooldown: chrono::Duration::seconds(cooldown_secs as i64),
            receipt_timeout_secs,
        }
    }

    /// Move the wallet's whole balance of `token` to `master`.
    pub async fn sweep(
        &self,
        wallet: &UserWallet,
        master: Address,
        token: TokenType,
    ) -> Result<SweepResult, SweepError> {
        let address = wallet.address;
        if let Some(settled) = self.reconcile(address, token).await? {
            return Ok(settled);
        }
        if let Some(recent) = self
            .ledger
            .recent_sweep(&address, &token, Utc::now() - self.cooldown)?
        {
            return Err(SweepError::Cooldown {
                address,
                token,
                sweep_id: recent.id,
            });
        }

        let plan = self.plan(address, master, token).await?;
        let related: Vec<i64> = self
            .ledger
            .unswept_deposits(&address, &token, self.confirmations_required)?
            .iter()
            .map(|d| d.id)
            .collect();

        let sweep = Sweep::processing(
            &wallet.user_id,
            address,
            master,
            token,
            plan.amount,
            plan.observed_balance,
            plan.gas_limit,
            plan.gas_price,
            related,
        );
        self.ledger.insert_sweep(&sweep)?;
        tracing::info!(
            sweep_id = %sweep.id,
            user_id = %wallet.user_id,
            from = %address,
            token = %token,
            amount = %plan.amount,
            gas_limit = plan.gas_limit,
            gas_price = plan.gas_price,
            "Sweep started"
        );

        match self.execute(wallet, &sweep).await {
            Ok(result) => {
                metrics::record_sweep(&token.to_string(), "completed");
                tracing::info!(
                    sweep_id = %result.sweep_id,
                    tx_hash = %result.tx_hash,
                    amount = %result.amount,
                    gas_cost = %result.gas_cost,
                    deposits = result.deposits_swept,
                    "Sweep completed"
                );
                Ok(result)
            }
            Err(e) if e.is_unsettled() => {
                metrics::record_sweep(&token.to_string(), "unconfirmed");
                tracing::warn!(sweep_id = %sweep.id, error = %e, "Sweep broadcast but not confirmed, left processing");
                Err(e)
            }
            Err(e) => {
                metrics::record_sweep(&token.to_string(), "failed");
                if let Err(ledger_err) = self.ledger.fail_sweep(sweep.id, &e.to_string()) {
                    tracing::error!(sweep_id = %sweep.id, error = %ledger_err, "Failed to mark sweep failed");
                }
                tracing::warn!(sweep_id = %sweep.id, error = %e, "Sweep failed");
                Err(e)
            }
        }
    }

    /// Settle the open attempt for a pair, if any, from its receipt.
    ///
    /// Returns the attempt's result once it is mined. A reverted attempt is
    /// failed and a new sweep may proceed. One still pending blocks the pair.
    async fn reconcile(&self, address: Address, token: TokenType) -> Result<Option<SweepResult>, SweepError> {
        let Some(sweep) = self.ledger.outstanding_sweep(&address, &token)? else {
            return Ok(None);
        };
        let Some(tx_hash) = sweep.tx_hash else {
            self.ledger.fail_sweep(sweep.id, "interrupted before broadcast")?;
            tracing::warn!(sweep_id = %sweep.id, from = %address, token = %token, "Sweep never broadcast, marked failed");
            return Ok(None);
        };

        match self.submitter.rpc().transaction_receipt(tx_hash).await? {
            Some(receipt) if receipt.block_number.is_some() && receipt.success => {
                let result = self.finish(&sweep, tx_hash, &receipt)?;
                metrics::record_sweep(&token.to_string(), "completed");
                tracing::info!(
                    sweep_id = %sweep.id,
                    tx_hash = %tx_hash,
                    deposits = result.deposits_swept,
                    "Outstanding sweep confirmed"
                );
                Ok(Some(result))
            }
            Some(receipt) if receipt.block_number.is_some() => {
                self.ledger
                    .fail_sweep(sweep.id, &BlockchainError::Reverted(tx_hash.to_string()).to_string())?;
                metrics::record_sweep(&token.to_string(), "failed");
                tracing::warn!(sweep_id = %sweep.id, tx_hash = %tx_hash, "Outstanding sweep reverted");
                Ok(None)
            }
            _ => Err(SweepError::AwaitingReceipt {
                sweep_id: sweep.id,
                tx_hash,
            }),
        }
    }

    /// Settle every open attempt. Run once before the worker takes jobs so a
    /// restart does not leave mined sweeps unrecorded.
    pub async fn reconcile_outstanding(&self) -> Result<usize, SweepError> {
        let mut settled = 0;
        for sweep in self.ledger.outstanding_sweeps()? {
            match self.reconcile(sweep.from_address, sweep.token).await {
                Ok(Some(_)) => settled += 1,
                Ok(None) => {}
                Err(SweepError::AwaitingReceipt { sweep_id, tx_hash }) => {
                    tracing::info!(sweep_id = %sweep_id, tx_hash = %tx_hash, "Sweep still pending on chain");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(settled)
    }

    async fn plan(&self, address: Address, master: Address, token: TokenType) -> Result<SweepPlan, SweepError> {
        let rpc = self.submitter.rpc().as_ref();
        let gas_price = self.submitter.gas_price().await?;
        let native_balance = rpc.balance(address).await?;

        let balance = match token {
            TokenType::Native => native_balance,
            TokenType::Erc20(_) => token.balance_of(rpc, address).await?,
        };
        if balance.is_zero() {
            return Err(SweepError::NothingToSweep { address, token });
        }

        let gas_limit = token.estimate_gas(rpc, address, master, balance).await?;
        let gas_cost = U256::from(gas_limit) * U256::from(gas_price);

        let amount = match token {
            TokenType::Native => {
                if balance <= gas_cost {
                    return Err(SweepError::InsufficientBalanceForGas {
                        required: gas_cost,
                        available: balance,
                    });
                }
                balance - gas_cost
            }
            TokenType::Erc20(_) => {
                if native_balance < gas_cost {
                    return Err(SweepError::InsufficientBalanceForGas {
                        required: gas_cost,
                        available: native_balance,
                    });
                }
                balance
            }
        };

        Ok(SweepPlan {
            amount,
            observed_balance: balance,
            gas_limit,
            gas_price,
        })
    }

    async fn execute(&self, wallet: &UserWallet, sweep: &Sweep) -> Result<SweepResult, SweepError> {
        let signer = self.registry.signing_wallet(wallet)?;

        let signed = self
            .submitter
            .submit(TransferRequest {
                wallet: signer,
                asset: sweep.token,
                recipient: sweep.to_address,
                amount: sweep.amount,
                gas_limit: sweep.gas_limit,
                gas_price: sweep.gas_price,
            })
            .await
            .map_err(SweepError::Broadcast)?;
        if let Err(e) = self.ledger.set_sweep_tx_hash(sweep.id, &signed.hash) {
            tracing::error!(sweep_id = %sweep.id, tx_hash = %signed.hash, error = %e, "Failed to record sweep hash");
        }
        tracing::debug!(sweep_id = %sweep.id, tx_hash = %signed.hash, nonce = signed.nonce, "Sweep broadcast");

        let receipt = self
            .submitter
            .wait_for_receipt(signed.hash, self.receipt_timeout_secs)
            .await
            .map_err(|source| SweepError::Receipt {
                tx_hash: signed.hash,
                source,
            })?;

        self.finish(sweep, signed.hash, &receipt)
    }

    /// Record a mined sweep and mark the deposits it covered.
    fn finish(&self, sweep: &Sweep, tx_hash: TxHash, receipt: &TxReceipt) -> Result<SweepResult, SweepError> {
        let gas_cost = receipt.fee();
        self.ledger
            .complete_sweep(sweep.id, &tx_hash, receipt.gas_used, gas_cost)?;
        let deposits_swept = self
            .ledger
            .mark_swept(&sweep.related_deposits, &tx_hash, self.confirmations_required)?;

        Ok(SweepResult {
            sweep_id: sweep.id,
            tx_hash,
            token: sweep.token,
            amount: sweep.amount,
            gas_used: receipt.gas_used,
            gas_cost,
            deposits_swept,
        })
    }
}

impl std::fmt::Debug for SweepEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SweepEngine")
            .field("confirmations_required", &self.confirmations_required)
            .field("cooldown_secs", &self.cooldown.num_seconds())
            .finish()
    }
}
