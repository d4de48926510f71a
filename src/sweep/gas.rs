//! Gas top-ups from the master wallet.
//!
//! A user wallet pays its own sweep fees, so a token-only wallet must first
//! receive native currency. Only wallets below the configured minimum are
//! topped up; a caller's larger requirement raises the amount sent, never
//! the threshold. Every top-up that reaches the chain (or fails on
//! the way) leaves a `gas_supply_logs` row with the balances around it.

use alloy::primitives::{Address, TxHash, U256};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::blockchain::asset::TokenType;
use crate::blockchain::rpc::ChainRpc;
use crate::blockchain::transaction::{SubmitterHandle, TransferRequest};
use crate::blockchain::types::BlockchainError;
use crate::blockchain::wallet::Wallet;
use crate::config::schema::GasConfig;
use crate::incidents::ErrorType;
use crate::ledger::models::{GasSupplyLog, SupplyStatus, SupplyType, UserWallet};
use crate::ledger::{Ledger, LedgerError};
use crate::observability::metrics;

/// Trigger recorded for top-ups issued ahead of a sweep.
pub const TRIGGER_SWEEP_GAS: &str = "SWEEP_GAS";

/// Trigger recorded for operator top-ups.
pub const TRIGGER_MANUAL: &str = "MANUAL";

#[derive(Debug, Error)]
pub enum GasError {
    #[error("master wallet {address} holds {available} wei, top-up needs {required} wei")]
    MasterBalanceTooLow {
        address: Address,
        required: U256,
        available: U256,
    },

    #[error("RPC error: {0}")]
    Rpc(#[from] BlockchainError),

    #[error("top-up broadcast failed: {0}")]
    Broadcast(BlockchainError),

    #[error("top-up {tx_hash} not confirmed: {source}")]
    Receipt {
        tx_hash: TxHash,
        #[source]
        source: BlockchainError,
    },

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

impl GasError {
    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::MasterBalanceTooLow { .. } => ErrorType::GasFail,
            Self::Rpc(e) if e.is_timeout() => ErrorType::TimeoutError,
            Self::Rpc(_) => ErrorType::RpcError,
            Self::Broadcast(_) => ErrorType::TxFail,
            Self::Receipt { source, .. } if source.is_timeout() => ErrorType::TimeoutError,
            Self::Receipt { .. } => ErrorType::GasFail,
            Self::Ledger(e) => e.error_type(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopUpResult {
    pub log_id: Uuid,
    pub tx_hash: TxHash,
    pub amount: U256,
    pub balance_before: U256,
    pub balance_after: U256,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopUpOutcome {
    /// The wallet already holds at least the configured minimum.
    NoActionNeeded { balance: U256 },
    ToppedUp(TopUpResult),
}

/// Native balance relative to the configured minimum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GasHealth {
    Ok,
    /// Below the minimum.
    Low,
    /// Below half the minimum.
    Critical,
}

impl GasHealth {
    pub fn classify(balance: U256, minimum: U256) -> Self {
        if balance < minimum / U256::from(2u8) {
            Self::Critical
        } else if balance < minimum {
            Self::Low
        } else {
            Self::Ok
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Low => "LOW",
            Self::Critical => "CRITICAL",
        }
    }
}

/// One row of the gas health report.
#[derive(Debug, Clone, Serialize)]
pub struct WalletGas {
    pub user_id: String,
    pub address: Address,
    pub balance: U256,
    pub health: GasHealth,
}

pub struct GasTopUpEngine {
    submitter: SubmitterHandle,
    ledger: Ledger,
    master: Wallet,
    min_gas_balance: U256,
    top_up_amount: U256,
    receipt_timeout_secs: u64,
}

impl GasTopUpEngine {
    pub fn new(
        submitter: SubmitterHandle,
        ledger: Ledger,
        master: Wallet,
        config: &GasConfig,
        receipt_timeout_secs: u64,
    ) -> Self {
        Self {
            submitter,
            ledger,
            master,
            min_gas_balance: config.min_gas_balance_wei(),
            top_up_amount: config.top_up_amount_wei(),
            receipt_timeout_secs,
        }
    }

    pub fn min_gas_balance(&self) -> U256 {
        self.min_gas_balance
    }

    pub fn master_address(&self) -> Address {
        self.master.address()
    }

    /// Top `address` up to at least `min_required` if it holds less than the
    /// configured minimum.
    pub async fn ensure_gas(&self, address: Address, min_required: U256) -> Result<TopUpOutcome, GasError> {
        self.supply(address, min_required, SupplyType::Auto, TRIGGER_SWEEP_GAS, None)
            .await
    }

    /// Operator top-up. Still a no-op for a wallet at or above the minimum.
    pub async fn manual_top_up(
        &self,
        address: Address,
        min_required: U256,
        operator: &str,
    ) -> Result<TopUpOutcome, GasError> {
        self.supply(address, min_required, SupplyType::Manual, TRIGGER_MANUAL, Some(operator))
            .await
    }

    async fn supply(
        &self,
        address: Address,
        min_required: U256,
        supply_type: SupplyType,
        trigger: &str,
        operator: Option<&str>,
    ) -> Result<TopUpOutcome, GasError> {
        let rpc = self.submitter.rpc().as_ref();
        let before = rpc.balance(address).await?;
        if before >= self.min_gas_balance {
            tracing::debug!(address = %address, balance = %before, "Gas sufficient, no top-up");
            return Ok(TopUpOutcome::NoActionNeeded { balance: before });
        }

        let target = min_required.max(self.min_gas_balance);
        let amount = self.top_up_amount.max(target - before);
        let master = self.master.address();
        let gas_price = self.submitter.gas_price().await?;
        let gas_limit = TokenType::Native.estimate_gas(rpc, master, address, amount).await?;
        let required = amount + U256::from(gas_limit) * U256::from(gas_price);

        let available = rpc.balance(master).await?;
        if available < required {
            let err = GasError::MasterBalanceTooLow {
                address: master,
                required,
                available,
            };
            self.log_failure(address, amount, None, supply_type, trigger, operator, before, &err);
            return Err(err);
        }

        tracing::info!(
            to = %address,
            amount = %amount,
            balance = %before,
            supply_type = %supply_type,
            "Sending gas top-up"
        );
        let signed = match self
            .submitter
            .submit(TransferRequest {
                wallet: self.master.clone(),
                asset: TokenType::Native,
                recipient: address,
                amount,
                gas_limit,
                gas_price,
            })
            .await
        {
            Ok(signed) => signed,
            Err(e) => {
                let err = GasError::Broadcast(e);
                self.log_failure(address, amount, None, supply_type, trigger, operator, before, &err);
                return Err(err);
            }
        };

        if let Err(source) = self
            .submitter
            .wait_for_receipt(signed.hash, self.receipt_timeout_secs)
            .await
        {
            let err = GasError::Receipt {
                tx_hash: signed.hash,
                source,
            };
            self.log_failure(address, amount, Some(signed.hash), supply_type, trigger, operator, before, &err);
            return Err(err);
        }

        let after = match rpc.balance(address).await {
            Ok(balance) => balance,
            Err(e) => {
                tracing::warn!(address = %address, error = %e, "Balance after top-up unavailable, assuming credited");
                before + amount
            }
        };
        let log = GasSupplyLog::new(
            address,
            master,
            amount,
            Some(signed.hash),
            supply_type,
            trigger,
            operator.map(str::to_string),
            before,
            after,
            SupplyStatus::Completed,
            None,
        );
        self.ledger.insert_gas_supply(&log)?;
        metrics::record_gas_topup(supply_type.as_str(), SupplyStatus::Completed.as_str());
        tracing::info!(
            log_id = %log.id,
            to = %address,
            tx_hash = %signed.hash,
            balance_before = %before,
            balance_after = %after,
            "Gas top-up completed"
        );

        Ok(TopUpOutcome::ToppedUp(TopUpResult {
            log_id: log.id,
            tx_hash: signed.hash,
            amount,
            balance_before: before,
            balance_after: after,
        }))
    }

    #[allow(clippy::too_many_arguments)]
    fn log_failure(
        &self,
        address: Address,
        amount: U256,
        tx_hash: Option<TxHash>,
        supply_type: SupplyType,
        trigger: &str,
        operator: Option<&str>,
        before: U256,
        err: &GasError,
    ) {
        metrics::record_gas_topup(supply_type.as_str(), SupplyStatus::Failed.as_str());
        tracing::warn!(to = %address, amount = %amount, error = %err, "Gas top-up failed");
        let log = GasSupplyLog::new(
            address,
            self.master.address(),
            amount,
            tx_hash,
            supply_type,
            trigger,
            operator.map(str::to_string),
            before,
            before,
            SupplyStatus::Failed,
            Some(err.to_string()),
        );
        if let Err(e) = self.ledger.insert_gas_supply(&log) {
            tracing::error!(to = %address, error = %e, "Failed to record gas supply failure");
        }
    }

}

/// Native balance and health of every wallet, worst first.
///
/// Read-only: it needs a chain connection, not the master key.
pub async fn gas_report(
    rpc: &dyn ChainRpc,
    wallets: &[UserWallet],
    minimum: U256,
) -> Result<Vec<WalletGas>, GasError> {
    let mut report = Vec::with_capacity(wallets.len());
    for wallet in wallets {
        let balance = rpc.balance(wallet.address).await?;
        report.push(WalletGas {
            user_id: wallet.user_id.clone(),
            address: wallet.address,
            balance,
            health: GasHealth::classify(balance, minimum),
        });
    }
    report.sort_by_key(|w| (severity_rank(w.health), w.balance));
    Ok(report)
}

fn severity_rank(health: GasHealth) -> u8 {
    match health {
        GasHealth::Critical => 0,
        GasHealth::Low => 1,
        GasHealth::Ok => 2,
    }
}

impl std::fmt::Debug for GasTopUpEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GasTopUpEngine")
            .field("master", &self.master.address())
            .field("min_gas_balance", &self.min_gas_balance)
            .field("top_up_amount", &self.top_up_amount)
            .finish()
    }
}
