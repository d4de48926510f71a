//! Sweep worker: one consumer of sweep jobs from every trigger.

use std::sync::Arc;

use alloy::primitives::Address;
use serde_json::json;
use tokio::sync::{broadcast, mpsc};

use crate::blockchain::asset::TokenType;
use crate::custody::{CustodyError, WalletRegistry};
use crate::incidents::{ErrorType, IncidentEntity, IncidentManager};
use crate::ledger::models::UserWallet;
use crate::observer::candidates::InFlight;
use crate::sweep::engine::{SweepEngine, SweepError, SweepResult};
use crate::sweep::gas::{GasTopUpEngine, TopUpOutcome};

/// Why a sweep was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepTrigger {
    Deposit,
    BackupScan,
    Retry,
    Manual,
}

impl SweepTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deposit => "deposit",
            Self::BackupScan => "backup_scan",
            Self::Retry => "retry",
            Self::Manual => "manual",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepJob {
    pub user_id: String,
    pub address: Address,
    pub token: TokenType,
    pub trigger: SweepTrigger,
}

impl SweepJob {
    /// Incident entity for failures of this job.
    pub fn entity(&self) -> IncidentEntity {
        IncidentEntity::Wallet {
            address: self.address.to_string().to_lowercase(),
            token: self.token.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Swept(SweepResult),
    /// Nothing to do: cooldown, empty balance or native dust.
    Skipped,
    /// A deposit to the wallet is still confirming; its own job sweeps it.
    Deferred,
    /// Recorded as an incident.
    Failed,
}

pub struct SweepCoordinator {
    engine: Arc<SweepEngine>,
    gas: Arc<GasTopUpEngine>,
    registry: Arc<WalletRegistry>,
    incidents: Arc<IncidentManager>,
    in_flight: InFlight,
    master: Address,
}

impl SweepCoordinator {
    pub fn new(
        engine: Arc<SweepEngine>,
        gas: Arc<GasTopUpEngine>,
        registry: Arc<WalletRegistry>,
        incidents: Arc<IncidentManager>,
        in_flight: InFlight,
        master: Address,
    ) -> Self {
        Self {
            engine,
            gas,
            registry,
            incidents,
            in_flight,
            master,
        }
    }

    pub async fn run(self, mut jobs: mpsc::Receiver<SweepJob>, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!(master = %self.master, "Sweep worker starting");
        match self.engine.reconcile_outstanding().await {
            Ok(0) => {}
            Ok(settled) => tracing::info!(settled, "Outstanding sweeps settled"),
            Err(e) => tracing::warn!(error = %e, "Outstanding sweeps not settled, retried per pair"),
        }
        loop {
            tokio::select! {
                job = jobs.recv() => {
                    let Some(job) = job else {
                        break;
                    };
                    self.handle(job).await;
                }
                _ = shutdown.recv() => {
                    tracing::info!("Sweep worker received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }

    pub async fn handle(&self, job: SweepJob) -> JobOutcome {
        tracing::debug!(
            user_id = %job.user_id,
            address = %job.address,
            token = %job.token,
            trigger = job.trigger.as_str(),
            "Sweep job received"
        );

        // A sweep moves the whole balance, including funds that are not
        // final yet and whose deposit row does not exist.
        if self.in_flight.contains(&job.address, &job.token) {
            tracing::debug!(
                address = %job.address,
                token = %job.token,
                trigger = job.trigger.as_str(),
                "Deposit still confirming, sweep deferred"
            );
            return JobOutcome::Deferred;
        }

        let wallet = match self.wallet_for(&job) {
            Ok(wallet) => wallet,
            Err((error_type, message)) => {
                self.incidents.report(
                    error_type,
                    job.entity(),
                    message,
                    json!({ "user_id": job.user_id, "trigger": job.trigger.as_str() }),
                );
                return JobOutcome::Failed;
            }
        };

        let first = self.engine.sweep(&wallet, self.master, job.token).await;
        let result = match first {
            Err(SweepError::InsufficientBalanceForGas { required, available }) if !job.token.is_native() => {
                let min_required = required.max(self.gas.min_gas_balance());
                tracing::info!(
                    address = %job.address,
                    token = %job.token,
                    required = %required,
                    available = %available,
                    "Wallet short on gas, topping up before sweep"
                );
                match self.gas.ensure_gas(job.address, min_required).await {
                    Ok(TopUpOutcome::ToppedUp(top_up)) => {
                        tracing::debug!(log_id = %top_up.log_id, "Top-up done, retrying sweep");
                        self.engine.sweep(&wallet, self.master, job.token).await
                    }
                    Ok(TopUpOutcome::NoActionNeeded { balance }) => {
                        tracing::warn!(
                            address = %job.address,
                            balance = %balance,
                            required = %required,
                            "Wallet holds the gas minimum but not the transfer cost"
                        );
                        self.engine.sweep(&wallet, self.master, job.token).await
                    }
                    Err(e) => {
                        self.incidents.report(
                            e.error_type(),
                            job.entity(),
                            format!("gas top-up before sweep failed: {e}"),
                            json!({ "required": required.to_string(), "trigger": job.trigger.as_str() }),
                        );
                        return JobOutcome::Failed;
                    }
                }
            }
            other => other,
        };

        match result {
            Ok(result) => {
                self.incidents.resolve_entity(&job.entity(), "sweep completed");
                JobOutcome::Swept(result)
            }
            Err(e) if e.is_skip() => {
                tracing::debug!(address = %job.address, token = %job.token, reason = %e, "Sweep skipped");
                self.incidents.resolve_entity(&job.entity(), "nothing left to sweep");
                JobOutcome::Skipped
            }
            Err(SweepError::InsufficientBalanceForGas { required, available }) if job.token.is_native() => {
                tracing::info!(
                    address = %job.address,
                    balance = %available,
                    gas_cost = %required,
                    "Native balance does not cover gas, leaving dust"
                );
                self.incidents.resolve_entity(&job.entity(), "balance below gas cost");
                JobOutcome::Skipped
            }
            Err(e) => {
                self.incidents.report(
                    e.error_type(),
                    job.entity(),
                    e.to_string(),
                    json!({ "user_id": job.user_id, "trigger": job.trigger.as_str() }),
                );
                JobOutcome::Failed
            }
        }
    }

    fn wallet_for(&self, job: &SweepJob) -> Result<UserWallet, (ErrorType, String)> {
        let wallet = self
            .registry
            .wallet(&job.user_id)
            .map_err(|e| {
                let error_type = match &e {
                    CustodyError::Ledger(ledger) => ledger.error_type(),
                    _ => ErrorType::WalletError,
                };
                (error_type, format!("wallet lookup failed: {e}"))
            })?
            .ok_or_else(|| (ErrorType::ValidationError, format!("no wallet for user {}", job.user_id)))?;
        if wallet.address != job.address {
            return Err((
                ErrorType::ValidationError,
                format!("job address {} does not belong to user {}", job.address, job.user_id),
            ));
        }
        Ok(wallet)
    }
}
