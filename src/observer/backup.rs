//! Balance-based backup scan.
//!
//! Catches deposits the block observer missed (downtime, dropped queue
//! entries) by reading balances directly. Funds still being confirmed by
//! the observer are left to it.

use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::U256;
use chrono::Utc;
use serde_json::json;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc};
use tokio::time;

use crate::blockchain::asset::TokenType;
use crate::blockchain::rpc::ChainRpc;
use crate::config::schema::SweeperConfig;
use crate::custody::WalletRegistry;
use crate::incidents::{ErrorType, IncidentEntity, IncidentManager};
use crate::ledger::Ledger;
use crate::observer::candidates::InFlight;
use crate::sweep::coordinator::{SweepJob, SweepTrigger};

pub struct BackupScanner {
    rpc: Arc<dyn ChainRpc>,
    ledger: Ledger,
    registry: Arc<WalletRegistry>,
    incidents: Arc<IncidentManager>,
    in_flight: InFlight,
    sweeps: mpsc::Sender<SweepJob>,
    /// Asset and the smallest balance worth sweeping.
    thresholds: Vec<(TokenType, U256)>,
    cooldown: chrono::Duration,
    interval: Duration,
}

impl BackupScanner {
    pub fn new(
        rpc: Arc<dyn ChainRpc>,
        ledger: Ledger,
        registry: Arc<WalletRegistry>,
        incidents: Arc<IncidentManager>,
        in_flight: InFlight,
        sweeps: mpsc::Sender<SweepJob>,
        config: &SweeperConfig,
    ) -> Self {
        let thresholds = config
            .token_types()
            .into_iter()
            .map(|token| (token, config.min_sweep_amount(&token)))
            .collect();
        Self {
            rpc,
            ledger,
            registry,
            incidents,
            in_flight,
            sweeps,
            thresholds,
            cooldown: chrono::Duration::seconds(config.sweep.cooldown_secs as i64),
            interval: Duration::from_secs(config.observer.backup_scan_interval_secs.max(1)),
        }
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!(interval_secs = self.interval.as_secs(), "Backup scan starting");

        let mut ticker = time::interval(self.interval);
        // The first tick fires immediately; give the observer a head start.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let queued = self.scan_once().await;
                    if queued > 0 {
                        tracing::info!(queued, "Backup scan queued sweeps");
                    }
                }
                _ = shutdown.recv() => {
                    tracing::info!("Backup scan received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }

    /// Check every wallet and asset once. Returns how many sweeps were queued.
    ///
    /// The scan stops at the first RPC failure and records a single incident
    /// rather than one per wallet.
    pub async fn scan_once(&self) -> usize {
        let since = Utc::now() - self.cooldown;
        let mut queued = 0;
        if let Err(e) = self.registry.refresh() {
            tracing::warn!(error = %e, "Wallet registry refresh failed, scanning cached index");
        }

        for address in self.registry.addresses() {
            let Some(user_id) = self.registry.user_for(&address) else {
                continue;
            };
            for (token, minimum) in &self.thresholds {
                if self.in_flight.contains(&address, token) {
                    tracing::debug!(address = %address, token = %token, "Deposit in flight, leaving to observer");
                    continue;
                }

                let balance = match token.balance_of(self.rpc.as_ref(), address).await {
                    Ok(balance) => balance,
                    Err(e) => {
                        tracing::warn!(address = %address, token = %token, error = %e, "Backup scan aborted");
                        self.incidents.report(
                            ErrorType::RpcError,
                            IncidentEntity::System,
                            format!("backup scan balance check failed: {e}"),
                            json!({ "address": address.to_string(), "token": token.to_string() }),
                        );
                        return queued;
                    }
                };
                if balance.is_zero() || balance < *minimum {
                    continue;
                }

                match self.ledger.recent_sweep(&address, token, since) {
                    Ok(Some(recent)) => {
                        tracing::debug!(address = %address, token = %token, sweep_id = %recent.id, "Swept recently, skipping");
                        continue;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::error!(address = %address, error = %e, "Failed to read sweep history");
                        continue;
                    }
                }

                let job = SweepJob {
                    user_id: user_id.clone(),
                    address,
                    token: *token,
                    trigger: SweepTrigger::BackupScan,
                };
                match self.sweeps.try_send(job) {
                    Ok(()) => {
                        tracing::info!(address = %address, token = %token, balance = %balance, "Backup scan found sweepable balance");
                        queued += 1;
                    }
                    Err(TrySendError::Full(_)) => {
                        tracing::warn!("Sweep queue full, backup scan will retry next round");
                        return queued;
                    }
                    Err(TrySendError::Closed(_)) => return queued,
                }
            }
        }
        queued
    }
}
