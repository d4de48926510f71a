//! Deposit detection.
//!
//! # Responsibilities
//! - Consume block numbers from the poller (and from retries)
//! - Pick out native and token transfers into user addresses
//! - Track each as a candidate until it is final, reverted or expired
//! - Record the outcome once and queue a sweep for confirmed deposits
//!
//! A failed block is recorded as an incident and skipped; the next block
//! proceeds and the retry scheduler re-enqueues the failed one later.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use alloy::primitives::{Address, TxHash, U256};
use serde_json::json;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc};

use crate::blockchain::asset::TokenType;
use crate::blockchain::rpc::ChainRpc;
use crate::blockchain::types::{BlockchainError, TokenTransfer, TxReceipt};
use crate::config::schema::SweeperConfig;
use crate::custody::WalletRegistry;
use crate::incidents::{ErrorType, IncidentEntity, IncidentManager};
use crate::ledger::models::{DepositStatus, NewDeposit};
use crate::ledger::{Ledger, LedgerError};
use crate::observability::metrics;
use crate::observer::candidates::{Candidate, InFlight, TransferKey, Transition};
use crate::observer::dedup::SeenCache;
use crate::sweep::coordinator::{SweepJob, SweepTrigger};

/// Errors that fail a whole block.
#[derive(Debug, Error)]
pub enum ObserverError {
    #[error("block {0} not available from the node")]
    BlockNotFound(u64),

    #[error(transparent)]
    Rpc(#[from] BlockchainError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl ObserverError {
    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::Rpc(e) if e.is_timeout() => ErrorType::TimeoutError,
            Self::Rpc(_) | Self::BlockNotFound(_) => ErrorType::RpcError,
            Self::Ledger(e) => e.error_type(),
        }
    }
}

/// What one block contributed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockReport {
    pub block: u64,
    pub head: u64,
    pub candidates_added: usize,
    pub duplicates_skipped: usize,
    pub deposits_recorded: usize,
}

/// Observer tuning taken from configuration.
#[derive(Debug, Clone)]
pub struct ObserverSettings {
    pub confirmations_required: u64,
    pub candidate_ttl_blocks: u64,
    pub dedup_capacity: usize,
    pub token_contracts: Vec<Address>,
    /// Native transfers from these addresses are gas top-ups, not deposits.
    pub ignored_senders: Vec<Address>,
}

impl ObserverSettings {
    pub fn from_config(config: &SweeperConfig) -> Self {
        Self {
            confirmations_required: config.blockchain.confirmation_blocks,
            candidate_ttl_blocks: config.observer.candidate_ttl_blocks,
            dedup_capacity: config.observer.dedup_capacity,
            token_contracts: config.token_contracts(),
            ignored_senders: Vec::new(),
        }
    }

    pub fn ignoring(mut self, senders: impl IntoIterator<Item = Address>) -> Self {
        self.ignored_senders.extend(senders);
        self
    }
}

pub struct DepositObserver {
    rpc: Arc<dyn ChainRpc>,
    ledger: Ledger,
    registry: Arc<WalletRegistry>,
    incidents: Arc<IncidentManager>,
    sweeps: mpsc::Sender<SweepJob>,
    settings: ObserverSettings,
    seen: SeenCache<TransferKey>,
    candidates: HashMap<TransferKey, Candidate>,
    in_flight: InFlight,
    receipt_failures: HashSet<TxHash>,
}

impl DepositObserver {
    pub fn new(
        rpc: Arc<dyn ChainRpc>,
        ledger: Ledger,
        registry: Arc<WalletRegistry>,
        incidents: Arc<IncidentManager>,
        sweeps: mpsc::Sender<SweepJob>,
        in_flight: InFlight,
        settings: ObserverSettings,
    ) -> Self {
        Self {
            rpc,
            ledger,
            registry,
            incidents,
            sweeps,
            seen: SeenCache::new(settings.dedup_capacity),
            settings,
            candidates: HashMap::new(),
            in_flight,
            receipt_failures: HashSet::new(),
        }
    }

    pub async fn run(mut self, mut blocks: mpsc::Receiver<u64>, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!(
            confirmations = self.settings.confirmations_required,
            tokens = self.settings.token_contracts.len(),
            "Deposit observer starting"
        );
        loop {
            tokio::select! {
                number = blocks.recv() => {
                    let Some(number) = number else {
                        break;
                    };
                    self.handle_block(number).await;
                }
                _ = shutdown.recv() => {
                    tracing::info!("Deposit observer received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }

    /// Process a block and turn the outcome into incident bookkeeping.
    pub async fn handle_block(&mut self, number: u64) {
        match self.on_new_block(number).await {
            Ok(report) => {
                if report.candidates_added > 0 || report.deposits_recorded > 0 {
                    tracing::info!(
                        block = number,
                        head = report.head,
                        candidates = report.candidates_added,
                        deposits = report.deposits_recorded,
                        "Block processed"
                    );
                }
                self.incidents
                    .resolve_entity(&IncidentEntity::Block(number), "block processed");
            }
            Err(e) => {
                tracing::warn!(block = number, error = %e, "Block failed, skipping");
                self.incidents.report(
                    e.error_type(),
                    IncidentEntity::Block(number),
                    e.to_string(),
                    json!({ "block": number }),
                );
            }
        }
    }

    /// Scan one block for transfers into user addresses and re-check every
    /// tracked candidate against the current head.
    pub async fn on_new_block(&mut self, number: u64) -> Result<BlockReport, ObserverError> {
        if let Err(e) = self.registry.refresh() {
            tracing::warn!(block = number, error = %e, "Wallet registry refresh failed, using cached index");
        }
        let head = self.rpc.block_number().await?;
        let block = self
            .rpc
            .block_with_transactions(number)
            .await?
            .ok_or(ObserverError::BlockNotFound(number))?;
        let transfers = if self.settings.token_contracts.is_empty() {
            Vec::new()
        } else {
            self.rpc
                .token_transfers(&self.settings.token_contracts, number, number)
                .await?
        };

        let mut report = BlockReport {
            block: number,
            head,
            ..Default::default()
        };

        for tx in &block.transactions {
            let Some(to) = tx.to else {
                continue;
            };
            if tx.value.is_zero() || self.settings.ignored_senders.contains(&tx.from) {
                continue;
            }
            let Some(user_id) = self.registry.user_for(&to) else {
                continue;
            };
            let key = TransferKey {
                tx_hash: tx.hash,
                token: TokenType::Native,
                log_index: 0,
            };
            if self.track(key, user_id, tx.from, to, tx.value, number)? {
                report.candidates_added += 1;
            } else {
                report.duplicates_skipped += 1;
            }
        }

        let (added, skipped) = self.on_token_transfers(&transfers)?;
        report.candidates_added += added;
        report.duplicates_skipped += skipped;

        report.deposits_recorded = self.check_candidates(head).await;
        Ok(report)
    }

    /// Track `Transfer` logs into user addresses. Returns (added, skipped).
    pub fn on_token_transfers(&mut self, transfers: &[TokenTransfer]) -> Result<(usize, usize), ObserverError> {
        let mut added = 0;
        let mut skipped = 0;
        for transfer in transfers {
            if transfer.value.is_zero() {
                continue;
            }
            let Some(user_id) = self.registry.user_for(&transfer.to) else {
                continue;
            };
            let key = TransferKey {
                tx_hash: transfer.tx_hash,
                token: TokenType::Erc20(transfer.token),
                log_index: transfer.log_index,
            };
            if self.track(key, user_id, transfer.from, transfer.to, transfer.value, transfer.block_number)? {
                added += 1;
            } else {
                skipped += 1;
            }
        }
        Ok((added, skipped))
    }

    fn track(
        &mut self,
        key: TransferKey,
        user_id: String,
        from: Address,
        to: Address,
        amount: U256,
        block: u64,
    ) -> Result<bool, ObserverError> {
        if self.seen.contains(&key) || self.candidates.contains_key(&key) {
            return Ok(false);
        }
        if self.ledger.transfer_recorded(&key.tx_hash, &key.token, key.log_index)? {
            self.seen.insert(key);
            return Ok(false);
        }

        tracing::debug!(
            tx_hash = %key.tx_hash,
            token = %key.token,
            to = %to,
            amount = %amount,
            "Candidate deposit seen"
        );
        self.seen.insert(key);
        self.in_flight.add(to, key.token);
        self.candidates
            .insert(key, Candidate::new(key, user_id, from, to, amount, block));
        metrics::record_tracked_candidates(self.candidates.len());
        Ok(true)
    }

    /// Advance every candidate. Returns how many deposits were recorded.
    pub async fn check_candidates(&mut self, head: u64) -> usize {
        let mut receipts: HashMap<TxHash, Option<TxReceipt>> = HashMap::new();
        let mut recorded = 0;

        let keys: Vec<TransferKey> = self.candidates.keys().copied().collect();
        for key in keys {
            let receipt = match receipts.get(&key.tx_hash) {
                Some(receipt) => receipt.clone(),
                None => match self.fetch_receipt(key.tx_hash).await {
                    Some(receipt) => {
                        receipts.insert(key.tx_hash, receipt.clone());
                        receipt
                    }
                    None => continue,
                },
            };

            let Some(candidate) = self.candidates.get_mut(&key) else {
                continue;
            };
            let transition = candidate.advance(
                receipt.as_ref(),
                head,
                self.settings.confirmations_required,
                self.settings.candidate_ttl_blocks,
            );
            let candidate = candidate.clone();

            let outcome = match transition {
                Transition::Waiting => continue,
                Transition::Reorged => {
                    tracing::warn!(tx_hash = %key.tx_hash, "Receipt disappeared, candidate back to awaiting receipt");
                    continue;
                }
                Transition::Confirmed {
                    block_number,
                    confirmations,
                } => (DepositStatus::Confirmed, block_number, confirmations),
                Transition::Reverted { block_number } => (DepositStatus::Reverted, block_number, 0),
                Transition::Expired => (DepositStatus::Failed, candidate.first_seen_block, 0),
            };

            let (status, block_number, confirmations) = outcome;
            match self.persist(&candidate, status, block_number, confirmations) {
                Ok(inserted) => {
                    // Released before queueing: the sweep worker defers
                    // while a pair is in flight.
                    self.candidates.remove(&key);
                    self.in_flight.remove(candidate.to, key.token);
                    if inserted && status == DepositStatus::Confirmed {
                        recorded += 1;
                        self.enqueue_sweep(&candidate);
                    }
                }
                Err(e) => {
                    tracing::error!(tx_hash = %key.tx_hash, error = %e, "Failed to record deposit, will retry");
                }
            }
        }

        metrics::record_tracked_candidates(self.candidates.len());
        recorded
    }

    /// `None` when the RPC failed; the candidate is re-checked next block.
    async fn fetch_receipt(&mut self, tx_hash: TxHash) -> Option<Option<TxReceipt>> {
        let entity = IncidentEntity::Transaction(tx_hash.to_string());
        match self.rpc.transaction_receipt(tx_hash).await {
            Ok(receipt) => {
                if self.receipt_failures.remove(&tx_hash) {
                    self.incidents.resolve_entity(&entity, "receipt fetched");
                }
                Some(receipt)
            }
            Err(e) => {
                tracing::warn!(tx_hash = %tx_hash, error = %e, "Receipt fetch failed");
                self.receipt_failures.insert(tx_hash);
                let error_type = if e.is_timeout() {
                    ErrorType::TimeoutError
                } else {
                    ErrorType::RpcError
                };
                self.incidents
                    .report(error_type, entity, e.to_string(), json!({ "tx_hash": tx_hash.to_string() }));
                None
            }
        }
    }

    fn persist(
        &self,
        candidate: &Candidate,
        status: DepositStatus,
        block_number: u64,
        confirmations: u64,
    ) -> Result<bool, LedgerError> {
        let deposit = NewDeposit {
            tx_hash: candidate.key.tx_hash,
            log_index: candidate.key.log_index,
            token: candidate.key.token,
            from_address: candidate.from,
            to_address: candidate.to,
            user_id: candidate.user_id.clone(),
            amount: candidate.amount,
            block_number,
            confirmations,
            status,
        };
        let Some(id) = self.ledger.insert_deposit(&deposit)? else {
            tracing::debug!(tx_hash = %deposit.tx_hash, "Deposit already recorded");
            return Ok(false);
        };

        metrics::record_deposit(&deposit.token.to_string(), status.as_str());
        tracing::info!(
            deposit_id = id,
            tx_hash = %deposit.tx_hash,
            user_id = %deposit.user_id,
            token = %deposit.token,
            amount = %deposit.amount,
            status = %status,
            confirmations,
            "Deposit recorded"
        );
        Ok(true)
    }

    fn enqueue_sweep(&self, candidate: &Candidate) {
        let job = SweepJob {
            user_id: candidate.user_id.clone(),
            address: candidate.to,
            token: candidate.key.token,
            trigger: SweepTrigger::Deposit,
        };
        match self.sweeps.try_send(job) {
            Ok(()) => {}
            Err(TrySendError::Full(job)) => tracing::warn!(
                address = %job.address,
                token = %job.token,
                "Sweep queue full, backup scan will pick this up"
            ),
            Err(TrySendError::Closed(_)) => tracing::warn!("Sweep worker stopped, sweep not queued"),
        }
    }

    pub fn tracked_candidates(&self) -> usize {
        self.candidates.len()
    }

    pub fn candidate(&self, key: &TransferKey) -> Option<&Candidate> {
        self.candidates.get(key)
    }
}

impl std::fmt::Debug for DepositObserver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DepositObserver")
            .field("settings", &self.settings)
            .field("candidates", &self.candidates.len())
            .field("seen", &self.seen.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_error_classification() {
        assert_eq!(ObserverError::BlockNotFound(7).error_type(), ErrorType::RpcError);
        assert_eq!(
            ObserverError::Rpc(BlockchainError::Timeout(10)).error_type(),
            ErrorType::TimeoutError
        );
        // A locked ledger is retried like a slow node.
        assert_eq!(ObserverError::Ledger(LedgerError::Lock).error_type(), ErrorType::TimeoutError);
        assert_eq!(
            ObserverError::Ledger(LedgerError::Conflict("duplicate".to_string())).error_type(),
            ErrorType::ValidationError
        );
    }
}
