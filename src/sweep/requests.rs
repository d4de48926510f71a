//! Operator top-ups queued by the CLI.
//!
//! The CLI is a separate process and must not sign from the master wallet:
//! the submitter in this process caches the master nonce. Requests are
//! written to the ledger instead and executed here through that submitter.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time;
use uuid::Uuid;

use crate::ledger::models::{GasRequest, GasRequestStatus};
use crate::ledger::Ledger;
use crate::sweep::gas::{GasTopUpEngine, TopUpOutcome};

/// Requests executed per poll.
const BATCH_SIZE: usize = 16;

pub struct TopUpRequestWorker {
    gas: Arc<GasTopUpEngine>,
    ledger: Ledger,
    interval: Duration,
}

impl TopUpRequestWorker {
    pub fn new(gas: Arc<GasTopUpEngine>, ledger: Ledger, poll_secs: u64) -> Self {
        Self {
            gas,
            ledger,
            interval: Duration::from_secs(poll_secs.max(1)),
        }
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!(interval_secs = self.interval.as_secs(), "Top-up request worker starting");
        match self
            .ledger
            .abandon_gas_requests("interrupted by restart; check the gas log before resubmitting")
        {
            Ok(0) => {}
            Ok(abandoned) => tracing::warn!(abandoned, "Interrupted top-up requests marked failed"),
            Err(e) => tracing::error!(error = %e, "Failed to clear interrupted top-up requests"),
        }

        let mut ticker = time::interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.process_pending().await;
                }
                _ = shutdown.recv() => {
                    tracing::info!("Top-up request worker received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }

    /// Execute queued requests. Returns how many were finished.
    pub async fn process_pending(&self) -> usize {
        let requests = match self.ledger.pending_gas_requests(BATCH_SIZE) {
            Ok(requests) => requests,
            Err(e) => {
                tracing::error!(error = %e, "Failed to read top-up requests");
                return 0;
            }
        };

        let mut finished = 0;
        for request in requests {
            match self.ledger.claim_gas_request(request.id) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    tracing::error!(request_id = %request.id, error = %e, "Failed to claim top-up request");
                    continue;
                }
            }

            let (status, log_id, error) = self.execute(&request).await;
            match self
                .ledger
                .finish_gas_request(request.id, status, log_id, error.as_deref())
            {
                Ok(()) => finished += 1,
                Err(e) => tracing::error!(request_id = %request.id, error = %e, "Failed to record top-up request outcome"),
            }
        }
        finished
    }

    async fn execute(&self, request: &GasRequest) -> (GasRequestStatus, Option<Uuid>, Option<String>) {
        match self.ledger.wallet_by_address(&request.to_address) {
            Ok(Some(_)) => {}
            Ok(None) => {
                return (
                    GasRequestStatus::Failed,
                    None,
                    Some(format!("{} is not a user deposit wallet", request.to_address)),
                )
            }
            Err(e) => return (GasRequestStatus::Failed, None, Some(e.to_string())),
        }

        let min_required = request.min_required.unwrap_or_else(|| self.gas.min_gas_balance());
        tracing::info!(
            request_id = %request.id,
            to = %request.to_address,
            operator = %request.operator,
            "Executing operator top-up"
        );
        match self
            .gas
            .manual_top_up(request.to_address, min_required, &request.operator)
            .await
        {
            Ok(TopUpOutcome::ToppedUp(result)) => (GasRequestStatus::Completed, Some(result.log_id), None),
            Ok(TopUpOutcome::NoActionNeeded { balance }) => {
                tracing::info!(request_id = %request.id, balance = %balance, "Wallet above minimum, request skipped");
                (GasRequestStatus::Skipped, None, None)
            }
            Err(e) => (GasRequestStatus::Failed, None, Some(e.to_string())),
        }
    }
}

impl std::fmt::Debug for TopUpRequestWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopUpRequestWorker")
            .field("interval_secs", &self.interval.as_secs())
            .finish()
    }
}
