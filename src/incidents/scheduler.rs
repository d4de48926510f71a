//! Retry scheduler.
//!
//! # Responsibilities
//! - Periodically pick up PENDING incidents whose retry time has come
//! - Hand each to the part of the pipeline that owns its entity
//! - Count dispatch failures against the incident's retry budget
//!
//! Queued work reports back through [`IncidentManager`]: the observer and the
//! sweep worker resolve the entity on success and record a failure otherwise,
//! which lands on the same IN_PROGRESS incident.

use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::{Address, TxHash};
use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tokio::time;

use crate::blockchain::asset::TokenType;
use crate::blockchain::rpc::ChainRpc;
use crate::custody::WalletRegistry;
use crate::incidents::manager::IncidentManager;
use crate::incidents::types::{ErrorType, IncidentEntity};
use crate::ledger::models::SystemIncident;
use crate::sweep::coordinator::{SweepJob, SweepTrigger};

const BATCH_SIZE: usize = 50;

/// What happened to a dispatched retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Work was queued; its owner reports the result.
    Queued,
    /// The retry ran inline and succeeded.
    Resolved,
}

/// Routes an incident to whoever can redo its work.
#[async_trait]
pub trait RetryDispatcher: Send + Sync {
    async fn dispatch(&self, incident: &SystemIncident) -> Result<DispatchOutcome, String>;
}

/// Background task driving automatic retries.
pub struct RetryScheduler {
    incidents: Arc<IncidentManager>,
    dispatcher: Arc<dyn RetryDispatcher>,
    interval: Duration,
}

impl RetryScheduler {
    pub fn new(incidents: Arc<IncidentManager>, dispatcher: Arc<dyn RetryDispatcher>, interval: Duration) -> Self {
        Self {
            incidents,
            dispatcher,
            interval,
        }
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!(interval_secs = self.interval.as_secs(), "Retry scheduler starting");

        if let Err(e) = self.incidents.requeue_interrupted() {
            tracing::error!(error = %e, "Failed to requeue interrupted incidents");
        }

        let mut ticker = time::interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_once().await;
                }
                _ = shutdown.recv() => {
                    tracing::info!("Retry scheduler received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }

    /// Dispatch every due incident once. Returns how many were dispatched.
    pub async fn run_once(&self) -> usize {
        let due = match self.incidents.due(BATCH_SIZE) {
            Ok(due) => due,
            Err(e) => {
                tracing::error!(error = %e, "Failed to load due incidents");
                return 0;
            }
        };

        let mut dispatched = 0;
        for incident in due {
            match self.incidents.claim(incident.id) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    tracing::error!(incident_id = %incident.id, error = %e, "Failed to claim incident");
                    continue;
                }
            }
            dispatched += 1;

            let result = self.dispatcher.dispatch(&incident).await;
            tracing::debug!(
                incident_id = %incident.id,
                entity_type = %incident.entity_type,
                entity_id = %incident.entity_id,
                result = ?result,
                "Incident dispatched"
            );
            let outcome = match result {
                Ok(DispatchOutcome::Queued) => Ok(()),
                Ok(DispatchOutcome::Resolved) => self
                    .incidents
                    .resolve(incident.id, "retry-scheduler", Some("retry succeeded"))
                    .map(|_| ()),
                Err(message) => self.incidents.retry_failed(incident.id, &message).map(|_| ()),
            };
            if let Err(e) = outcome {
                tracing::error!(incident_id = %incident.id, error = %e, "Failed to update incident after dispatch");
            }
        }
        dispatched
    }
}

/// Dispatcher wired to the running pipeline.
pub struct PipelineDispatcher {
    rpc: Arc<dyn ChainRpc>,
    registry: Arc<WalletRegistry>,
    blocks: mpsc::Sender<u64>,
    sweeps: mpsc::Sender<SweepJob>,
}

impl PipelineDispatcher {
    pub fn new(
        rpc: Arc<dyn ChainRpc>,
        registry: Arc<WalletRegistry>,
        blocks: mpsc::Sender<u64>,
        sweeps: mpsc::Sender<SweepJob>,
    ) -> Self {
        Self {
            rpc,
            registry,
            blocks,
            sweeps,
        }
    }
}

#[async_trait]
impl RetryDispatcher for PipelineDispatcher {
    async fn dispatch(&self, incident: &SystemIncident) -> Result<DispatchOutcome, String> {
        let entity = incident
            .entity()
            .ok_or_else(|| format!("unknown entity {}:{}", incident.entity_type, incident.entity_id))?;

        match entity {
            IncidentEntity::Block(number) => {
                self.blocks
                    .send(number)
                    .await
                    .map_err(|_| "observer stopped".to_string())?;
                Ok(DispatchOutcome::Queued)
            }
            IncidentEntity::Wallet { address, token } => {
                let address: Address = address.parse().map_err(|e| format!("bad wallet address: {e}"))?;
                let token: TokenType = token.parse()?;
                let user_id = self
                    .registry
                    .user_for(&address)
                    .ok_or_else(|| format!("{address} is not a registered wallet"))?;
                self.sweeps
                    .try_send(SweepJob {
                        user_id,
                        address,
                        token,
                        trigger: SweepTrigger::Retry,
                    })
                    .map_err(|e| format!("sweep queue unavailable: {e}"))?;
                Ok(DispatchOutcome::Queued)
            }
            IncidentEntity::Transaction(hash) => {
                let hash: TxHash = hash.parse().map_err(|e| format!("bad transaction hash: {e}"))?;
                self.rpc
                    .transaction_receipt(hash)
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(DispatchOutcome::Resolved)
            }
            IncidentEntity::System if incident.error_type == ErrorType::RpcError => {
                self.rpc.block_number().await.map_err(|e| e.to_string())?;
                Ok(DispatchOutcome::Resolved)
            }
            IncidentEntity::System => Err(format!("no automatic retry for {}", incident.error_type)),
        }
    }
}
