//! Chain head polling.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::{broadcast, mpsc};
use tokio::time;

use crate::blockchain::rpc::ChainRpc;
use crate::blockchain::types::BlockchainResult;
use crate::config::schema::ObserverConfig;
use crate::incidents::{ErrorType, IncidentEntity, IncidentManager};
use crate::observability::metrics;

/// Feeds block numbers to the deposit observer in order.
pub struct BlockPoller {
    rpc: Arc<dyn ChainRpc>,
    incidents: Arc<IncidentManager>,
    next_block: Option<u64>,
    poll_interval: Duration,
    max_blocks_per_poll: u64,
    degraded: bool,
}

impl BlockPoller {
    pub fn new(rpc: Arc<dyn ChainRpc>, incidents: Arc<IncidentManager>, config: &ObserverConfig) -> Self {
        Self {
            rpc,
            incidents,
            next_block: config.start_block,
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            max_blocks_per_poll: config.max_blocks_per_poll.max(1),
            degraded: false,
        }
    }

    pub async fn run(mut self, blocks: mpsc::Sender<u64>, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!(
            start_block = ?self.next_block,
            interval_ms = self.poll_interval.as_millis() as u64,
            "Block poller starting"
        );

        let mut ticker = time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if blocks.is_closed() {
                        tracing::warn!("Deposit observer gone, block poller stopping");
                        break;
                    }
                    let result = self.poll_once(&blocks).await;
                    self.track_health(result);
                }
                _ = shutdown.recv() => {
                    tracing::info!("Block poller received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }

    /// Enqueue every block up to the head, at most `max_blocks_per_poll`.
    ///
    /// The first poll without a configured start block begins at the head.
    pub async fn poll_once(&mut self, blocks: &mpsc::Sender<u64>) -> BlockchainResult<usize> {
        let head = self.rpc.block_number().await?;
        let next = *self.next_block.get_or_insert(head);

        let mut sent = 0;
        let mut number = next;
        while number <= head && (sent as u64) < self.max_blocks_per_poll {
            if blocks.send(number).await.is_err() {
                break;
            }
            sent += 1;
            number += 1;
        }
        self.next_block = Some(number);

        if sent > 0 {
            metrics::record_last_block(number - 1);
            if head >= number {
                tracing::debug!(next = number, head, "Catching up");
            }
        }
        Ok(sent)
    }

    /// Open one incident when polling starts failing and resolve it on recovery.
    fn track_health<T>(&mut self, result: BlockchainResult<T>) {
        metrics::record_rpc_health(result.is_ok());
        match result {
            Ok(_) if self.degraded => {
                self.degraded = false;
                tracing::info!("Head polling recovered");
                self.incidents
                    .resolve_entity(&IncidentEntity::System, "head polling recovered");
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "Failed to fetch chain head");
                if !self.degraded {
                    self.degraded = true;
                    let error_type = if e.is_timeout() {
                        ErrorType::TimeoutError
                    } else {
                        ErrorType::RpcError
                    };
                    self.incidents.report(
                        error_type,
                        IncidentEntity::System,
                        format!("head polling failed: {e}"),
                        json!({ "next_block": self.next_block }),
                    );
                }
            }
        }
    }

    pub fn next_block(&self) -> Option<u64> {
        self.next_block
    }
}
