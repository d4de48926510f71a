//! Startup orchestration.
//!
//! # Responsibilities
//! - Read secrets and build every subsystem from a validated config
//! - Spawn the pipeline tasks wired together by channels
//!
//! # Design Decisions
//! - Fail fast: a wrong chain, an unusable seed or an unreadable ledger is fatal
//! - Subsystems initialize in order, not concurrently
//! - Tasks start only after everything they depend on exists

use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::Address;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use zeroize::Zeroizing;

use crate::blockchain::asset::token_metadata;
use crate::blockchain::client::BlockchainClient;
use crate::blockchain::rpc::ChainRpc;
use crate::blockchain::transaction::{SubmitterHandle, TxSubmitter};
use crate::blockchain::types::BlockchainError;
use crate::blockchain::wallet::Wallet;
use crate::config::loader::{read_secret, ConfigError};
use crate::config::schema::{CustodyConfig, SweeperConfig};
use crate::custody::{CustodyError, KeyDeriver, WalletRegistry};
use crate::incidents::{IncidentManager, PipelineDispatcher, RetryScheduler};
use crate::ledger::{Ledger, LedgerError};
use crate::lifecycle::shutdown::Shutdown;
use crate::observer::{BackupScanner, BlockPoller, DepositObserver, InFlight, ObserverSettings};
use crate::service::CustodyService;
use crate::sweep::{GasTopUpEngine, SweepCoordinator, SweepEngine, TopUpRequestWorker};

/// Depth of the block-number queue between poller and observer.
const BLOCK_QUEUE_DEPTH: usize = 1024;

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("blockchain error: {0}")]
    Blockchain(#[from] BlockchainError),

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("custody error: {0}")]
    Custody(#[from] CustodyError),

    #[error("invalid master address '{0}'")]
    MasterAddress(String),

    #[error("token {contract} has {onchain} decimals on chain, configured {configured}")]
    TokenDecimals {
        contract: Address,
        configured: u8,
        onchain: u8,
    },
}

/// Configured decimals must match the contract; amounts are parsed with them.
///
/// A contract that does not answer is only logged.
async fn verify_tokens(rpc: &dyn ChainRpc, config: &SweeperConfig) -> Result<(), StartupError> {
    for token in &config.tokens {
        let Ok(contract) = token.contract.parse::<Address>() else {
            continue;
        };
        match token_metadata(rpc, contract).await {
            Ok((symbol, decimals)) => {
                if decimals != token.decimals {
                    return Err(StartupError::TokenDecimals {
                        contract,
                        configured: token.decimals,
                        onchain: decimals,
                    });
                }
                if symbol != token.symbol {
                    tracing::warn!(%contract, configured = %token.symbol, onchain = %symbol, "Token symbol differs");
                }
            }
            Err(e) => tracing::warn!(%contract, error = %e, "Token metadata unavailable"),
        }
    }
    Ok(())
}

/// Secrets read from the environment at startup.
pub struct Secrets {
    seed_phrase: Zeroizing<String>,
    encryption_secret: Zeroizing<String>,
}

impl Secrets {
    pub fn new(seed_phrase: &str, encryption_secret: &str) -> Self {
        Self {
            seed_phrase: Zeroizing::new(seed_phrase.to_string()),
            encryption_secret: Zeroizing::new(encryption_secret.to_string()),
        }
    }

    pub fn from_env(config: &CustodyConfig) -> Result<Self, ConfigError> {
        let seed_phrase = Zeroizing::new(read_secret(&config.seed_env_var)?);
        let encryption_secret = Zeroizing::new(read_secret(&config.encryption_secret_env_var)?);
        Ok(Self {
            seed_phrase,
            encryption_secret,
        })
    }
}

impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Secrets(..)")
    }
}

/// Everything built from configuration, before any task runs.
pub struct Components {
    pub config: SweeperConfig,
    pub rpc: Arc<dyn ChainRpc>,
    pub ledger: Ledger,
    pub registry: Arc<WalletRegistry>,
    pub incidents: Arc<IncidentManager>,
    /// Signs gas top-ups.
    pub master_wallet: Wallet,
    /// Destination of every sweep.
    pub master_address: Address,
}

impl Components {
    /// Connect to the chain, verify it and build the rest.
    pub async fn build(config: SweeperConfig, secrets: &Secrets) -> Result<Self, StartupError> {
        let client = BlockchainClient::new(config.blockchain.clone()).await?;
        client.verify_chain_id().await?;
        verify_tokens(&client, &config).await?;
        Self::with_rpc(config, Arc::new(client), secrets)
    }

    /// Build on an existing chain connection.
    pub fn with_rpc(config: SweeperConfig, rpc: Arc<dyn ChainRpc>, secrets: &Secrets) -> Result<Self, StartupError> {
        let ledger = Ledger::open(&config.ledger.path)?;
        let deriver = Arc::new(KeyDeriver::new(
            &secrets.seed_phrase,
            &secrets.encryption_secret,
            config.blockchain.chain_id,
        )?);
        let registry = Arc::new(WalletRegistry::load(ledger.clone(), Arc::clone(&deriver))?);

        let master_wallet = deriver.master_wallet(&config.custody.master_derivation_path)?;
        let master_address = match &config.custody.master_address {
            Some(address) => address
                .parse::<Address>()
                .map_err(|_| StartupError::MasterAddress(address.clone()))?,
            None => master_wallet.address(),
        };
        let incidents = Arc::new(IncidentManager::new(ledger.clone(), &config.incidents));

        tracing::info!(
            master = %master_address,
            gas_wallet = %master_wallet.address(),
            wallets = registry.len(),
            "Custody components ready"
        );
        Ok(Self {
            config,
            rpc,
            ledger,
            registry,
            incidents,
            master_wallet,
            master_address,
        })
    }

    pub fn service(&self) -> CustodyService {
        CustodyService::new(Arc::clone(&self.rpc), self.ledger.clone(), Arc::clone(&self.registry))
    }

    pub fn gas_engine(&self, submitter: SubmitterHandle) -> GasTopUpEngine {
        GasTopUpEngine::new(
            submitter,
            self.ledger.clone(),
            self.master_wallet.clone(),
            &self.config.gas,
            self.config.blockchain.receipt_timeout_secs,
        )
    }

    /// Spawn the pipeline. Every task stops on `shutdown`.
    pub fn spawn(&self, shutdown: &Shutdown) -> Vec<(&'static str, JoinHandle<()>)> {
        let config = &self.config;
        let mut tasks = Vec::new();

        let (submitter, submitter_task) =
            TxSubmitter::spawn(Arc::clone(&self.rpc), &config.blockchain, shutdown.subscribe());

        let (block_tx, block_rx) = mpsc::channel(BLOCK_QUEUE_DEPTH);
        let (sweep_tx, sweep_rx) = mpsc::channel(config.sweep.queue_depth.max(1));
        let in_flight = InFlight::default();

        if config.observer.enabled {
            let observer = DepositObserver::new(
                Arc::clone(&self.rpc),
                self.ledger.clone(),
                Arc::clone(&self.registry),
                Arc::clone(&self.incidents),
                sweep_tx.clone(),
                in_flight.clone(),
                ObserverSettings::from_config(config)
                    .ignoring([self.master_wallet.address(), self.master_address]),
            );
            tasks.push(("observer", tokio::spawn(observer.run(block_rx, shutdown.subscribe()))));

            let poller = BlockPoller::new(Arc::clone(&self.rpc), Arc::clone(&self.incidents), &config.observer);
            tasks.push(("poller", tokio::spawn(poller.run(block_tx.clone(), shutdown.subscribe()))));

            let scanner = BackupScanner::new(
                Arc::clone(&self.rpc),
                self.ledger.clone(),
                Arc::clone(&self.registry),
                Arc::clone(&self.incidents),
                in_flight.clone(),
                sweep_tx.clone(),
                config,
            );
            tasks.push(("backup_scan", tokio::spawn(scanner.run(shutdown.subscribe()))));
        } else {
            tracing::info!("Block observer disabled");
        }

        if config.sweep.enabled {
            let engine = Arc::new(SweepEngine::new(
                submitter.clone(),
                self.ledger.clone(),
                Arc::clone(&self.registry),
                config.blockchain.confirmation_blocks,
                config.sweep.cooldown_secs,
                config.blockchain.receipt_timeout_secs,
            ));
            let gas = Arc::new(self.gas_engine(submitter.clone()));
            let coordinator = SweepCoordinator::new(
                engine,
                Arc::clone(&gas),
                Arc::clone(&self.registry),
                Arc::clone(&self.incidents),
                in_flight,
                self.master_address,
            );
            tasks.push(("sweeper", tokio::spawn(coordinator.run(sweep_rx, shutdown.subscribe()))));

            let requests = TopUpRequestWorker::new(gas, self.ledger.clone(), config.gas.request_poll_secs);
            tasks.push(("top_up_requests", tokio::spawn(requests.run(shutdown.subscribe()))));
        } else {
            tracing::info!("Automatic sweeping disabled");
        }

        let dispatcher = PipelineDispatcher::new(Arc::clone(&self.rpc), Arc::clone(&self.registry), block_tx, sweep_tx);
        let scheduler = RetryScheduler::new(
            Arc::clone(&self.incidents),
            Arc::new(dispatcher),
            Duration::from_secs(config.incidents.scheduler_interval_secs.max(1)),
        );
        tasks.push(("retry_scheduler", tokio::spawn(scheduler.run(shutdown.subscribe()))));

        tasks.push(("submitter", submitter_task));
        tasks
    }
}

impl std::fmt::Debug for Components {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Components")
            .field("master_address", &self.master_address)
            .field("wallets", &self.registry.len())
            .finish()
    }
}
