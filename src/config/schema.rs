//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the sweeper.
//! All types derive Serde traits for deserialization from config files.
//! Secrets are not part of the schema; only the names of the environment
//! variables holding them are.

use alloy::primitives::utils::{parse_ether, parse_units};
use alloy::primitives::{Address, U256};
use serde::{Deserialize, Serialize};

use crate::blockchain::asset::TokenType;
use crate::incidents::types::RetryStrategy;

/// Root configuration for the sweeper.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct SweeperConfig {
    /// RPC endpoints and transaction settings.
    pub blockchain: BlockchainConfig,

    /// Master seed and key encryption settings.
    pub custody: CustodyConfig,

    /// Block observer settings.
    pub observer: ObserverConfig,

    /// Sweep engine settings.
    pub sweep: SweepConfig,

    /// Gas top-up settings.
    pub gas: GasConfig,

    /// Incident retry policy.
    pub incidents: IncidentConfig,

    /// Ledger database location.
    pub ledger: LedgerConfig,

    /// Logging and metrics.
    pub observability: ObservabilityConfig,

    /// ERC-20 tokens accepted as deposits.
    pub tokens: Vec<TokenConfig>,
}

impl SweeperConfig {
    /// Every asset the pipeline watches, native first.
    pub fn token_types(&self) -> Vec<TokenType> {
        let mut types = vec![TokenType::Native];
        types.extend(
            self.tokens
                .iter()
                .filter_map(|t| t.contract.parse::<Address>().ok())
                .map(TokenType::Erc20),
        );
        types
    }

    /// Contract addresses of all configured tokens.
    pub fn token_contracts(&self) -> Vec<Address> {
        self.token_types().iter().filter_map(TokenType::contract).collect()
    }

    /// Smallest balance worth sweeping for an asset, in base units.
    pub fn min_sweep_amount(&self, token: &TokenType) -> U256 {
        match token {
            TokenType::Native => parse_ether(&self.sweep.min_native_sweep).unwrap_or(U256::ZERO),
            TokenType::Erc20(contract) => self
                .tokens
                .iter()
                .find(|t| t.contract.parse::<Address>().ok() == Some(*contract))
                .and_then(|t| parse_units(&t.min_sweep_amount, t.decimals).ok())
                .map(|units| units.get_absolute())
                .unwrap_or(U256::ZERO),
        }
    }
}

/// Blockchain integration configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BlockchainConfig {
    /// JSON-RPC endpoint URL.
    pub rpc_url: String,

    /// Failover JSON-RPC endpoint URLs.
    pub failover_urls: Vec<String>,

    /// Chain ID (e.g., 1 for Ethereum mainnet, 31337 for local Anvil).
    pub chain_id: u64,

    /// RPC request timeout in seconds.
    pub rpc_timeout_secs: u64,

    /// Number of block confirmations required for finality.
    pub confirmation_blocks: u64,

    /// Gas price multiplier (1.0 = estimated, 1.2 = 20% buffer).
    pub gas_price_multiplier: f64,

    /// Maximum gas price in gwei (protection against spikes).
    pub max_gas_price_gwei: u64,

    /// Receipt polling interval in milliseconds.
    pub receipt_poll_ms: u64,

    /// How long to wait for a broadcast transaction to be mined.
    pub receipt_timeout_secs: u64,
}

impl Default for BlockchainConfig {
    fn default() -> Self {
        Self {
            rpc_url: "http://localhost:8545".to_string(),
            failover_urls: Vec::new(),
            chain_id: 1,
            rpc_timeout_secs: 10,
            confirmation_blocks: 6,
            gas_price_multiplier: 1.2,
            max_gas_price_gwei: 500,
            receipt_poll_ms: 2000,
            receipt_timeout_secs: 180,
        }
    }
}

/// Master seed and encryption settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CustodyConfig {
    /// Environment variable holding the BIP-39 master seed phrase.
    pub seed_env_var: String,

    /// Environment variable holding the key-encryption secret.
    pub encryption_secret_env_var: String,

    /// Derivation path of the master (collection) wallet.
    pub master_derivation_path: String,

    /// Sweep destination override; defaults to the master wallet address.
    pub master_address: Option<String>,
}

impl Default for CustodyConfig {
    fn default() -> Self {
        Self {
            seed_env_var: "SWEEPER_MASTER_SEED".to_string(),
            encryption_secret_env_var: "SWEEPER_ENCRYPTION_SECRET".to_string(),
            master_derivation_path: "m/44'/60'/0'/0/0".to_string(),
            master_address: None,
        }
    }
}

/// Block observer configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObserverConfig {
    /// Enable the block observer.
    pub enabled: bool,

    /// Head polling interval in milliseconds.
    pub poll_interval_ms: u64,

    /// First block to process; defaults to the head at startup.
    pub start_block: Option<u64>,

    /// Capacity of the seen-transaction cache.
    pub dedup_capacity: usize,

    /// Blocks a candidate may wait for its receipt before it is recorded as failed.
    pub candidate_ttl_blocks: u64,

    /// Upper bound on blocks enqueued per poll when catching up.
    pub max_blocks_per_poll: u64,

    /// Interval of the balance-based backup scan in seconds.
    pub backup_scan_interval_secs: u64,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_ms: 3000,
            start_block: None,
            dedup_capacity: 10_000,
            candidate_ttl_blocks: 50,
            max_blocks_per_poll: 100,
            backup_scan_interval_secs: 30,
        }
    }
}

/// Sweep engine configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SweepConfig {
    /// Enable automatic sweeping.
    pub enabled: bool,

    /// A user/token pair is not swept again within this window.
    pub cooldown_secs: u64,

    /// Native balances below this (in ether units) are left alone by the backup scan.
    pub min_native_sweep: String,

    /// Depth of the sweep job queue.
    pub queue_depth: usize,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cooldown_secs: 600,
            min_native_sweep: "0.001".to_string(),
            queue_depth: 256,
        }
    }
}

/// Gas top-up configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GasConfig {
    /// Minimum native balance a user wallet should hold (ether units).
    pub min_gas_balance: String,

    /// Fixed amount sent per top-up (ether units).
    pub top_up_amount: String,

    /// How often the daemon picks up operator top-up requests.
    pub request_poll_secs: u64,
}

impl GasConfig {
    pub fn min_gas_balance_wei(&self) -> U256 {
        parse_ether(&self.min_gas_balance).unwrap_or(U256::ZERO)
    }

    pub fn top_up_amount_wei(&self) -> U256 {
        parse_ether(&self.top_up_amount).unwrap_or(U256::ZERO)
    }
}

impl Default for GasConfig {
    fn default() -> Self {
        Self {
            min_gas_balance: "0.0003".to_string(),
            top_up_amount: "0.0005".to_string(),
            request_poll_secs: 5,
        }
    }
}

/// Incident retry configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct IncidentConfig {
    /// Retries before an incident escalates.
    pub max_retries: u32,

    /// Strategy for transient failures.
    pub retry_strategy: RetryStrategy,

    /// How often the retry scheduler looks for due incidents.
    pub scheduler_interval_secs: u64,
}

impl Default for IncidentConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_strategy: RetryStrategy::ExponentialBackoff,
            scheduler_interval_secs: 15,
        }
    }
}

/// Ledger database configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// SQLite file path.
    pub path: String,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            path: "custody-ledger.db".to_string(),
        }
    }
}

/// Observability settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// `pretty` or `json`.
    pub log_format: String,

    /// Filter used when `RUST_LOG` is unset.
    pub log_filter: String,

    /// Enable the Prometheus exporter.
    pub metrics_enabled: bool,

    /// Prometheus listen address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_format: "pretty".to_string(),
            log_filter: "custody_sweeper=info".to_string(),
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9100".to_string(),
        }
    }
}

/// An accepted ERC-20 token.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TokenConfig {
    /// Display symbol (e.g. "USDT").
    pub symbol: String,

    /// Contract address.
    pub contract: String,

    /// Token decimals.
    pub decimals: u8,

    /// Balances below this (in token units) are left alone by the backup scan.
    #[serde(default = "default_min_token_sweep")]
    pub min_sweep_amount: String,
}

fn default_min_token_sweep() -> String {
    "1".to_string()
}
