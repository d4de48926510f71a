//! Blockchain integration subsystem.
//!
//! # Data Flow
//! ```text
//! config (RPC URLs, chain id, gas limits)
//!     → client.rs (alloy providers with failover and timeouts)
//!     → rpc.rs (ChainRpc: the seam every other subsystem talks to)
//!     → asset.rs (native vs ERC-20 transfer building and balances)
//!     → transaction.rs (single signing actor, nonces, receipts)
//! ```
//!
//! # Security Constraints
//! - Never log private keys or sensitive data
//! - All RPC calls have configurable timeouts
//! - Only the submission actor signs; nothing else builds transactions

pub mod asset;
pub mod client;
pub mod rpc;
pub mod transaction;
pub mod types;
pub mod wallet;

pub use asset::TokenType;
pub use client::BlockchainClient;
pub use rpc::ChainRpc;
pub use transaction::{SubmitterHandle, TransferRequest, TxSubmitter};
pub use types::{BlockchainConfig, BlockchainError, BlockchainResult};
pub use wallet::Wallet;
