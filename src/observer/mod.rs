//! Deposit observation subsystem.
//!
//! # Data Flow
//! ```text
//! BlockPoller (head every poll interval)
//!     → block numbers (mpsc, also fed by the retry scheduler)
//!     → DepositObserver (native txs + Transfer logs into user addresses)
//!     → candidates until final → deposits table → SweepJob
//!
//! BackupScanner (every scan interval)
//!     → balances of every wallet/asset → SweepJob
//! ```
//!
//! # Design Decisions
//! - Confirmations are re-derived from the head on every check, so reorgs
//!   are absorbed by re-evaluation instead of explicit rollback
//! - The seen cache is bounded; the ledger's unique key is the real guard
//! - Candidates are kept in memory only and rebuilt by rescanning

pub mod backup;
pub mod candidates;
pub mod dedup;
pub mod deposits;
pub mod poller;

pub use backup::BackupScanner;
pub use candidates::{Candidate, CandidateState, InFlight, TransferKey, Transition};
pub use deposits::{BlockReport, DepositObserver, ObserverError, ObserverSettings};
pub use poller::BlockPoller;
