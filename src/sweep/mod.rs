//! Sweep subsystem.
//!
//! # Data Flow
//! ```text
//! SweepJob (deposit confirmed | backup scan | retry | operator)
//!     → SweepCoordinator (single worker)
//!     → SweepEngine::sweep
//!         └─ token wallet short on gas → GasTopUpEngine::ensure_gas → sweep once more
//!     → sweeps / gas_supply_logs, deposits marked swept
//!     → failures → IncidentManager
//!
//! gas_requests (written by the CLI) → TopUpRequestWorker → GasTopUpEngine
//! ```
//!
//! # Security Constraints
//! - User keys are decrypted only inside `SweepEngine` and only for the
//!   duration of one submission
//! - Sweeps only ever send to the configured master address

pub mod coordinator;
pub mod engine;
pub mod gas;
pub mod requests;

pub use coordinator::{JobOutcome, SweepCoordinator, SweepJob, SweepTrigger};
pub use engine::{SweepEngine, SweepError, SweepResult};
pub use gas::{gas_report, GasError, GasHealth, GasTopUpEngine, TopUpOutcome, TopUpResult, WalletGas};
pub use requests::TopUpRequestWorker;
