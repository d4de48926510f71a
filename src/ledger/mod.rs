//! Persistent internal ledger.
//!
//! # Data Flow
//! ```text
//! KeyDeriver ──▶ user_wallets      (once per user, immutable)
//! Observer   ──▶ deposits          (once per tx/token/log index)
//! SweepEngine ─▶ sweeps            (one row per attempt) ──▶ deposits.swept
//! GasTopUp   ──▶ gas_supply_logs   (one row per top-up)
//! CLI        ──▶ gas_requests      (operator top-ups, executed by the daemon)
//! everyone   ──▶ system_incidents  (retry / escalation state)
//! ```
//!
//! # Design Decisions
//! - One SQLite connection behind a mutex; calls are short and synchronous
//! - Deposits and sweeps are append-only; only status columns change
//! - Uniqueness and transition guards live in SQL so that a replayed block
//!   or a racing retry cannot double-record or double-sweep

pub mod deposits;
pub mod gas_requests;
pub mod gas_supply;
pub mod incidents;
pub mod models;
pub mod reports;
pub mod store;
pub mod sweeps;
pub mod wallets;

pub use models::{
    Deposit, DepositStatus, GasRequest, GasRequestStatus, GasSupplyLog, NewDeposit, NewIncident,
    SupplyStatus, SupplyType, Sweep, SweepStatus, SystemIncident, UserWallet,
};
pub use reports::LedgerSummary;
pub use store::{Ledger, LedgerError, LedgerResult};
