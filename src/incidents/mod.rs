//! Incident and retry subsystem.
//!
//! # Data Flow
//! ```text
//! observer / sweep worker / gas top-up
//!     → IncidentManager::record (open, or count a failed retry)
//!     → system_incidents
//!     → RetryScheduler (due PENDING incidents)
//!     → RetryDispatcher (re-enqueue block, re-queue sweep, recheck RPC)
//!     → owner resolves the entity or records the next failure
//! ```
//!
//! # Design Decisions
//! - `retry_count` only grows; escalation is terminal for automation
//! - Wallet and validation failures escalate on creation
//! - Operators close incidents; nothing reopens a closed one

pub mod manager;
pub mod scheduler;
pub mod types;

pub use manager::IncidentManager;
pub use scheduler::{DispatchOutcome, PipelineDispatcher, RetryDispatcher, RetryScheduler};
pub use types::{ErrorType, IncidentEntity, IncidentStatus, RetryStrategy, Severity};
