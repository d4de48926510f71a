//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Load config → Read secrets → Build components → Spawn tasks
//!
//! Shutdown (shutdown.rs):
//!     Signal received → Broadcast → Tasks leave their loops → Drain with deadline
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger graceful shutdown
//! ```
//!
//! # Design Decisions
//! - Ordered startup: config first, then chain, ledger, custody, tasks
//! - Shutdown has a deadline: tasks still running are aborted

pub mod shutdown;
pub mod signals;
pub mod startup;

pub use shutdown::{drain, Shutdown};
pub use signals::wait_for_signal;
pub use startup::{Components, Secrets, StartupError};
