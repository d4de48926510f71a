//! Custodial deposit sweeper library.
//!
//! Watches a chain for deposits into per-user HD wallets, records them once
//! final, and consolidates the funds into a master wallet, topping up gas
//! where a wallet cannot pay for its own sweep.

pub mod blockchain;
pub mod config;
pub mod custody;
pub mod incidents;
pub mod ledger;
pub mod lifecycle;
pub mod observability;
pub mod observer;
pub mod service;
pub mod sweep;

pub use config::schema::SweeperConfig;
pub use lifecycle::Shutdown;
pub use service::CustodyService;
