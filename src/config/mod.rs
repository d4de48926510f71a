//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → SweeperConfig (validated, immutable)
//!     → shared via Arc to all subsystems
//!
//! secrets (seed phrase, encryption secret)
//!     → environment variables named by CustodyConfig
//!     → loader::read_secret at startup only
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks
//! - Startup fails fast on any validation error

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, ConfigError};
pub use schema::{
    BlockchainConfig, CustodyConfig, GasConfig, IncidentConfig, LedgerConfig, ObservabilityConfig,
    ObserverConfig, SweepConfig, SweeperConfig, TokenConfig,
};
