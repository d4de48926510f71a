//! Custody subsystem: deterministic user wallets and their keys.
//!
//! # Data Flow
//! ```text
//! master seed (env) ──▶ KeyDeriver ──▶ DerivedWallet ──▶ WalletRegistry ──▶ user_wallets
//!                          │                                   │
//!                          └── master_wallet()                 └── address index (observer)
//!
//! user_wallets row ──▶ KeyDeriver::signing_wallet ──▶ Wallet (sweep signing only)
//! ```
//!
//! # Security
//! - The seed phrase and the encryption secret are read from the environment
//!   once at startup and held in zeroizing buffers
//! - Private keys are stored encrypted and bound to their owner
//! - Nothing in this module logs key material

pub mod cipher;
pub mod keys;
pub mod registry;
pub mod types;

pub use cipher::KeyCipher;
pub use keys::{derivation_path, KeyDeriver};
pub use registry::WalletRegistry;
pub use types::{CustodyError, CustodyResult, DecryptionError, DerivedWallet};
