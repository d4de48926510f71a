//! Incident taxonomy and retry policy.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Upper bound on an exponential retry delay.
pub const MAX_BACKOFF_MS: u64 = 300_000;

/// Base of the exponential retry delay.
pub const BASE_BACKOFF_MS: u64 = 1_000;

/// Delay of the fixed retry strategy.
pub const FIXED_DELAY: Duration = Duration::from_secs(60);

/// What kind of operation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorType {
    RpcError,
    TxFail,
    SweepFail,
    GasFail,
    WalletError,
    ValidationError,
    TimeoutError,
}

/// How urgently an operator should look at an incident.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Lifecycle of an incident.
///
/// ```text
/// PENDING ─retry fails─▶ PENDING | ESCALATED
/// PENDING ─picked up──▶ IN_PROGRESS ─▶ RESOLVED | PENDING | ESCALATED
/// PENDING | ESCALATED ─operator─▶ RESOLVED | IGNORED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IncidentStatus {
    Pending,
    InProgress,
    Resolved,
    Ignored,
    Escalated,
}

/// How long to wait before the next automatic retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RetryStrategy {
    Immediate,
    FixedDelay,
    ExponentialBackoff,
}

impl RetryStrategy {
    /// Delay before retry number `retry_count + 1`.
    ///
    /// Exponential: `min(1000 * 2^retry_count, 300000)` ms.
    pub fn delay(&self, retry_count: u32) -> Duration {
        match self {
            Self::Immediate => Duration::ZERO,
            Self::FixedDelay => FIXED_DELAY,
            Self::ExponentialBackoff => {
                let factor = 2u64.saturating_pow(retry_count);
                Duration::from_millis(BASE_BACKOFF_MS.saturating_mul(factor).min(MAX_BACKOFF_MS))
            }
        }
    }
}

/// What an incident is about; stored as `entity_type` / `entity_id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IncidentEntity {
    /// A block the observer could not process.
    Block(u64),
    /// A user wallet and asset; the id is `address:token`.
    Wallet { address: String, token: String },
    /// A specific transaction.
    Transaction(String),
    /// Nothing in particular (configuration, startup).
    System,
}

impl IncidentEntity {
    pub fn entity_type(&self) -> &'static str {
        match self {
            Self::Block(_) => "block",
            Self::Wallet { .. } => "wallet",
            Self::Transaction(_) => "transaction",
            Self::System => "system",
        }
    }

    pub fn entity_id(&self) -> String {
        match self {
            Self::Block(number) => number.to_string(),
            Self::Wallet { address, token } => format!("{address}:{token}"),
            Self::Transaction(hash) => hash.clone(),
            Self::System => String::new(),
        }
    }

    /// Rebuild from the stored columns.
    pub fn from_parts(entity_type: &str, entity_id: &str) -> Option<Self> {
        match entity_type {
            "block" => entity_id.parse().ok().map(Self::Block),
            "wallet" => entity_id.split_once(':').map(|(address, token)| Self::Wallet {
                address: address.to_string(),
                token: token.to_string(),
            }),
            "transaction" => Some(Self::Transaction(entity_id.to_string())),
            "system" => Some(Self::System),
            _ => None,
        }
    }
}

macro_rules! string_enum {
    ($ty:ty { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl ::std::fmt::Display for $ty {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl ::std::str::FromStr for $ty {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(format!("unknown {}: {}", stringify!($ty), other)),
                }
            }
        }
    };
}

pub(crate) use string_enum;

string_enum!(ErrorType {
    RpcError => "RPC_ERROR",
    TxFail => "TX_FAIL",
    SweepFail => "SWEEP_FAIL",
    GasFail => "GAS_FAIL",
    WalletError => "WALLET_ERROR",
    ValidationError => "VALIDATION_ERROR",
    TimeoutError => "TIMEOUT_ERROR",
});

string_enum!(Severity {
    Low => "LOW",
    Medium => "MEDIUM",
    High => "HIGH",
    Critical => "CRITICAL",
});

string_enum!(IncidentStatus {
    Pending => "PENDING",
    InProgress => "IN_PROGRESS",
    Resolved => "RESOLVED",
    Ignored => "IGNORED",
    Escalated => "ESCALATED",
});

string_enum!(RetryStrategy {
    Immediate => "IMMEDIATE",
    FixedDelay => "FIXED_DELAY",
    ExponentialBackoff => "EXPONENTIAL_BACKOFF",
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_calculation() {
        let s = RetryStrategy::ExponentialBackoff;
        assert_eq!(s.delay(0), Duration::from_millis(1_000));
        assert_eq!(s.delay(1), Duration::from_millis(2_000));
        assert_eq!(s.delay(4), Duration::from_millis(16_000));
        assert_eq!(s.delay(9), Duration::from_millis(300_000));
        assert_eq!(s.delay(200), Duration::from_millis(300_000));

        assert_eq!(RetryStrategy::Immediate.delay(7), Duration::ZERO);
        assert_eq!(RetryStrategy::FixedDelay.delay(7), Duration::from_secs(60));
    }

    #[test]
    fn test_string_forms() {
        assert_eq!(ErrorType::RpcError.to_string(), "RPC_ERROR");
        assert_eq!("SWEEP_FAIL".parse::<ErrorType>().unwrap(), ErrorType::SweepFail);
        assert_eq!("IN_PROGRESS".parse::<IncidentStatus>().unwrap(), IncidentStatus::InProgress);
        assert!("resolved".parse::<IncidentStatus>().is_err());

        let json = serde_json::to_string(&RetryStrategy::FixedDelay).unwrap();
        assert_eq!(json, "\"FIXED_DELAY\"");
    }

    #[test]
    fn test_entity_round_trip() {
        let entity = IncidentEntity::Wallet {
            address: "0xabc".to_string(),
            token: "native".to_string(),
        };
        let rebuilt = IncidentEntity::from_parts(entity.entity_type(), &entity.entity_id());
        assert_eq!(rebuilt, Some(entity));
        assert_eq!(IncidentEntity::from_parts("block", "42"), Some(IncidentEntity::Block(42)));
        assert_eq!(IncidentEntity::from_parts("block", "x"), None);
    }
}
