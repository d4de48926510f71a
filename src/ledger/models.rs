//! Ledger records.

use std::fmt;
use std::str::FromStr;

use alloy::primitives::{Address, TxHash, U256};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::blockchain::asset::TokenType;
use crate::incidents::types::{
    string_enum, ErrorType, IncidentEntity, IncidentStatus, RetryStrategy, Severity,
};

/// Deposit lifecycle as recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DepositStatus {
    Pending,
    Confirmed,
    /// Never mined within the candidate window.
    Failed,
    /// Mined with a failed receipt.
    Reverted,
}

/// Sweep lifecycle; `Completed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl SweepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Who initiated a gas top-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SupplyType {
    Auto,
    Manual,
}

/// Outcome of a gas top-up transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupplyStatus {
    Completed,
    Failed,
}

/// Operator top-up request lifecycle; everything but `Pending` and
/// `Processing` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GasRequestStatus {
    Pending,
    Processing,
    Completed,
    /// The wallet already held the minimum.
    Skipped,
    Failed,
}

string_enum!(DepositStatus {
    Pending => "pending",
    Confirmed => "confirmed",
    Failed => "failed",
    Reverted => "reverted",
});

string_enum!(SweepStatus {
    Pending => "pending",
    Processing => "processing",
    Completed => "completed",
    Failed => "failed",
});

string_enum!(SupplyType {
    Auto => "AUTO",
    Manual => "MANUAL",
});

string_enum!(SupplyStatus {
    Completed => "completed",
    Failed => "failed",
});

string_enum!(GasRequestStatus {
    Pending => "pending",
    Processing => "processing",
    Completed => "completed",
    Skipped => "skipped",
    Failed => "failed",
});

/// A user's custodial deposit wallet.
#[derive(Clone, Serialize, Deserialize)]
pub struct UserWallet {
    pub user_id: String,
    pub address: Address,
    /// Uncompressed SEC1 public key, hex.
    pub public_key: String,
    pub encrypted_private_key: String,
    pub derivation_path: String,
    pub created_at: DateTime<Utc>,
}

impl fmt::Debug for UserWallet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserWallet")
            .field("user_id", &self.user_id)
            .field("address", &self.address)
            .field("derivation_path", &self.derivation_path)
            .finish()
    }
}

/// A deposit about to be recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewDeposit {
    pub tx_hash: TxHash,
    /// Log index for token transfers, 0 for native transfers.
    pub log_index: u64,
    pub token: TokenType,
    pub from_address: Address,
    pub to_address: Address,
    pub user_id: String,
    pub amount: U256,
    pub block_number: u64,
    pub confirmations: u64,
    pub status: DepositStatus,
}

/// One on-chain transfer into a user address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deposit {
    pub id: i64,
    pub tx_hash: TxHash,
    pub log_index: u64,
    pub token: TokenType,
    pub from_address: Address,
    pub to_address: Address,
    pub user_id: String,
    pub amount: U256,
    pub block_number: u64,
    pub confirmations: u64,
    pub status: DepositStatus,
    pub swept: bool,
    pub sweep_tx_hash: Option<TxHash>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One consolidation attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sweep {
    pub id: Uuid,
    pub user_id: String,
    pub from_address: Address,
    pub to_address: Address,
    pub token: TokenType,
    pub amount: U256,
    /// Native balance (or token balance) observed when the sweep was planned.
    pub observed_balance: U256,
    pub gas_limit: u64,
    pub gas_price: u128,
    pub gas_used: Option<u64>,
    pub gas_cost: U256,
    pub tx_hash: Option<TxHash>,
    pub status: SweepStatus,
    pub error: Option<String>,
    pub related_deposits: Vec<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One gas top-up sent to a user wallet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GasSupplyLog {
    pub id: Uuid,
    pub to_address: Address,
    pub from_address: Address,
    pub amount: U256,
    pub tx_hash: Option<TxHash>,
    pub supply_type: SupplyType,
    pub trigger_type: String,
    pub operator: Option<String>,
    pub balance_before: U256,
    pub balance_after: U256,
    pub status: SupplyStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// An operator top-up waiting for the daemon, which owns the master nonce.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GasRequest {
    pub id: Uuid,
    pub to_address: Address,
    /// Target balance; the configured minimum when absent.
    pub min_required: Option<U256>,
    pub operator: String,
    pub status: GasRequestStatus,
    pub supply_log_id: Option<Uuid>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An incident about to be recorded.
#[derive(Debug, Clone)]
pub struct NewIncident {
    pub error_type: ErrorType,
    pub severity: Severity,
    pub message: String,
    pub details: serde_json::Value,
    pub entity: IncidentEntity,
    pub max_retries: u32,
    pub retry_strategy: RetryStrategy,
}

/// One operational failure and its retry state.
#[derive(Debug, Clone, Serialize)]
pub struct SystemIncident {
    pub id: Uuid,
    pub error_type: ErrorType,
    pub severity: Severity,
    pub message: String,
    pub details: serde_json::Value,
    pub entity_type: String,
    pub entity_id: String,
    pub retry_count: u32,
    pub max_retries: u32,
    pub retry_strategy: RetryStrategy,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub is_escalated: bool,
    pub status: IncidentStatus,
    pub resolved_by: Option<String>,
    pub resolution_note: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SystemIncident {
    pub fn entity(&self) -> Option<IncidentEntity> {
        IncidentEntity::from_parts(&self.entity_type, &self.entity_id)
    }
}

/// Parse helper shared by the row mappers.
pub(crate) fn parse_field<T>(value: &str) -> Result<T, String>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    value.parse::<T>().map_err(|e| format!("'{value}': {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_strings() {
        assert_eq!(DepositStatus::Reverted.to_string(), "reverted");
        assert_eq!("processing".parse::<SweepStatus>().unwrap(), SweepStatus::Processing);
        assert_eq!(SupplyType::Manual.as_str(), "MANUAL");
        assert!(SweepStatus::Failed.is_terminal());
        assert!(!SweepStatus::Processing.is_terminal());
        assert_eq!("skipped".parse::<GasRequestStatus>().unwrap(), GasRequestStatus::Skipped);
    }

    #[test]
    fn test_user_wallet_debug_hides_key() {
        let wallet = UserWallet {
            user_id: "u1".to_string(),
            address: Address::ZERO,
            public_key: "04ab".to_string(),
            encrypted_private_key: "v1:secret".to_string(),
            derivation_path: "m/44'/60'/1'/2/3".to_string(),
            created_at: Utc::now(),
        };
        assert!(!format!("{wallet:?}").contains("secret"));
    }
}
