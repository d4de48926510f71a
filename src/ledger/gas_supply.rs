//! Gas top-up log.

use alloy::primitives::{Address, TxHash, U256};
use chrono::Utc;
use rusqlite::{params, Row};
use uuid::Uuid;

use crate::ledger::models::{GasSupplyLog, SupplyStatus, SupplyType};
use crate::ledger::store::{address_key, parsed, parsed_opt, timestamp, to_millis, Ledger, LedgerResult};

const GAS_COLUMNS: &str = "id, to_address, from_address, amount, tx_hash, supply_type, trigger_type, \
     operator, balance_before, balance_after, status, error, created_at";

fn gas_from_row(row: &Row<'_>) -> rusqlite::Result<GasSupplyLog> {
    Ok(GasSupplyLog {
        id: parsed(row, 0)?,
        to_address: parsed(row, 1)?,
        from_address: parsed(row, 2)?,
        amount: parsed(row, 3)?,
        tx_hash: parsed_opt(row, 4)?,
        supply_type: parsed(row, 5)?,
        trigger_type: row.get(6)?,
        operator: row.get(7)?,
        balance_before: parsed(row, 8)?,
        balance_after: parsed(row, 9)?,
        status: parsed(row, 10)?,
        error: row.get(11)?,
        created_at: timestamp(row, 12)?,
    })
}

impl GasSupplyLog {
    /// A log entry for a top-up that reached a terminal outcome.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        to_address: Address,
        from_address: Address,
        amount: U256,
        tx_hash: Option<TxHash>,
        supply_type: SupplyType,
        trigger_type: &str,
        operator: Option<String>,
        balance_before: U256,
        balance_after: U256,
        status: SupplyStatus,
        error: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            to_address,
            from_address,
            amount,
            tx_hash,
            supply_type,
            trigger_type: trigger_type.to_string(),
            operator,
            balance_before,
            balance_after,
            status,
            error,
            created_at: Utc::now(),
        }
    }
}

impl Ledger {
    pub fn insert_gas_supply(&self, log: &GasSupplyLog) -> LedgerResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO gas_supply_logs (id, to_address, from_address, amount, tx_hash, supply_type,
                     trigger_type, operator, balance_before, balance_after, status, error, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    log.id.to_string(),
                    address_key(&log.to_address),
                    address_key(&log.from_address),
                    log.amount.to_string(),
                    log.tx_hash.map(|h| h.to_string()),
                    log.supply_type.as_str(),
                    log.trigger_type,
                    log.operator,
                    log.balance_before.to_string(),
                    log.balance_after.to_string(),
                    log.status.as_str(),
                    log.error,
                    to_millis(log.created_at),
                ],
            )?;
            Ok(())
        })
    }

    /// Top-ups received by one address, newest first.
    pub fn gas_supplies_for(&self, to_address: &Address) -> LedgerResult<Vec<GasSupplyLog>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {GAS_COLUMNS} FROM gas_supply_logs WHERE to_address = ?1 ORDER BY created_at DESC"
            ))?;
            let rows = stmt.query_map(params![address_key(to_address)], gas_from_row)?;
            rows.collect()
        })
    }

    pub fn list_gas_supplies(&self, limit: usize) -> LedgerResult<Vec<GasSupplyLog>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {GAS_COLUMNS} FROM gas_supply_logs ORDER BY created_at DESC LIMIT ?1"
            ))?;
            let rows = stmt.query_map(params![limit as i64], gas_from_row)?;
            rows.collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::B256;

    #[test]
    fn test_manual_supply_round_trip() {
        let ledger = Ledger::open_in_memory().unwrap();
        let to = Address::repeat_byte(0x11);
        let log = GasSupplyLog::new(
            to,
            Address::repeat_byte(0x99),
            U256::from(500u64),
            Some(B256::repeat_byte(7)),
            SupplyType::Manual,
            "operator",
            Some("ops@example.com".to_string()),
            U256::from(10u64),
            U256::from(510u64),
            SupplyStatus::Completed,
            None,
        );
        ledger.insert_gas_supply(&log).unwrap();

        let stored = ledger.gas_supplies_for(&to).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id, log.id);
        assert_eq!(stored[0].supply_type, SupplyType::Manual);
        assert_eq!(stored[0].operator.as_deref(), Some("ops@example.com"));
        assert_eq!(stored[0].balance_after, U256::from(510u64));

        assert!(ledger.gas_supplies_for(&Address::ZERO).unwrap().is_empty());
        assert_eq!(ledger.list_gas_supplies(10).unwrap().len(), 1);
    }
}
