//! Aggregates over the ledger for operators and external reporting.
//!
//! Amounts are stored as decimal text, so sums are folded in Rust rather
//! than in SQL.

use std::collections::BTreeMap;

use alloy::primitives::U256;
use serde::Serialize;

use crate::blockchain::asset::TokenType;
use crate::incidents::types::{ErrorType, IncidentStatus};
use crate::ledger::models::{SupplyType, SweepStatus};
use crate::ledger::store::{parsed, Ledger, LedgerResult};

/// Confirmed deposits per asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DepositTotal {
    pub token: TokenType,
    pub count: u64,
    pub amount: U256,
    pub swept_count: u64,
    pub unswept_amount: U256,
}

/// Sweeps per asset and status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SweepTotal {
    pub token: TokenType,
    pub status: SweepStatus,
    pub count: u64,
    pub amount: U256,
    pub gas_cost: U256,
}

/// Completed gas top-ups per supply type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GasSupplyTotal {
    pub supply_type: SupplyType,
    pub count: u64,
    pub amount: U256,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IncidentCount {
    pub status: IncidentStatus,
    pub error_type: ErrorType,
    pub count: u64,
}

/// Everything `summary` prints.
#[derive(Debug, Clone, Serialize)]
pub struct LedgerSummary {
    pub wallets: u64,
    pub deposits: Vec<DepositTotal>,
    pub sweeps: Vec<SweepTotal>,
    pub gas_supplied: Vec<GasSupplyTotal>,
    pub incidents: Vec<IncidentCount>,
}

impl Ledger {
    pub fn deposit_totals(&self) -> LedgerResult<Vec<DepositTotal>> {
        let rows: Vec<(TokenType, U256, bool)> = self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT token, amount, swept FROM deposits WHERE status = 'confirmed'")?;
            let rows = stmt.query_map([], |row| Ok((parsed(row, 0)?, parsed(row, 1)?, row.get(2)?)))?;
            rows.collect()
        })?;

        let mut totals: BTreeMap<String, DepositTotal> = BTreeMap::new();
        for (token, amount, swept) in rows {
            let entry = totals.entry(token.to_string()).or_insert(DepositTotal {
                token,
                count: 0,
                amount: U256::ZERO,
                swept_count: 0,
                unswept_amount: U256::ZERO,
            });
            entry.count += 1;
            entry.amount = entry.amount.saturating_add(amount);
            if swept {
                entry.swept_count += 1;
            } else {
                entry.unswept_amount = entry.unswept_amount.saturating_add(amount);
            }
        }
        Ok(totals.into_values().collect())
    }

    pub fn sweep_totals(&self) -> LedgerResult<Vec<SweepTotal>> {
        let rows: Vec<(TokenType, SweepStatus, U256, U256)> = self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT token, status, amount, gas_cost FROM sweeps")?;
            let rows = stmt.query_map([], |row| {
                Ok((parsed(row, 0)?, parsed(row, 1)?, parsed(row, 2)?, parsed(row, 3)?))
            })?;
            rows.collect()
        })?;

        let mut totals: BTreeMap<(String, &'static str), SweepTotal> = BTreeMap::new();
        for (token, status, amount, gas_cost) in rows {
            let entry = totals
                .entry((token.to_string(), status.as_str()))
                .or_insert(SweepTotal {
                    token,
                    status,
                    count: 0,
                    amount: U256::ZERO,
                    gas_cost: U256::ZERO,
                });
            entry.count += 1;
            entry.amount = entry.amount.saturating_add(amount);
            entry.gas_cost = entry.gas_cost.saturating_add(gas_cost);
        }
        Ok(totals.into_values().collect())
    }

    pub fn gas_supply_totals(&self) -> LedgerResult<Vec<GasSupplyTotal>> {
        let rows: Vec<(SupplyType, U256)> = self.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT supply_type, amount FROM gas_supply_logs WHERE status = 'completed'")?;
            let rows = stmt.query_map([], |row| Ok((parsed(row, 0)?, parsed(row, 1)?)))?;
            rows.collect()
        })?;

        let mut totals: BTreeMap<&'static str, GasSupplyTotal> = BTreeMap::new();
        for (supply_type, amount) in rows {
            let entry = totals.entry(supply_type.as_str()).or_insert(GasSupplyTotal {
                supply_type,
                count: 0,
                amount: U256::ZERO,
            });
            entry.count += 1;
            entry.amount = entry.amount.saturating_add(amount);
        }
        Ok(totals.into_values().collect())
    }

    pub fn incident_counts(&self) -> LedgerResult<Vec<IncidentCount>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT status, error_type, COUNT(*) FROM system_incidents
                 GROUP BY status, error_type ORDER BY status, error_type",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(IncidentCount {
                    status: parsed(row, 0)?,
                    error_type: parsed(row, 1)?,
                    count: row.get::<_, i64>(2)? as u64,
                })
            })?;
            rows.collect()
        })
    }

    pub fn summary(&self) -> LedgerResult<LedgerSummary> {
        let wallets: i64 =
            self.with_conn(|conn| conn.query_row("SELECT COUNT(*) FROM user_wallets", [], |row| row.get(0)))?;
        Ok(LedgerSummary {
            wallets: wallets as u64,
            deposits: self.deposit_totals()?,
            sweeps: self.sweep_totals()?,
            gas_supplied: self.gas_supply_totals()?,
            incidents: self.incident_counts()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::models::{DepositStatus, NewDeposit, Sweep};
    use alloy::primitives::{Address, B256};

    fn confirmed(hash: u8, amount: u64) -> NewDeposit {
        NewDeposit {
            tx_hash: B256::repeat_byte(hash),
            log_index: 0,
            token: TokenType::Native,
            from_address: Address::repeat_byte(0xee),
            to_address: Address::repeat_byte(0x11),
            user_id: "alice".to_string(),
            amount: U256::from(amount),
            block_number: 10,
            confirmations: 6,
            status: DepositStatus::Confirmed,
        }
    }

    #[test]
    fn test_deposit_totals() {
        let ledger = Ledger::open_in_memory().unwrap();
        let first = ledger.insert_deposit(&confirmed(1, 300)).unwrap().unwrap();
        ledger.insert_deposit(&confirmed(2, 200)).unwrap();
        let mut pending = confirmed(3, 1_000);
        pending.status = DepositStatus::Pending;
        ledger.insert_deposit(&pending).unwrap();
        ledger.mark_swept(&[first], &B256::repeat_byte(9), 6).unwrap();

        let totals = ledger.deposit_totals().unwrap();
        assert_eq!(totals.len(), 1);
        assert_eq!(totals[0].count, 2);
        assert_eq!(totals[0].amount, U256::from(500u64));
        assert_eq!(totals[0].swept_count, 1);
        assert_eq!(totals[0].unswept_amount, U256::from(200u64));
    }

    #[test]
    fn test_summary() {
        let ledger = Ledger::open_in_memory().unwrap();
        let sweep = Sweep::processing(
            "alice",
            Address::repeat_byte(0x11),
            Address::repeat_byte(0x99),
            TokenType::Native,
            U256::from(100u64),
            U256::from(121u64),
            21,
            1,
            vec![],
        );
        ledger.insert_sweep(&sweep).unwrap();
        ledger.fail_sweep(sweep.id, "boom").unwrap();

        let summary = ledger.summary().unwrap();
        assert_eq!(summary.wallets, 0);
        assert_eq!(summary.sweeps.len(), 1);
        assert_eq!(summary.sweeps[0].status, SweepStatus::Failed);
        assert_eq!(summary.sweeps[0].gas_cost, U256::from(21u64));
        assert!(summary.incidents.is_empty());
    }
}
