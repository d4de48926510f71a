//! Deposit records.
//!
//! Rows are appended once per (tx hash, token, log index) and only ever move
//! forward: `swept` flips from false to true once, guarded in SQL by the
//! confirmation threshold.

use alloy::primitives::{Address, TxHash};
use chrono::Utc;
use rusqlite::{params, params_from_iter, OptionalExtension, Row};

use crate::blockchain::asset::TokenType;
use crate::ledger::models::{Deposit, DepositStatus, NewDeposit};
use crate::ledger::store::{
    address_key, parsed, parsed_opt, timestamp, to_millis, Ledger, LedgerResult,
};

const DEPOSIT_COLUMNS: &str = "id, tx_hash, log_index, token, from_address, to_address, user_id, \
     amount, block_number, confirmations, status, swept, sweep_tx_hash, created_at, updated_at";

fn deposit_from_row(row: &Row<'_>) -> rusqlite::Result<Deposit> {
    Ok(Deposit {
        id: row.get(0)?,
        tx_hash: parsed(row, 1)?,
        log_index: row.get::<_, i64>(2)? as u64,
        token: parsed(row, 3)?,
        from_address: parsed(row, 4)?,
        to_address: parsed(row, 5)?,
        user_id: row.get(6)?,
        amount: parsed(row, 7)?,
        block_number: row.get::<_, i64>(8)? as u64,
        confirmations: row.get::<_, i64>(9)? as u64,
        status: parsed(row, 10)?,
        swept: row.get(11)?,
        sweep_tx_hash: parsed_opt(row, 12)?,
        created_at: timestamp(row, 13)?,
        updated_at: timestamp(row, 14)?,
    })
}

impl Ledger {
    /// Record a deposit.
    ///
    /// Returns the new row id, or `None` when the transfer is already recorded.
    pub fn insert_deposit(&self, deposit: &NewDeposit) -> LedgerResult<Option<i64>> {
        let now = to_millis(Utc::now());
        self.with_conn(|conn| {
            let inserted = conn.execute(
                "INSERT INTO deposits (tx_hash, log_index, token, from_address, to_address, user_id,
                     amount, block_number, confirmations, status, swept, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 0, ?11, ?11)
                 ON CONFLICT (tx_hash, token, log_index) DO NOTHING",
                params![
                    deposit.tx_hash.to_string(),
                    deposit.log_index as i64,
                    deposit.token.to_string(),
                    address_key(&deposit.from_address),
                    address_key(&deposit.to_address),
                    deposit.user_id,
                    deposit.amount.to_string(),
                    deposit.block_number as i64,
                    deposit.confirmations as i64,
                    deposit.status.as_str(),
                    now,
                ],
            )?;
            Ok((inserted > 0).then(|| conn.last_insert_rowid()))
        })
    }

    /// Whether a specific transfer (token and log index) is recorded.
    pub fn transfer_recorded(&self, tx_hash: &TxHash, token: &TokenType, log_index: u64) -> LedgerResult<bool> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM deposits WHERE tx_hash = ?1 AND token = ?2 AND log_index = ?3)",
                params![tx_hash.to_string(), token.to_string(), log_index as i64],
                |row| row.get(0),
            )
        })
    }

    pub fn get_deposit(&self, id: i64) -> LedgerResult<Option<Deposit>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {DEPOSIT_COLUMNS} FROM deposits WHERE id = ?1"),
                params![id],
                deposit_from_row,
            )
            .optional()
        })
    }

    /// Confirmed deposits into an address that are eligible for sweeping.
    pub fn unswept_deposits(
        &self,
        address: &Address,
        token: &TokenType,
        min_confirmations: u64,
    ) -> LedgerResult<Vec<Deposit>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {DEPOSIT_COLUMNS} FROM deposits
                 WHERE to_address = ?1 AND token = ?2 AND status = 'confirmed'
                   AND swept = 0 AND confirmations >= ?3
                 ORDER BY id"
            ))?;
            let rows = stmt.query_map(
                params![address_key(address), token.to_string(), min_confirmations as i64],
                deposit_from_row,
            )?;
            rows.collect()
        })
    }

    /// Flip `swept` on the given deposits.
    ///
    /// Only rows that are confirmed, at or above the threshold and not yet
    /// swept are touched. Returns how many rows changed.
    pub fn mark_swept(&self, ids: &[i64], sweep_tx_hash: &TxHash, min_confirmations: u64) -> LedgerResult<usize> {
        let now = to_millis(Utc::now());
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let mut changed = 0;
            {
                let mut stmt = tx.prepare(
                    "UPDATE deposits SET swept = 1, sweep_tx_hash = ?1, updated_at = ?2
                     WHERE id = ?3 AND swept = 0 AND status = 'confirmed' AND confirmations >= ?4",
                )?;
                for id in ids {
                    changed += stmt.execute(params![
                        sweep_tx_hash.to_string(),
                        now,
                        id,
                        min_confirmations as i64
                    ])?;
                }
            }
            tx.commit()?;
            Ok(changed)
        })
    }

    /// Deposits for one user, newest first.
    pub fn deposits_for_user(&self, user_id: &str) -> LedgerResult<Vec<Deposit>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {DEPOSIT_COLUMNS} FROM deposits WHERE user_id = ?1 ORDER BY id DESC"
            ))?;
            let rows = stmt.query_map(params![user_id], deposit_from_row)?;
            rows.collect()
        })
    }

    /// Most recent deposits, optionally filtered by status.
    pub fn list_deposits(&self, status: Option<DepositStatus>, limit: usize) -> LedgerResult<Vec<Deposit>> {
        let mut sql = format!("SELECT {DEPOSIT_COLUMNS} FROM deposits");
        let mut args: Vec<String> = Vec::new();
        if let Some(status) = status {
            sql.push_str(" WHERE status = ?1");
            args.push(status.as_str().to_string());
        }
        sql.push_str(&format!(" ORDER BY id DESC LIMIT {limit}"));

        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(args.iter()), deposit_from_row)?;
            rows.collect()
        })
    }
}
