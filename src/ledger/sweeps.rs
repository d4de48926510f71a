//! Sweep attempt records.

use alloy::primitives::{Address, TxHash, U256};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

use crate::blockchain::asset::TokenType;
use crate::ledger::models::{Sweep, SweepStatus};
use crate::ledger::store::{
    address_key, conversion_error, parsed, parsed_opt, timestamp, to_millis, Ledger, LedgerError,
    LedgerResult,
};

const SWEEP_COLUMNS: &str = "id, user_id, from_address, to_address, token, amount, observed_balance, \
     gas_limit, gas_price, gas_used, gas_cost, tx_hash, status, error, related_deposits, created_at, updated_at";

fn sweep_from_row(row: &Row<'_>) -> rusqlite::Result<Sweep> {
    let related: String = row.get(14)?;
    let related_deposits =
        serde_json::from_str(&related).map_err(|e| conversion_error(14, e.to_string()))?;
    Ok(Sweep {
        id: parsed(row, 0)?,
        user_id: row.get(1)?,
        from_address: parsed(row, 2)?,
        to_address: parsed(row, 3)?,
        token: parsed(row, 4)?,
        amount: parsed(row, 5)?,
        observed_balance: parsed(row, 6)?,
        gas_limit: row.get::<_, i64>(7)? as u64,
        gas_price: parsed(row, 8)?,
        gas_used: row.get::<_, Option<i64>>(9)?.map(|g| g as u64),
        gas_cost: parsed(row, 10)?,
        tx_hash: parsed_opt(row, 11)?,
        status: parsed(row, 12)?,
        error: row.get(13)?,
        related_deposits,
        created_at: timestamp(row, 15)?,
        updated_at: timestamp(row, 16)?,
    })
}

impl Ledger {
    pub fn insert_sweep(&self, sweep: &Sweep) -> LedgerResult<()> {
        let related = serde_json::to_string(&sweep.related_deposits)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sweeps (id, user_id, from_address, to_address, token, amount, observed_balance,
                     gas_limit, gas_price, gas_used, gas_cost, tx_hash, status, error, related_deposits,
                     created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
                params![
                    sweep.id.to_string(),
                    sweep.user_id,
                    address_key(&sweep.from_address),
                    address_key(&sweep.to_address),
                    sweep.token.to_string(),
                    sweep.amount.to_string(),
                    sweep.observed_balance.to_string(),
                    sweep.gas_limit as i64,
                    sweep.gas_price.to_string(),
                    sweep.gas_used.map(|g| g as i64),
                    sweep.gas_cost.to_string(),
                    sweep.tx_hash.map(|h| h.to_string()),
                    sweep.status.as_str(),
                    sweep.error,
                    related,
                    to_millis(sweep.created_at),
                    to_millis(sweep.updated_at),
                ],
            )?;
            Ok(())
        })
    }

    /// Attach the broadcast hash to an in-flight sweep.
    pub fn set_sweep_tx_hash(&self, id: Uuid, tx_hash: &TxHash) -> LedgerResult<()> {
        let changed = self.with_conn(|conn| {
            conn.execute(
                "UPDATE sweeps SET tx_hash = ?1, updated_at = ?2
                 WHERE id = ?3 AND status IN ('pending', 'processing')",
                params![tx_hash.to_string(), to_millis(Utc::now()), id.to_string()],
            )
        })?;
        expect_transition(changed, id, "set tx hash")
    }

    /// Move a sweep to `completed` with the fee actually paid.
    pub fn complete_sweep(&self, id: Uuid, tx_hash: &TxHash, gas_used: u64, gas_cost: U256) -> LedgerResult<()> {
        let changed = self.with_conn(|conn| {
            conn.execute(
                "UPDATE sweeps SET status = 'completed', tx_hash = ?1, gas_used = ?2, gas_cost = ?3, updated_at = ?4
                 WHERE id = ?5 AND status IN ('pending', 'processing')",
                params![
                    tx_hash.to_string(),
                    gas_used as i64,
                    gas_cost.to_string(),
                    to_millis(Utc::now()),
                    id.to_string(),
                ],
            )
        })?;
        expect_transition(changed, id, "complete")
    }

    /// Move a sweep to `failed`.
    pub fn fail_sweep(&self, id: Uuid, error: &str) -> LedgerResult<()> {
        let changed = self.with_conn(|conn| {
            conn.execute(
                "UPDATE sweeps SET status = 'failed', error = ?1, updated_at = ?2
                 WHERE id = ?3 AND status IN ('pending', 'processing')",
                params![error, to_millis(Utc::now()), id.to_string()],
            )
        })?;
        expect_transition(changed, id, "fail")
    }

    pub fn get_sweep(&self, id: Uuid) -> LedgerResult<Option<Sweep>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {SWEEP_COLUMNS} FROM sweeps WHERE id = ?1"),
                params![id.to_string()],
                sweep_from_row,
            )
            .optional()
        })
    }

    /// Latest non-failed sweep from an address for a token created after `since`.
    ///
    /// Attempts still `processing` count; their transaction may yet land.
    pub fn recent_sweep(
        &self,
        from_address: &Address,
        token: &TokenType,
        since: DateTime<Utc>,
    ) -> LedgerResult<Option<Sweep>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {SWEEP_COLUMNS} FROM sweeps
                     WHERE from_address = ?1 AND token = ?2 AND status != 'failed' AND created_at >= ?3
                     ORDER BY created_at DESC LIMIT 1"
                ),
                params![address_key(from_address), token.to_string(), to_millis(since)],
                sweep_from_row,
            )
            .optional()
        })
    }

    /// Oldest attempt for an address and token that has not reached a
    /// terminal state.
    pub fn outstanding_sweep(&self, from_address: &Address, token: &TokenType) -> LedgerResult<Option<Sweep>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {SWEEP_COLUMNS} FROM sweeps
                     WHERE from_address = ?1 AND token = ?2 AND status IN ('pending', 'processing')
                     ORDER BY created_at LIMIT 1"
                ),
                params![address_key(from_address), token.to_string()],
                sweep_from_row,
            )
            .optional()
        })
    }

    /// Every non-terminal attempt, oldest first.
    pub fn outstanding_sweeps(&self) -> LedgerResult<Vec<Sweep>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SWEEP_COLUMNS} FROM sweeps
                 WHERE status IN ('pending', 'processing') ORDER BY created_at"
            ))?;
            let rows = stmt.query_map([], sweep_from_row)?;
            rows.collect()
        })
    }

    /// Sweeps for one user, newest first.
    pub fn sweeps_for_user(&self, user_id: &str) -> LedgerResult<Vec<Sweep>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SWEEP_COLUMNS} FROM sweeps WHERE user_id = ?1 ORDER BY created_at DESC"
            ))?;
            let rows = stmt.query_map(params![user_id], sweep_from_row)?;
            rows.collect()
        })
    }

    /// Most recent sweeps.
    pub fn list_sweeps(&self, limit: usize) -> LedgerResult<Vec<Sweep>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SWEEP_COLUMNS} FROM sweeps ORDER BY created_at DESC LIMIT ?1"
            ))?;
            let rows = stmt.query_map(params![limit as i64], sweep_from_row)?;
            rows.collect()
        })
    }
}

fn expect_transition(changed: usize, id: Uuid, action: &str) -> LedgerResult<()> {
    if changed == 0 {
        return Err(LedgerError::InvalidTransition(format!(
            "cannot {action} sweep {id}: not found or already terminal"
        )));
    }
    Ok(())
}

impl Sweep {
    /// A new `processing` sweep.
    #[allow(clippy::too_many_arguments)]
    pub fn processing(
        user_id: &str,
        from_address: Address,
        to_address: Address,
        token: TokenType,
        amount: U256,
        observed_balance: U256,
        gas_limit: u64,
        gas_price: u128,
        related_deposits: Vec<i64>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            from_address,
            to_address,
            token,
            amount,
            observed_balance,
            gas_limit,
            gas_price,
            gas_used: None,
            gas_cost: U256::from(gas_limit) * U256::from(gas_price),
            tx_hash: None,
            status: SweepStatus::Processing,
            error: None,
            related_deposits,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::B256;
    use chrono::Duration;

    fn sweep(token: TokenType) -> Sweep {
        Sweep::processing(
            "alice",
            Address::repeat_byte(0x11),
            Address::repeat_byte(0x99),
            token,
            U256::from(1_000u64),
            U256::from(1_500u64),
            21_000,
            10,
            vec![1, 2],
        )
    }

    #[test]
    fn test_insert_and_complete() {
        let ledger = Ledger::open_in_memory().unwrap();
        let s = sweep(TokenType::Native);
        ledger.insert_sweep(&s).unwrap();

        let hash = B256::repeat_byte(0x42);
        ledger.complete_sweep(s.id, &hash, 21_000, U256::from(210_000u64)).unwrap();

        let stored = ledger.get_sweep(s.id).unwrap().unwrap();
        assert_eq!(stored.status, SweepStatus::Completed);
        assert_eq!(stored.tx_hash, Some(hash));
        assert_eq!(stored.gas_used, Some(21_000));
        assert_eq!(stored.related_deposits, vec![1, 2]);
        assert_eq!(stored.observed_balance, U256::from(1_500u64));
    }

    #[test]
    fn test_terminal_states_are_final() {
        let ledger = Ledger::open_in_memory().unwrap();
        let s = sweep(TokenType::Native);
        ledger.insert_sweep(&s).unwrap();
        ledger.fail_sweep(s.id, "boom").unwrap();

        let err = ledger
            .complete_sweep(s.id, &B256::repeat_byte(1), 1, U256::from(1u64))
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidTransition(_)));
        assert!(matches!(
            ledger.fail_sweep(s.id, "again").unwrap_err(),
            LedgerError::InvalidTransition(_)
        ));

        let stored = ledger.get_sweep(s.id).unwrap().unwrap();
        assert_eq!(stored.status, SweepStatus::Failed);
        assert_eq!(stored.error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_recent_sweep_ignores_failed() {
        let ledger = Ledger::open_in_memory().unwrap();
        let from = Address::repeat_byte(0x11);
        let since = Utc::now() - Duration::minutes(10);

        let failed = sweep(TokenType::Native);
        ledger.insert_sweep(&failed).unwrap();
        ledger.fail_sweep(failed.id, "boom").unwrap();
        assert!(ledger.recent_sweep(&from, &TokenType::Native, since).unwrap().is_none());

        let ok = sweep(TokenType::Native);
        ledger.insert_sweep(&ok).unwrap();
        let found = ledger.recent_sweep(&from, &TokenType::Native, since).unwrap().unwrap();
        assert_eq!(found.id, ok.id);

        let token = TokenType::Erc20(Address::repeat_byte(0x55));
        assert!(ledger.recent_sweep(&from, &token, since).unwrap().is_none());
    }

    #[test]
    fn test_outstanding_attempts() {
        let ledger = Ledger::open_in_memory().unwrap();
        let from = Address::repeat_byte(0x11);
        assert!(ledger.outstanding_sweep(&from, &TokenType::Native).unwrap().is_none());

        let done = sweep(TokenType::Native);
        ledger.insert_sweep(&done).unwrap();
        ledger
            .complete_sweep(done.id, &B256::repeat_byte(1), 21_000, U256::from(1u64))
            .unwrap();

        let open = sweep(TokenType::Native);
        ledger.insert_sweep(&open).unwrap();
        ledger.set_sweep_tx_hash(open.id, &B256::repeat_byte(2)).unwrap();

        let found = ledger.outstanding_sweep(&from, &TokenType::Native).unwrap().unwrap();
        assert_eq!(found.id, open.id);
        assert_eq!(found.tx_hash, Some(B256::repeat_byte(2)));
        assert!(ledger
            .outstanding_sweep(&from, &TokenType::Erc20(Address::repeat_byte(0x55)))
            .unwrap()
            .is_none());

        let all = ledger.outstanding_sweeps().unwrap();
        assert_eq!(all.len(), 1);

        ledger.fail_sweep(open.id, "reverted").unwrap();
        assert!(ledger.outstanding_sweeps().unwrap().is_empty());
    }
}
