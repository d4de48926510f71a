//! Operator top-up requests.
//!
//! The CLI only writes rows here; the daemon claims and executes them so the
//! master wallet keeps a single nonce owner.

use alloy::primitives::{Address, U256};
use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

use crate::ledger::models::{GasRequest, GasRequestStatus};
use crate::ledger::store::{
    address_key, parsed, parsed_opt, timestamp, to_millis, Ledger, LedgerError, LedgerResult,
};

const REQUEST_COLUMNS: &str =
    "id, to_address, min_required, operator, status, supply_log_id, error, created_at, updated_at";

fn request_from_row(row: &Row<'_>) -> rusqlite::Result<GasRequest> {
    Ok(GasRequest {
        id: parsed(row, 0)?,
        to_address: parsed(row, 1)?,
        min_required: parsed_opt(row, 2)?,
        operator: row.get(3)?,
        status: parsed(row, 4)?,
        supply_log_id: parsed_opt(row, 5)?,
        error: row.get(6)?,
        created_at: timestamp(row, 7)?,
        updated_at: timestamp(row, 8)?,
    })
}

impl GasRequest {
    pub fn new(to_address: Address, min_required: Option<U256>, operator: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            to_address,
            min_required,
            operator: operator.to_string(),
            status: GasRequestStatus::Pending,
            supply_log_id: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

impl Ledger {
    pub fn insert_gas_request(&self, request: &GasRequest) -> LedgerResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO gas_requests (id, to_address, min_required, operator, status, supply_log_id,
                     error, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    request.id.to_string(),
                    address_key(&request.to_address),
                    request.min_required.map(|m| m.to_string()),
                    request.operator,
                    request.status.as_str(),
                    request.supply_log_id.map(|id| id.to_string()),
                    request.error,
                    to_millis(request.created_at),
                    to_millis(request.updated_at),
                ],
            )?;
            Ok(())
        })
    }

    /// Move a request from `pending` to `processing`. False if another
    /// worker got there first or it is no longer pending.
    pub fn claim_gas_request(&self, id: Uuid) -> LedgerResult<bool> {
        let changed = self.with_conn(|conn| {
            conn.execute(
                "UPDATE gas_requests SET status = 'processing', updated_at = ?1
                 WHERE id = ?2 AND status = 'pending'",
                params![to_millis(Utc::now()), id.to_string()],
            )
        })?;
        Ok(changed > 0)
    }

    /// Record the outcome of a claimed request.
    pub fn finish_gas_request(
        &self,
        id: Uuid,
        status: GasRequestStatus,
        supply_log_id: Option<Uuid>,
        error: Option<&str>,
    ) -> LedgerResult<()> {
        if matches!(status, GasRequestStatus::Pending | GasRequestStatus::Processing) {
            return Err(LedgerError::InvalidTransition(format!(
                "gas request {id} cannot finish as {status}"
            )));
        }
        let changed = self.with_conn(|conn| {
            conn.execute(
                "UPDATE gas_requests SET status = ?1, supply_log_id = ?2, error = ?3, updated_at = ?4
                 WHERE id = ?5 AND status = 'processing'",
                params![
                    status.as_str(),
                    supply_log_id.map(|log| log.to_string()),
                    error,
                    to_millis(Utc::now()),
                    id.to_string(),
                ],
            )
        })?;
        if changed == 0 {
            return Err(LedgerError::InvalidTransition(format!(
                "gas request {id} is not being processed"
            )));
        }
        Ok(())
    }

    /// Fail requests a previous run claimed but never finished.
    ///
    /// They are not retried: the top-up may have been broadcast.
    pub fn abandon_gas_requests(&self, reason: &str) -> LedgerResult<usize> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE gas_requests SET status = 'failed', error = ?1, updated_at = ?2
                 WHERE status = 'processing'",
                params![reason, to_millis(Utc::now())],
            )
        })
    }

    /// Pending requests, oldest first.
    pub fn pending_gas_requests(&self, limit: usize) -> LedgerResult<Vec<GasRequest>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {REQUEST_COLUMNS} FROM gas_requests WHERE status = 'pending'
                 ORDER BY created_at LIMIT ?1"
            ))?;
            let rows = stmt.query_map(params![limit as i64], request_from_row)?;
            rows.collect()
        })
    }

    pub fn get_gas_request(&self, id: Uuid) -> LedgerResult<Option<GasRequest>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {REQUEST_COLUMNS} FROM gas_requests WHERE id = ?1"),
                params![id.to_string()],
                request_from_row,
            )
            .optional()
        })
    }

    pub fn list_gas_requests(&self, limit: usize) -> LedgerResult<Vec<GasRequest>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {REQUEST_COLUMNS} FROM gas_requests ORDER BY created_at DESC LIMIT ?1"
            ))?;
            let rows = stmt.query_map(params![limit as i64], request_from_row)?;
            rows.collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_lifecycle() {
        let ledger = Ledger::open_in_memory().unwrap();
        let request = GasRequest::new(Address::repeat_byte(0x11), Some(U256::from(900u64)), "ops");
        ledger.insert_gas_request(&request).unwrap();

        let pending = ledger.pending_gas_requests(10).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].min_required, Some(U256::from(900u64)));

        assert!(ledger.claim_gas_request(request.id).unwrap());
        assert!(!ledger.claim_gas_request(request.id).unwrap());
        assert!(ledger.pending_gas_requests(10).unwrap().is_empty());

        let log_id = Uuid::new_v4();
        ledger
            .finish_gas_request(request.id, GasRequestStatus::Completed, Some(log_id), None)
            .unwrap();
        let stored = ledger.get_gas_request(request.id).unwrap().unwrap();
        assert_eq!(stored.status, GasRequestStatus::Completed);
        assert_eq!(stored.supply_log_id, Some(log_id));

        let err = ledger
            .finish_gas_request(request.id, GasRequestStatus::Failed, None, Some("late"))
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidTransition(_)));
    }

    #[test]
    fn test_interrupted_requests_are_abandoned() {
        let ledger = Ledger::open_in_memory().unwrap();
        let claimed = GasRequest::new(Address::repeat_byte(0x11), None, "ops");
        let waiting = GasRequest::new(Address::repeat_byte(0x22), None, "ops");
        ledger.insert_gas_request(&claimed).unwrap();
        ledger.insert_gas_request(&waiting).unwrap();
        ledger.claim_gas_request(claimed.id).unwrap();

        assert_eq!(ledger.abandon_gas_requests("restarted").unwrap(), 1);
        let stored = ledger.get_gas_request(claimed.id).unwrap().unwrap();
        assert_eq!(stored.status, GasRequestStatus::Failed);
        assert_eq!(stored.error.as_deref(), Some("restarted"));
        assert_eq!(ledger.pending_gas_requests(10).unwrap()[0].id, waiting.id);
        assert_eq!(ledger.list_gas_requests(10).unwrap().len(), 2);
    }
}
