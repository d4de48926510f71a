//! System incident table and its state transitions.
//!
//! Transitions are enforced here so every caller (pipeline, scheduler,
//! operator CLI) gets the same rules:
//! - a failed retry increments `retry_count` and either reschedules or
//!   escalates once `retry_count >= max_retries`
//! - an escalated incident is never rescheduled automatically
//! - resolved and ignored incidents are closed

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, params_from_iter, OptionalExtension, Row, Transaction};
use uuid::Uuid;

use crate::incidents::types::{ErrorType, IncidentEntity, IncidentStatus};
use crate::ledger::models::{NewIncident, SystemIncident};
use crate::ledger::store::{
    conversion_error, from_millis, parsed, timestamp, to_millis, Ledger, LedgerError, LedgerResult,
};

const INCIDENT_COLUMNS: &str = "id, error_type, severity, message, details, entity_type, entity_id, \
     retry_count, max_retries, retry_strategy, next_retry_at, is_escalated, status, resolved_by, \
     resolution_note, created_at, updated_at";

fn incident_from_row(row: &Row<'_>) -> rusqlite::Result<SystemIncident> {
    let details: String = row.get(4)?;
    let details = serde_json::from_str(&details).map_err(|e| conversion_error(4, e.to_string()))?;
    let next_retry_at = row
        .get::<_, Option<i64>>(10)?
        .map(|ms| from_millis(10, ms))
        .transpose()?;
    Ok(SystemIncident {
        id: parsed(row, 0)?,
        error_type: parsed(row, 1)?,
        severity: parsed(row, 2)?,
        message: row.get(3)?,
        details,
        entity_type: row.get(5)?,
        entity_id: row.get(6)?,
        retry_count: row.get(7)?,
        max_retries: row.get(8)?,
        retry_strategy: parsed(row, 9)?,
        next_retry_at,
        is_escalated: row.get(11)?,
        status: parsed(row, 12)?,
        resolved_by: row.get(13)?,
        resolution_note: row.get(14)?,
        created_at: timestamp(row, 15)?,
        updated_at: timestamp(row, 16)?,
    })
}

fn load(tx: &Transaction<'_>, id: Uuid) -> LedgerResult<SystemIncident> {
    tx.query_row(
        &format!("SELECT {INCIDENT_COLUMNS} FROM system_incidents WHERE id = ?1"),
        params![id.to_string()],
        incident_from_row,
    )
    .optional()?
    .ok_or_else(|| LedgerError::NotFound(format!("incident {id}")))
}

fn retry_at(now: DateTime<Utc>, delay: std::time::Duration) -> DateTime<Utc> {
    now + Duration::from_std(delay).unwrap_or(Duration::zero())
}

impl Ledger {
    /// Record a new incident.
    ///
    /// With `max_retries == 0` the incident is escalated on creation.
    pub fn insert_incident(&self, incident: &NewIncident, now: DateTime<Utc>) -> LedgerResult<SystemIncident> {
        let escalated = incident.max_retries == 0;
        let record = SystemIncident {
            id: Uuid::new_v4(),
            error_type: incident.error_type,
            severity: incident.severity,
            message: incident.message.clone(),
            details: incident.details.clone(),
            entity_type: incident.entity.entity_type().to_string(),
            entity_id: incident.entity.entity_id(),
            retry_count: 0,
            max_retries: incident.max_retries,
            retry_strategy: incident.retry_strategy,
            next_retry_at: (!escalated).then(|| retry_at(now, incident.retry_strategy.delay(0))),
            is_escalated: escalated,
            status: if escalated {
                IncidentStatus::Escalated
            } else {
                IncidentStatus::Pending
            },
            resolved_by: None,
            resolution_note: None,
            created_at: now,
            updated_at: now,
        };
        let details = serde_json::to_string(&record.details)?;

        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO system_incidents (id, error_type, severity, message, details, entity_type,
                     entity_id, retry_count, max_retries, retry_strategy, next_retry_at, is_escalated,
                     status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8, ?9, ?10, ?11, ?12, ?13, ?13)",
                params![
                    record.id.to_string(),
                    record.error_type.as_str(),
                    record.severity.as_str(),
                    record.message,
                    details,
                    record.entity_type,
                    record.entity_id,
                    record.max_retries,
                    record.retry_strategy.as_str(),
                    record.next_retry_at.map(to_millis),
                    record.is_escalated,
                    record.status.as_str(),
                    to_millis(now),
                ],
            )?;
            Ok(())
        })?;
        Ok(record)
    }

    pub fn get_incident(&self, id: Uuid) -> LedgerResult<Option<SystemIncident>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {INCIDENT_COLUMNS} FROM system_incidents WHERE id = ?1"),
                params![id.to_string()],
                incident_from_row,
            )
            .optional()
        })
    }

    /// The newest unclosed incident of a given type about an entity.
    pub fn open_incident_for(
        &self,
        entity: &IncidentEntity,
        error_type: ErrorType,
    ) -> LedgerResult<Option<SystemIncident>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {INCIDENT_COLUMNS} FROM system_incidents
                     WHERE entity_type = ?1 AND entity_id = ?2 AND error_type = ?3
                       AND status IN ('PENDING', 'IN_PROGRESS', 'ESCALATED')
                     ORDER BY created_at DESC LIMIT 1"
                ),
                params![entity.entity_type(), entity.entity_id(), error_type.as_str()],
                incident_from_row,
            )
            .optional()
        })
    }

    /// Pending incidents whose retry time has come, oldest first.
    pub fn due_incidents(&self, now: DateTime<Utc>, limit: usize) -> LedgerResult<Vec<SystemIncident>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {INCIDENT_COLUMNS} FROM system_incidents
                 WHERE status = 'PENDING' AND next_retry_at IS NOT NULL AND next_retry_at <= ?1
                 ORDER BY next_retry_at LIMIT ?2"
            ))?;
            let rows = stmt.query_map(params![to_millis(now), limit as i64], incident_from_row)?;
            rows.collect()
        })
    }

    /// PENDING → IN_PROGRESS. Returns false if another worker got there first.
    pub fn claim_incident(&self, id: Uuid, now: DateTime<Utc>) -> LedgerResult<bool> {
        let changed = self.with_conn(|conn| {
            conn.execute(
                "UPDATE system_incidents SET status = 'IN_PROGRESS', updated_at = ?1
                 WHERE id = ?2 AND status = 'PENDING'",
                params![to_millis(now), id.to_string()],
            )
        })?;
        Ok(changed > 0)
    }

    /// IN_PROGRESS → PENDING, due now. Used at startup for work a stopped
    /// process never finished.
    pub fn requeue_in_progress(&self, now: DateTime<Utc>) -> LedgerResult<usize> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE system_incidents SET status = 'PENDING', next_retry_at = ?1, updated_at = ?1
                 WHERE status = 'IN_PROGRESS'",
                params![to_millis(now)],
            )
        })
    }

    /// Count one more failed attempt and reschedule or escalate.
    pub fn record_retry_failure(&self, id: Uuid, message: &str, now: DateTime<Utc>) -> LedgerResult<SystemIncident> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let current = load(&tx, id)?;
            if !matches!(current.status, IncidentStatus::Pending | IncidentStatus::InProgress) {
                return Err(LedgerError::InvalidTransition(format!(
                    "incident {id} is {} and takes no retries",
                    current.status
                )));
            }

            let retry_count = current.retry_count.saturating_add(1);
            let escalate = retry_count >= current.max_retries;
            let (status, next_retry_at) = if escalate {
                (IncidentStatus::Escalated, None)
            } else {
                (
                    IncidentStatus::Pending,
                    Some(retry_at(now, current.retry_strategy.delay(retry_count))),
                )
            };

            tx.execute(
                "UPDATE system_incidents
                 SET retry_count = ?1, status = ?2, next_retry_at = ?3, is_escalated = ?4,
                     message = ?5, updated_at = ?6
                 WHERE id = ?7",
                params![
                    retry_count,
                    status.as_str(),
                    next_retry_at.map(to_millis),
                    escalate,
                    message,
                    to_millis(now),
                    id.to_string(),
                ],
            )?;
            let updated = load(&tx, id)?;
            tx.commit()?;
            Ok(updated)
        })
    }

    /// Close an incident as fixed.
    ///
    /// Allowed from PENDING, IN_PROGRESS and ESCALATED.
    pub fn resolve_incident(
        &self,
        id: Uuid,
        resolved_by: &str,
        note: Option<&str>,
        now: DateTime<Utc>,
    ) -> LedgerResult<SystemIncident> {
        self.close_incident(
            id,
            IncidentStatus::Resolved,
            &[IncidentStatus::Pending, IncidentStatus::InProgress, IncidentStatus::Escalated],
            resolved_by,
            note,
            now,
        )
    }

    /// Close an incident without a fix. Allowed from PENDING and ESCALATED.
    pub fn ignore_incident(
        &self,
        id: Uuid,
        resolved_by: &str,
        note: Option<&str>,
        now: DateTime<Utc>,
    ) -> LedgerResult<SystemIncident> {
        self.close_incident(
            id,
            IncidentStatus::Ignored,
            &[IncidentStatus::Pending, IncidentStatus::Escalated],
            resolved_by,
            note,
            now,
        )
    }

    fn close_incident(
        &self,
        id: Uuid,
        target: IncidentStatus,
        allowed_from: &[IncidentStatus],
        resolved_by: &str,
        note: Option<&str>,
        now: DateTime<Utc>,
    ) -> LedgerResult<SystemIncident> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let current = load(&tx, id)?;
            if !allowed_from.contains(&current.status) {
                return Err(LedgerError::InvalidTransition(format!(
                    "incident {id} cannot move from {} to {target}",
                    current.status
                )));
            }
            tx.execute(
                "UPDATE system_incidents
                 SET status = ?1, resolved_by = ?2, resolution_note = ?3, next_retry_at = NULL, updated_at = ?4
                 WHERE id = ?5",
                params![target.as_str(), resolved_by, note, to_millis(now), id.to_string()],
            )?;
            let updated = load(&tx, id)?;
            tx.commit()?;
            Ok(updated)
        })
    }

    /// Resolve every PENDING or IN_PROGRESS incident about an entity.
    ///
    /// Escalated incidents are left for an operator.
    pub fn resolve_open_for_entity(
        &self,
        entity: &IncidentEntity,
        resolved_by: &str,
        note: &str,
        now: DateTime<Utc>,
    ) -> LedgerResult<usize> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE system_incidents
                 SET status = 'RESOLVED', resolved_by = ?1, resolution_note = ?2, next_retry_at = NULL, updated_at = ?3
                 WHERE entity_type = ?4 AND entity_id = ?5 AND status IN ('PENDING', 'IN_PROGRESS')",
                params![
                    resolved_by,
                    note,
                    to_millis(now),
                    entity.entity_type(),
                    entity.entity_id()
                ],
            )
        })
    }

    /// Most recent incidents, optionally filtered by status.
    pub fn list_incidents(&self, status: Option<IncidentStatus>, limit: usize) -> LedgerResult<Vec<SystemIncident>> {
        let mut sql = format!("SELECT {INCIDENT_COLUMNS} FROM system_incidents");
        let mut args: Vec<String> = Vec::new();
        if let Some(status) = status {
            sql.push_str(" WHERE status = ?1");
            args.push(status.as_str().to_string());
        }
        sql.push_str(&format!(" ORDER BY created_at DESC LIMIT {limit}"));

        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(args.iter()), incident_from_row)?;
            rows.collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::incidents::types::{RetryStrategy, Severity};

    fn new_incident(max_retries: u32) -> NewIncident {
        NewIncident {
            error_type: ErrorType::RpcError,
            severity: Severity::Medium,
            message: "getBlock failed".to_string(),
            details: serde_json::json!({ "block": 42 }),
            entity: IncidentEntity::Block(42),
            max_retries,
            retry_strategy: RetryStrategy::ExponentialBackoff,
        }
    }

    #[test]
    fn test_insert_schedules_first_retry() {
        let ledger = Ledger::open_in_memory().unwrap();
        let now = Utc::now();
        let incident = ledger.insert_incident(&new_incident(3), now).unwrap();

        assert_eq!(incident.status, IncidentStatus::Pending);
        assert_eq!(incident.retry_count, 0);
        let due = incident.next_retry_at.unwrap();
        assert_eq!((due - now).num_milliseconds(), 1_000);

        let stored = ledger.get_incident(incident.id).unwrap().unwrap();
        assert_eq!(stored.details["block"], 42);
        assert_eq!(stored.entity(), Some(IncidentEntity::Block(42)));
    }

    #[test]
    fn test_zero_retries_escalates_immediately() {
        let ledger = Ledger::open_in_memory().unwrap();
        let incident = ledger.insert_incident(&new_incident(0), Utc::now()).unwrap();
        assert_eq!(incident.status, IncidentStatus::Escalated);
        assert!(incident.is_escalated);
        assert!(incident.next_retry_at.is_none());
        assert!(ledger.due_incidents(Utc::now() + Duration::days(1), 10).unwrap().is_empty());
    }

    #[test]
    fn test_retry_escalation() {
        let ledger = Ledger::open_in_memory().unwrap();
        let now = Utc::now();
        let incident = ledger.insert_incident(&new_incident(3), now).unwrap();

        let first = ledger.record_retry_failure(incident.id, "again", now).unwrap();
        assert_eq!(first.retry_count, 1);
        assert_eq!(first.status, IncidentStatus::Pending);
        assert_eq!(
            first.next_retry_at.unwrap().timestamp_millis() - now.timestamp_millis(),
            2_000
        );

        ledger.record_retry_failure(incident.id, "again", now).unwrap();
        let third = ledger.record_retry_failure(incident.id, "still", now).unwrap();
        assert_eq!(third.retry_count, 3);
        assert_eq!(third.status, IncidentStatus::Escalated);
        assert!(third.is_escalated);
        assert!(third.next_retry_at.is_none());
        assert_eq!(third.message, "still");

        let err = ledger.record_retry_failure(incident.id, "more", now).unwrap_err();
        assert!(matches!(err, LedgerError::InvalidTransition(_)));
        let stored = ledger.get_incident(incident.id).unwrap().unwrap();
        assert_eq!(stored.retry_count, 3);
    }

    #[test]
    fn test_due_and_claim() {
        let ledger = Ledger::open_in_memory().unwrap();
        let now = Utc::now();
        let incident = ledger.insert_incident(&new_incident(3), now).unwrap();

        assert!(ledger.due_incidents(now, 10).unwrap().is_empty());
        let later = now + Duration::seconds(5);
        assert_eq!(ledger.due_incidents(later, 10).unwrap().len(), 1);

        assert!(ledger.claim_incident(incident.id, later).unwrap());
        assert!(!ledger.claim_incident(incident.id, later).unwrap());
        assert!(ledger.due_incidents(later, 10).unwrap().is_empty());

        assert_eq!(ledger.requeue_in_progress(later).unwrap(), 1);
        assert_eq!(ledger.due_incidents(later, 10).unwrap().len(), 1);
    }

    #[test]
    fn test_operator_transitions() {
        let ledger = Ledger::open_in_memory().unwrap();
        let now = Utc::now();

        let escalated = ledger.insert_incident(&new_incident(0), now).unwrap();
        let resolved = ledger
            .resolve_incident(escalated.id, "ops", Some("replayed manually"), now)
            .unwrap();
        assert_eq!(resolved.status, IncidentStatus::Resolved);
        assert_eq!(resolved.resolved_by.as_deref(), Some("ops"));
        assert_eq!(resolved.resolution_note.as_deref(), Some("replayed manually"));

        // Closed incidents take no further transitions.
        assert!(ledger.ignore_incident(escalated.id, "ops", None, now).is_err());
        assert!(ledger.resolve_incident(escalated.id, "ops", None, now).is_err());

        let pending = ledger.insert_incident(&new_incident(3), now).unwrap();
        let ignored = ledger.ignore_incident(pending.id, "ops", None, now).unwrap();
        assert_eq!(ignored.status, IncidentStatus::Ignored);

        let missing = ledger.resolve_incident(Uuid::new_v4(), "ops", None, now).unwrap_err();
        assert!(matches!(missing, LedgerError::NotFound(_)));
    }

    #[test]
    fn test_resolve_open_for_entity_skips_escalated() {
        let ledger = Ledger::open_in_memory().unwrap();
        let now = Utc::now();
        let pending = ledger.insert_incident(&new_incident(3), now).unwrap();
        let escalated = ledger.insert_incident(&new_incident(0), now).unwrap();

        let resolved = ledger
            .resolve_open_for_entity(&IncidentEntity::Block(42), "system", "block processed", now)
            .unwrap();
        assert_eq!(resolved, 1);

        let pending = ledger.get_incident(pending.id).unwrap().unwrap();
        assert_eq!(pending.status, IncidentStatus::Resolved);
        let escalated = ledger.get_incident(escalated.id).unwrap().unwrap();
        assert_eq!(escalated.status, IncidentStatus::Escalated);

        let open = ledger
            .open_incident_for(&IncidentEntity::Block(42), ErrorType::RpcError)
            .unwrap()
            .unwrap();
        assert_eq!(open.id, escalated.id);
    }
}
