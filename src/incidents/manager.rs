//! Incident recording and transitions.

use chrono::Utc;
use uuid::Uuid;

use crate::config::schema::IncidentConfig;
use crate::incidents::types::{ErrorType, IncidentEntity, IncidentStatus, RetryStrategy, Severity};
use crate::ledger::models::{NewIncident, SystemIncident};
use crate::ledger::{Ledger, LedgerResult};
use crate::observability::metrics;

/// Severity and retry budget for an error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub severity: Severity,
    pub max_retries: u32,
    pub strategy: RetryStrategy,
}

/// Records failures and moves incidents through their lifecycle.
#[derive(Debug, Clone)]
pub struct IncidentManager {
    ledger: Ledger,
    max_retries: u32,
    strategy: RetryStrategy,
}

impl IncidentManager {
    pub fn new(ledger: Ledger, config: &IncidentConfig) -> Self {
        Self {
            ledger,
            max_retries: config.max_retries,
            strategy: config.retry_strategy,
        }
    }

    /// Wallet and validation failures cannot be fixed by retrying and
    /// escalate immediately.
    pub fn policy_for(&self, error_type: ErrorType) -> RetryPolicy {
        let (severity, max_retries) = match error_type {
            ErrorType::WalletError => (Severity::Critical, 0),
            ErrorType::ValidationError => (Severity::High, 0),
            ErrorType::SweepFail | ErrorType::GasFail | ErrorType::TxFail => (Severity::High, self.max_retries),
            ErrorType::RpcError | ErrorType::TimeoutError => (Severity::Medium, self.max_retries),
        };
        RetryPolicy {
            severity,
            max_retries,
            strategy: self.strategy,
        }
    }

    /// Record a failure about an entity.
    ///
    /// An unclosed incident of the same type for the same entity absorbs the
    /// failure: a pending or in-progress one counts it as a failed retry, an
    /// escalated one is left as is. Otherwise a new incident is opened.
    pub fn record(
        &self,
        error_type: ErrorType,
        entity: IncidentEntity,
        message: impl Into<String>,
        details: serde_json::Value,
    ) -> LedgerResult<SystemIncident> {
        let message = message.into();
        let now = Utc::now();

        if let Some(open) = self.ledger.open_incident_for(&entity, error_type)? {
            if open.status == IncidentStatus::Escalated {
                tracing::debug!(
                    incident_id = %open.id,
                    error_type = %error_type,
                    entity = %entity.entity_id(),
                    "Failure on escalated entity, awaiting operator"
                );
                return Ok(open);
            }
            return self.retry_failed(open.id, &message);
        }

        let policy = self.policy_for(error_type);
        let incident = self.ledger.insert_incident(
            &NewIncident {
                error_type,
                severity: policy.severity,
                message,
                details,
                entity,
                max_retries: policy.max_retries,
                retry_strategy: policy.strategy,
            },
            now,
        )?;

        metrics::record_incident(error_type.as_str());
        if incident.is_escalated {
            metrics::record_escalation(error_type.as_str());
            tracing::error!(
                incident_id = %incident.id,
                error_type = %error_type,
                entity_type = %incident.entity_type,
                entity_id = %incident.entity_id,
                message = %incident.message,
                "Incident escalated on creation"
            );
        } else {
            tracing::warn!(
                incident_id = %incident.id,
                error_type = %error_type,
                entity_type = %incident.entity_type,
                entity_id = %incident.entity_id,
                message = %incident.message,
                next_retry_at = ?incident.next_retry_at,
                "Incident recorded"
            );
        }
        Ok(incident)
    }

    /// [`IncidentManager::record`] for callers that must not fail because of it.
    pub fn report(
        &self,
        error_type: ErrorType,
        entity: IncidentEntity,
        message: impl Into<String>,
        details: serde_json::Value,
    ) {
        let message = message.into();
        if let Err(e) = self.record(error_type, entity.clone(), message.clone(), details) {
            tracing::error!(
                error_type = %error_type,
                entity_id = %entity.entity_id(),
                failure = %message,
                error = %e,
                "Failed to record incident"
            );
        }
    }

    /// Count a failed retry; escalates at the retry budget.
    pub fn retry_failed(&self, id: Uuid, message: &str) -> LedgerResult<SystemIncident> {
        let incident = self.ledger.record_retry_failure(id, message, Utc::now())?;
        if incident.is_escalated {
            metrics::record_escalation(incident.error_type.as_str());
            tracing::error!(
                incident_id = %incident.id,
                error_type = %incident.error_type,
                retry_count = incident.retry_count,
                message = %incident.message,
                "Incident escalated after exhausting retries"
            );
        } else {
            tracing::warn!(
                incident_id = %incident.id,
                retry_count = incident.retry_count,
                max_retries = incident.max_retries,
                next_retry_at = ?incident.next_retry_at,
                "Retry failed, rescheduled"
            );
        }
        Ok(incident)
    }

    /// The pipeline succeeded on an entity; close its pending incidents.
    pub fn resolve_entity(&self, entity: &IncidentEntity, note: &str) {
        match self.ledger.resolve_open_for_entity(entity, "system", note, Utc::now()) {
            Ok(0) => {}
            Ok(count) => tracing::info!(
                entity_type = entity.entity_type(),
                entity_id = %entity.entity_id(),
                count,
                "Incidents resolved"
            ),
            Err(e) => tracing::error!(
                entity_id = %entity.entity_id(),
                error = %e,
                "Failed to resolve incidents"
            ),
        }
    }

    /// Operator resolution.
    pub fn resolve(&self, id: Uuid, operator: &str, note: Option<&str>) -> LedgerResult<SystemIncident> {
        let incident = self.ledger.resolve_incident(id, operator, note, Utc::now())?;
        tracing::info!(incident_id = %id, operator, "Incident resolved by operator");
        Ok(incident)
    }

    /// Operator dismissal.
    pub fn ignore(&self, id: Uuid, operator: &str, note: Option<&str>) -> LedgerResult<SystemIncident> {
        let incident = self.ledger.ignore_incident(id, operator, note, Utc::now())?;
        tracing::info!(incident_id = %id, operator, "Incident ignored by operator");
        Ok(incident)
    }

    pub fn due(&self, limit: usize) -> LedgerResult<Vec<SystemIncident>> {
        self.ledger.due_incidents(Utc::now(), limit)
    }

    pub fn claim(&self, id: Uuid) -> LedgerResult<bool> {
        self.ledger.claim_incident(id, Utc::now())
    }

    /// Put incidents left in progress by a previous run back in the queue.
    pub fn requeue_interrupted(&self) -> LedgerResult<usize> {
        let count = self.ledger.requeue_in_progress(Utc::now())?;
        if count > 0 {
            tracing::info!(count, "Requeued interrupted incidents");
        }
        Ok(count)
    }

    pub fn list(&self, status: Option<IncidentStatus>, limit: usize) -> LedgerResult<Vec<SystemIncident>> {
        self.ledger.list_incidents(status, limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manager() -> IncidentManager {
        IncidentManager::new(Ledger::open_in_memory().unwrap(), &IncidentConfig::default())
    }

    #[test]
    fn test_repeat_failures_share_one_incident() {
        let manager = manager();
        let entity = IncidentEntity::Block(7);

        let first = manager
            .record(ErrorType::RpcError, entity.clone(), "getBlock failed", json!({}))
            .unwrap();
        let second = manager
            .record(ErrorType::RpcError, entity.clone(), "getBlock failed again", json!({}))
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.retry_count, 1);

        manager.record(ErrorType::RpcError, entity.clone(), "x", json!({})).unwrap();
        let escalated = manager.record(ErrorType::RpcError, entity.clone(), "y", json!({})).unwrap();
        assert_eq!(escalated.status, IncidentStatus::Escalated);
        assert_eq!(escalated.retry_count, 3);

        // Escalation is sticky: further failures neither reopen nor count.
        let after = manager.record(ErrorType::RpcError, entity, "z", json!({})).unwrap();
        assert_eq!(after.id, first.id);
        assert_eq!(after.status, IncidentStatus::Escalated);
        assert_eq!(after.retry_count, 3);
    }

    #[test]
    fn test_wallet_errors_escalate_immediately() {
        let manager = manager();
        let incident = manager
            .record(
                ErrorType::WalletError,
                IncidentEntity::Wallet {
                    address: "0xabc".to_string(),
                    token: "native".to_string(),
                },
                "decryption failed",
                json!({}),
            )
            .unwrap();
        assert_eq!(incident.status, IncidentStatus::Escalated);
        assert_eq!(incident.severity, Severity::Critical);
        assert_eq!(incident.max_retries, 0);
    }

    #[test]
    fn test_resolve_entity_then_new_failure_opens_new_incident() {
        let manager = manager();
        let entity = IncidentEntity::Block(9);
        let first = manager.record(ErrorType::RpcError, entity.clone(), "a", json!({})).unwrap();

        manager.resolve_entity(&entity, "block processed");
        let second = manager.record(ErrorType::RpcError, entity, "b", json!({})).unwrap();
        assert_ne!(first.id, second.id);
        assert_eq!(second.retry_count, 0);
    }

    #[test]
    fn test_operator_actions() {
        let manager = manager();
        let incident = manager
            .record(ErrorType::GasFail, IncidentEntity::System, "master low", json!({}))
            .unwrap();
        let ignored = manager.ignore(incident.id, "ops", Some("known")).unwrap();
        assert_eq!(ignored.status, IncidentStatus::Ignored);
        assert!(manager.resolve(incident.id, "ops", None).is_err());
        assert_eq!(manager.list(Some(IncidentStatus::Ignored), 10).unwrap().len(), 1);
    }
}
