//! Metrics collection and exposition.
//!
//! # Metrics
//! - `sweeper_deposits_total` (counter): deposits recorded, by token and status
//! - `sweeper_sweeps_total` (counter): sweep attempts, by token and status
//! - `sweeper_gas_topups_total` (counter): top-ups, by supply type and status
//! - `sweeper_incidents_total` (counter): incidents recorded, by error type
//! - `sweeper_incidents_escalated_total` (counter): escalations, by error type
//! - `sweeper_rpc_calls_total` (counter): RPC calls, by operation and outcome
//! - `sweeper_rpc_health` (gauge): 1=healthy, 0=unhealthy
//! - `sweeper_last_block` (gauge): last block handed to the observer
//! - `sweeper_tracked_candidates` (gauge): transactions awaiting confirmations
//!
//! Recording is a no-op until a recorder is installed, so tests and the CLI
//! can call these freely.

use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus recorder and its HTTP listener.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Prometheus exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install Prometheus exporter"),
    }
}

pub fn record_deposit(token: &str, status: &str) {
    ::metrics::counter!(
        "sweeper_deposits_total",
        "token" => token.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

pub fn record_sweep(token: &str, status: &str) {
    ::metrics::counter!(
        "sweeper_sweeps_total",
        "token" => token.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

pub fn record_gas_topup(supply_type: &str, status: &str) {
    ::metrics::counter!(
        "sweeper_gas_topups_total",
        "supply_type" => supply_type.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

pub fn record_incident(error_type: &str) {
    ::metrics::counter!("sweeper_incidents_total", "error_type" => error_type.to_string()).increment(1);
}

pub fn record_escalation(error_type: &str) {
    ::metrics::counter!("sweeper_incidents_escalated_total", "error_type" => error_type.to_string())
        .increment(1);
}

pub fn record_rpc_call(operation: &'static str, success: bool) {
    let outcome = if success { "ok" } else { "error" };
    ::metrics::counter!("sweeper_rpc_calls_total", "operation" => operation, "outcome" => outcome)
        .increment(1);
}

pub fn record_rpc_health(healthy: bool) {
    ::metrics::gauge!("sweeper_rpc_health").set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_last_block(number: u64) {
    ::metrics::gauge!("sweeper_last_block").set(number as f64);
}

pub fn record_tracked_candidates(count: usize) {
    ::metrics::gauge!("sweeper_tracked_candidates").set(count as f64);
}
