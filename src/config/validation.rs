//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate URLs, addresses, amounts and value ranges
//! - Detect duplicate token contracts
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: SweeperConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use std::net::SocketAddr;

use alloy::primitives::utils::{parse_ether, parse_units};
use alloy::primitives::Address;

use crate::config::schema::SweeperConfig;

/// Fewest confirmations a deposit may be swept with.
pub const MIN_CONFIRMATION_BLOCKS: u64 = 6;

/// A single semantic problem with the configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Check a parsed configuration.
pub fn validate_config(config: &SweeperConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let chain = &config.blockchain;
    if chain.rpc_url.parse::<url::Url>().is_err() {
        errors.push(ValidationError::new("blockchain.rpc_url", "not a valid URL"));
    }
    for (i, failover) in chain.failover_urls.iter().enumerate() {
        if failover.parse::<url::Url>().is_err() {
            errors.push(ValidationError::new(
                format!("blockchain.failover_urls[{i}]"),
                "not a valid URL",
            ));
        }
    }
    if chain.chain_id == 0 {
        errors.push(ValidationError::new("blockchain.chain_id", "must be non-zero"));
    }
    if chain.rpc_timeout_secs == 0 {
        errors.push(ValidationError::new("blockchain.rpc_timeout_secs", "must be > 0"));
    }
    if chain.confirmation_blocks < MIN_CONFIRMATION_BLOCKS {
        errors.push(ValidationError::new(
            "blockchain.confirmation_blocks",
            format!("must be >= {MIN_CONFIRMATION_BLOCKS}"),
        ));
    }
    if !(chain.gas_price_multiplier >= 1.0) {
        errors.push(ValidationError::new("blockchain.gas_price_multiplier", "must be >= 1.0"));
    }
    if chain.receipt_poll_ms == 0 {
        errors.push(ValidationError::new("blockchain.receipt_poll_ms", "must be > 0"));
    }

    let custody = &config.custody;
    if custody.seed_env_var.is_empty() {
        errors.push(ValidationError::new("custody.seed_env_var", "must not be empty"));
    }
    if custody.encryption_secret_env_var.is_empty() {
        errors.push(ValidationError::new("custody.encryption_secret_env_var", "must not be empty"));
    }
    if !custody.master_derivation_path.starts_with("m/") {
        errors.push(ValidationError::new(
            "custody.master_derivation_path",
            "must start with m/",
        ));
    }
    if let Some(master) = &custody.master_address {
        if master.parse::<Address>().is_err() {
            errors.push(ValidationError::new("custody.master_address", "not a valid address"));
        }
    }

    let observer = &config.observer;
    if observer.poll_interval_ms == 0 {
        errors.push(ValidationError::new("observer.poll_interval_ms", "must be > 0"));
    }
    if observer.dedup_capacity == 0 {
        errors.push(ValidationError::new("observer.dedup_capacity", "must be > 0"));
    }
    if observer.backup_scan_interval_secs == 0 {
        errors.push(ValidationError::new("observer.backup_scan_interval_secs", "must be > 0"));
    }
    if observer.max_blocks_per_poll == 0 {
        errors.push(ValidationError::new("observer.max_blocks_per_poll", "must be > 0"));
    }

    if parse_ether(&config.sweep.min_native_sweep).is_err() {
        errors.push(ValidationError::new("sweep.min_native_sweep", "not a decimal amount"));
    }
    if config.sweep.queue_depth == 0 {
        errors.push(ValidationError::new("sweep.queue_depth", "must be > 0"));
    }
    match parse_ether(&config.gas.min_gas_balance) {
        Ok(v) if !v.is_zero() => {}
        _ => errors.push(ValidationError::new("gas.min_gas_balance", "must be a positive amount")),
    }
    match parse_ether(&config.gas.top_up_amount) {
        Ok(v) if !v.is_zero() => {}
        _ => errors.push(ValidationError::new("gas.top_up_amount", "must be a positive amount")),
    }
    if config.gas.request_poll_secs == 0 {
        errors.push(ValidationError::new("gas.request_poll_secs", "must be > 0"));
    }

    if config.incidents.scheduler_interval_secs == 0 {
        errors.push(ValidationError::new("incidents.scheduler_interval_secs", "must be > 0"));
    }

    let mut seen = HashSet::new();
    for (i, token) in config.tokens.iter().enumerate() {
        let field = format!("tokens[{i}]");
        match token.contract.parse::<Address>() {
            Ok(address) => {
                if !seen.insert(address) {
                    errors.push(ValidationError::new(format!("{field}.contract"), "duplicate token"));
                }
            }
            Err(_) => errors.push(ValidationError::new(format!("{field}.contract"), "not a valid address")),
        }
        if token.decimals > 36 {
            errors.push(ValidationError::new(format!("{field}.decimals"), "must be <= 36"));
        }
        if parse_units(&token.min_sweep_amount, token.decimals).is_err() {
            errors.push(ValidationError::new(
                format!("{field}.min_sweep_amount"),
                "not a decimal amount",
            ));
        }
    }

    let obs = &config.observability;
    if obs.log_format != "pretty" && obs.log_format != "json" {
        errors.push(ValidationError::new("observability.log_format", "must be pretty or json"));
    }
    if obs.metrics_enabled && obs.metrics_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new("observability.metrics_address", "not a socket address"));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::TokenConfig;

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate_config(&SweeperConfig::default()).is_ok());
    }

    #[test]
    fn test_all_errors_reported() {
        let mut config = SweeperConfig::default();
        config.blockchain.rpc_url = "nope".to_string();
        config.blockchain.confirmation_blocks = 0;
        config.gas.min_gas_balance = "abc".to_string();
        config.observability.log_format = "xml".to_string();

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(
            fields,
            vec![
                "blockchain.rpc_url",
                "blockchain.confirmation_blocks",
                "gas.min_gas_balance",
                "observability.log_format"
            ]
        );
    }

    #[test]
    fn test_confirmation_floor() {
        let mut config = SweeperConfig::default();
        config.blockchain.confirmation_blocks = 5;
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].to_string(), "blockchain.confirmation_blocks: must be >= 6");

        config.blockchain.confirmation_blocks = 12;
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_duplicate_tokens_rejected() {
        let token = TokenConfig {
            symbol: "USDT".to_string(),
            contract: "0x55d398326f99059fF775485246999027B3197955".to_string(),
            decimals: 18,
            min_sweep_amount: "1".to_string(),
        };
        let mut config = SweeperConfig::default();
        config.tokens = vec![token.clone(), token];

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].to_string(), "tokens[1].contract: duplicate token");
    }
}
