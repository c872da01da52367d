//! Configuration validation.
//!
//! Serde handles syntax; this module checks semantics and returns every
//! problem found rather than stopping at the first.

use std::collections::HashSet;

use thiserror::Error;

use crate::config::schema::BrokerConfig;

/// A single semantic problem in the configuration.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("duplicate server id '{0}'")]
    DuplicateServer(String),

    #[error("server '{id}' has invalid base_url: {reason}")]
    InvalidBaseUrl { id: String, reason: String },

    #[error("server id must not be empty")]
    EmptyServerId,

    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("strategy.small_page_threshold ({small}) exceeds large_page_threshold ({large})")]
    ThresholdOrder { small: usize, large: usize },

    #[error("query.fill_factor must be within (0, 1], got {0}")]
    FillFactor(String),

    #[error("resolution.batch_size ({batch}) exceeds max_reference_ids ({max})")]
    BatchSize { batch: usize, max: usize },
}

/// Validate a parsed configuration.
pub fn validate_config(config: &BrokerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let mut seen = HashSet::new();
    for server in &config.servers {
        if server.id.trim().is_empty() {
            errors.push(ValidationError::EmptyServerId);
            continue;
        }
        if !seen.insert(server.id.as_str()) {
            errors.push(ValidationError::DuplicateServer(server.id.clone()));
        }
        match url::Url::parse(&server.base_url) {
            Ok(url) if url.cannot_be_a_base() => errors.push(ValidationError::InvalidBaseUrl {
                id: server.id.clone(),
                reason: "not a base URL".into(),
            }),
            Ok(_) => {}
            Err(e) => errors.push(ValidationError::InvalidBaseUrl {
                id: server.id.clone(),
                reason: e.to_string(),
            }),
        }
        if server.timeout_secs == Some(0) {
            errors.push(ValidationError::Zero { field: "servers.timeout_secs" });
        }
    }

    let nonzero: [(&'static str, u64); 9] = [
        ("timeouts.search_secs", config.timeouts.search_secs),
        ("timeouts.chain_search_secs", config.timeouts.chain_search_secs),
        ("timeouts.distributed_chain_secs", config.timeouts.distributed_chain_secs),
        ("timeouts.distributed_include_secs", config.timeouts.distributed_include_secs),
        ("circuit_breaker.failure_threshold", config.circuit_breaker.failure_threshold as u64),
        ("limits.max_concurrent_searches", config.limits.max_concurrent_searches as u64),
        ("limits.max_total_results", config.limits.max_total_results as u64),
        ("query.default_page_size", config.query.default_page_size as u64),
        ("resolution.batch_size", config.resolution.batch_size as u64),
    ];
    for (field, value) in nonzero {
        if value == 0 {
            errors.push(ValidationError::Zero { field });
        }
    }

    if config.strategy.small_page_threshold > config.strategy.large_page_threshold {
        errors.push(ValidationError::ThresholdOrder {
            small: config.strategy.small_page_threshold,
            large: config.strategy.large_page_threshold,
        });
    }

    let fill = config.query.fill_factor;
    if !(fill > 0.0 && fill <= 1.0) {
        errors.push(ValidationError::FillFactor(fill.to_string()));
    }

    if config.resolution.batch_size > config.resolution.max_reference_ids {
        errors.push(ValidationError::BatchSize {
            batch: config.resolution.batch_size,
            max: config.resolution.max_reference_ids,
        });
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
