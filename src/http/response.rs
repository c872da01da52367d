//! Error responses.
//!
//! # Status mapping
//! - admission rejections: 429 (rate limit) or 503, with `Retry-After`
//! - invalid query or continuation token: 400
//! - query too costly to resolve: 422
//! - every selected server failed: 502
//! - no server can serve the query: 503
//! - internal failure: 500

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::error::BrokerError;
use crate::federation::DegradedServer;
use crate::strategy::ExcludedServer;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: &'static str,
    pub message: String,
    pub retryable: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<DegradedServer>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub excluded: Vec<ExcludedServer>,
}

pub fn status_code(error: &BrokerError) -> StatusCode {
    match error {
        BrokerError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        BrokerError::TooManyConcurrentSearches { .. }
        | BrokerError::MemoryPressure { .. }
        | BrokerError::NoServersAvailable { .. }
        | BrokerError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
        BrokerError::Invalid(_) => StatusCode::BAD_REQUEST,
        BrokerError::TooCostly(_) => StatusCode::UNPROCESSABLE_ENTITY,
        BrokerError::AllServersFailed { .. } => StatusCode::BAD_GATEWAY,
        BrokerError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_code(error: &BrokerError) -> &'static str {
    match error {
        BrokerError::RateLimited { .. } => "rate_limited",
        BrokerError::TooManyConcurrentSearches { .. } => "too_many_concurrent_searches",
        BrokerError::MemoryPressure { .. } => "memory_pressure",
        BrokerError::Invalid(_) => "invalid_query",
        BrokerError::TooCostly(_) => "too_costly",
        BrokerError::NoServersAvailable { .. } => "no_servers_available",
        BrokerError::AllServersFailed { .. } => "all_servers_failed",
        BrokerError::Cancelled => "cancelled",
        BrokerError::Internal(_) => "internal",
    }
}

impl IntoResponse for BrokerError {
    fn into_response(self) -> Response {
        let status = status_code(&self);
        let retry_after = self.retry_after();
        let body = ErrorBody {
            error: error_code(&self),
            message: self.to_string(),
            retryable: self.is_retryable(),
            failures: match &self {
                BrokerError::AllServersFailed { failures } => {
                    failures.iter().map(DegradedServer::from).collect()
                }
                _ => Vec::new(),
            },
            excluded: match &self {
                BrokerError::NoServersAvailable { excluded } => excluded
                    .iter()
                    .map(|(server, reason)| ExcludedServer {
                        server: server.clone(),
                        reason: reason.clone(),
                    })
                    .collect(),
                _ => Vec::new(),
            },
        };

        let mut response = (status, Json(body)).into_response();
        if let Some(after) = retry_after {
            // Whole seconds, at least one.
            let secs = after.as_secs() + u64::from(after.subsec_nanos() > 0);
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs.max(1)));
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{QueryError, ServerError};
    use std::time::Duration;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (
                BrokerError::RateLimited { client: "c".into(), retry_after: Duration::from_secs(3) },
                StatusCode::TOO_MANY_REQUESTS,
            ),
            (BrokerError::TooManyConcurrentSearches { limit: 1 }, StatusCode::SERVICE_UNAVAILABLE),
            (
                BrokerError::Invalid(QueryError::InvalidToken("x".into())),
                StatusCode::BAD_REQUEST,
            ),
            (BrokerError::TooCostly("x".into()), StatusCode::UNPROCESSABLE_ENTITY),
            (BrokerError::AllServersFailed { failures: vec![] }, StatusCode::BAD_GATEWAY),
            (BrokerError::NoServersAvailable { excluded: vec![] }, StatusCode::SERVICE_UNAVAILABLE),
            (BrokerError::Internal("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (error, expected) in cases {
            assert_eq!(status_code(&error), expected, "{error}");
        }
    }

    #[test]
    fn test_retry_after_header() {
        let response = BrokerError::RateLimited {
            client: "c".into(),
            retry_after: Duration::from_millis(2500),
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "3");

        let response = BrokerError::AllServersFailed {
            failures: vec![ServerError::Timeout { server: "a".into(), after: Duration::from_secs(1) }],
        }
        .into_response();
        assert!(response.headers().get(header::RETRY_AFTER).is_none());
    }
}
