//! Error taxonomy for the enrichment pipeline.

use crate::store::StoreError;
use ie_connectors::ConnectorError;
use thiserror::Error;

/// Errors raised inside the enrichment pipeline.
///
/// Orchestrator entry points never surface these to callers directly; they
/// are folded into an [`EnrichmentOutcome`](crate::orchestrator::EnrichmentOutcome).
#[derive(Error, Debug, Clone)]
pub enum EnrichmentError {
    /// A ticket or enrichment state does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A model call exceeded its budget.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// A lookup, messaging or ticket system call failed.
    #[error("External service error: {0}")]
    ExternalService(String),

    /// An extracted entity or caller input is malformed.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A clarification is already pending for the ticket.
    #[error("Duplicate request: {0}")]
    DuplicateRequest(String),

    /// Persistence failure.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<ConnectorError> for EnrichmentError {
    fn from(err: ConnectorError) -> Self {
        match err {
            ConnectorError::NotFound(msg) => EnrichmentError::NotFound(msg),
            ConnectorError::Timeout(msg) => EnrichmentError::Timeout(msg),
            ConnectorError::InvalidRequest(msg) => EnrichmentError::Validation(msg),
            other => EnrichmentError::ExternalService(other.to_string()),
        }
    }
}

impl EnrichmentError {
    /// Short machine-readable kind, used in logs and metrics labels.
    pub fn kind(&self) -> &'static str {
        match self {
            EnrichmentError::NotFound(_) => "not_found",
            EnrichmentError::Timeout(_) => "timeout",
            EnrichmentError::ExternalService(_) => "external_service",
            EnrichmentError::Validation(_) => "validation",
            EnrichmentError::DuplicateRequest(_) => "duplicate_request",
            EnrichmentError::Store(_) => "store",
            EnrichmentError::Config(_) => "config",
        }
    }
}

/// Result type for pipeline operations.
pub type EnrichmentResult<T> = Result<T, EnrichmentError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connector_errors_map_onto_taxonomy() {
        let not_found: EnrichmentError = ConnectorError::NotFound("INC1".into()).into();
        assert_eq!(not_found.kind(), "not_found");

        let timeout: EnrichmentError = ConnectorError::Timeout("120s".into()).into();
        assert_eq!(timeout.kind(), "timeout");

        let invalid: EnrichmentError = ConnectorError::InvalidRequest("bad".into()).into();
        assert_eq!(invalid.kind(), "validation");

        let failed: EnrichmentError = ConnectorError::RateLimited(30).into();
        assert!(matches!(failed, EnrichmentError::ExternalService(ref m) if m.contains("30")));
    }

    #[test]
    fn test_store_errors_convert() {
        let err: EnrichmentError = StoreError::Query("locked".into()).into();
        assert_eq!(err.kind(), "store");
        assert!(err.to_string().contains("locked"));
    }
}
