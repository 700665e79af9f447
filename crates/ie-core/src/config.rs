//! Pipeline configuration.

use crate::error::{EnrichmentError, EnrichmentResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_CONFIDENCE_THRESHOLD: u8 = 70;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_MAX_AGE_HOURS: i64 = 24;
/// Upper bound for `max_age_hours` (one year).
pub const MAX_AGE_HOURS_LIMIT: i64 = 24 * 365;
pub const DEFAULT_CLARIFICATION_TTL_SECS: u64 = 4 * 60 * 60;
pub const DEFAULT_MODEL_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_NOTE_LIMIT: usize = 50;
pub const DEFAULT_NAME_SEARCH_LIMIT: usize = 5;
pub const MAX_CLARIFICATION_CANDIDATES: usize = 5;
pub const DEFAULT_MIN_ENTITY_CONFIDENCE: f64 = 0.3;
pub const DEFAULT_SWEEP_CONCURRENCY: usize = 4;

/// Configuration consumed by the enrichment pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnrichmentConfig {
    /// Master switch; when false every invocation is a no-op.
    pub enabled: bool,
    /// Matches at or above this confidence (0-100) are auto-linked.
    pub confidence_threshold: u8,
    /// Extraction attempts before a ticket is force-enriched.
    pub max_attempts: u32,
    /// Ticket age after which a ticket is force-enriched.
    pub max_age_hours: i64,
    /// How long a pending clarification suppresses duplicates.
    pub clarification_ttl_secs: u64,
    /// Budget for one language model call.
    pub model_timeout_secs: u64,
    /// Number of newest notes read per invocation.
    pub note_limit: usize,
    /// Results requested from the name-based CI search.
    pub name_search_limit: usize,
    /// Candidates shown in a clarification prompt.
    pub max_clarification_candidates: usize,
    /// Entities below this confidence are flagged invalid.
    pub min_entity_confidence: f64,
    /// Channel used for clarification prompts when the ticket names none.
    pub clarification_channel: Option<String>,
    /// Tickets processed in parallel by a sweep.
    pub sweep_concurrency: usize,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            max_age_hours: DEFAULT_MAX_AGE_HOURS,
            clarification_ttl_secs: DEFAULT_CLARIFICATION_TTL_SECS,
            model_timeout_secs: DEFAULT_MODEL_TIMEOUT_SECS,
            note_limit: DEFAULT_NOTE_LIMIT,
            name_search_limit: DEFAULT_NAME_SEARCH_LIMIT,
            max_clarification_candidates: MAX_CLARIFICATION_CANDIDATES,
            min_entity_confidence: DEFAULT_MIN_ENTITY_CONFIDENCE,
            clarification_channel: None,
            sweep_concurrency: DEFAULT_SWEEP_CONCURRENCY,
        }
    }
}

impl EnrichmentConfig {
    pub fn clarification_ttl(&self) -> Duration {
        Duration::from_secs(self.clarification_ttl_secs)
    }

    pub fn model_timeout(&self) -> Duration {
        Duration::from_secs(self.model_timeout_secs)
    }

    /// Checks value ranges.
    pub fn validate(&self) -> EnrichmentResult<()> {
        if self.confidence_threshold > 100 {
            return Err(EnrichmentError::Config(format!(
                "confidence_threshold must be 0-100, got {}",
                self.confidence_threshold
            )));
        }
        if self.max_attempts == 0 {
            return Err(EnrichmentError::Config("max_attempts must be at least 1".into()));
        }
        if self.max_age_hours <= 0 || self.max_age_hours > MAX_AGE_HOURS_LIMIT {
            return Err(EnrichmentError::Config(format!(
                "max_age_hours must be 1-{}, got {}",
                MAX_AGE_HOURS_LIMIT, self.max_age_hours
            )));
        }
        if self.clarification_ttl_secs == 0 {
            return Err(EnrichmentError::Config(
                "clarification_ttl_secs must be positive".into(),
            ));
        }
        if self.model_timeout_secs == 0 {
            return Err(EnrichmentError::Config("model_timeout_secs must be positive".into()));
        }
        if self.max_clarification_candidates == 0
            || self.max_clarification_candidates > MAX_CLARIFICATION_CANDIDATES
        {
            return Err(EnrichmentError::Config(format!(
                "max_clarification_candidates must be 1-{}",
                MAX_CLARIFICATION_CANDIDATES
            )));
        }
        if !(0.0..=1.0).contains(&self.min_entity_confidence) {
            return Err(EnrichmentError::Config(
                "min_entity_confidence must be between 0.0 and 1.0".into(),
            ));
        }
        if self.sweep_concurrency == 0 {
            return Err(EnrichmentError::Config("sweep_concurrency must be at least 1".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EnrichmentConfig::default();
        assert!(config.enabled);
        assert_eq!(config.confidence_threshold, 70);
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.max_age_hours, 24);
        assert_eq!(config.clarification_ttl(), Duration::from_secs(14_400));
        assert_eq!(config.model_timeout(), Duration::from_secs(120));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_like_json_uses_defaults() {
        let config: EnrichmentConfig =
            serde_json::from_str(r#"{"confidence_threshold": 90, "max_attempts": 5}"#).unwrap();
        assert_eq!(config.confidence_threshold, 90);
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.max_age_hours, DEFAULT_MAX_AGE_HOURS);
    }

    #[test]
    fn test_validation_rejects_out_of_range() {
        let cases = [
            EnrichmentConfig {
                confidence_threshold: 101,
                ..Default::default()
            },
            EnrichmentConfig {
                max_attempts: 0,
                ..Default::default()
            },
            EnrichmentConfig {
                max_age_hours: 0,
                ..Default::default()
            },
            EnrichmentConfig {
                max_age_hours: i64::MAX,
                ..Default::default()
            },
            EnrichmentConfig {
                max_clarification_candidates: 6,
                ..Default::default()
            },
            EnrichmentConfig {
                min_entity_confidence: 1.5,
                ..Default::default()
            },
        ];
        for config in cases {
            assert!(matches!(config.validate(), Err(EnrichmentError::Config(_))));
        }
    }
}
