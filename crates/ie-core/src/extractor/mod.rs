//! Entity extraction from ticket text.
//!
//! Two passes run over the same text: the language model (primary, bounded by
//! a timeout) and the deterministic [`PatternTable`]. Their results are merged
//! by `(type, value)` keeping the higher confidence. A model failure never
//! fails extraction; the outcome degrades to pattern results only.

pub mod patterns;

pub use patterns::{MatchContext, MatchFilter, PatternRule, PatternTable, SOFTWARE_ALLOWLIST};

use crate::config::EnrichmentConfig;
use crate::entity::{merge_entities, validate_entities, EntitySource, EntityType, ExtractedEntity};
use crate::error::{EnrichmentError, EnrichmentResult};
use ie_connectors::{LanguageModelConnector, ModelExtraction, TicketNote, TokenUsage};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};

/// Issue intent reported by the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueIntent {
    /// The problem sits on managed infrastructure.
    InternalCi,
    /// The problem is with a third party; no CI should be linked.
    ExternalDependency,
    Hybrid,
    #[default]
    Unknown,
}

impl IssueIntent {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().replace(['-', ' '], "_").as_str() {
            "internal_ci" | "internal" => IssueIntent::InternalCi,
            "external_dependency" | "external" => IssueIntent::ExternalDependency,
            "hybrid" => IssueIntent::Hybrid,
            _ => IssueIntent::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IssueIntent::InternalCi => "internal_ci",
            IssueIntent::ExternalDependency => "external_dependency",
            IssueIntent::Hybrid => "hybrid",
            IssueIntent::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for IssueIntent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one extraction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionOutcome {
    /// Merged entities, invalid ones flagged but retained.
    pub entities: Vec<ExtractedEntity>,
    pub intent: IssueIntent,
    /// Model confidence; 0 when the model pass failed.
    pub confidence: f64,
    pub token_usage: TokenUsage,
    /// Why the model pass failed, when it did.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_error: Option<String>,
}

impl ExtractionOutcome {
    pub fn valid_entities(&self) -> impl Iterator<Item = &ExtractedEntity> {
        self.entities.iter().filter(|e| e.is_valid())
    }

    pub fn invalid_count(&self) -> usize {
        self.entities.iter().filter(|e| !e.is_valid()).count()
    }

    /// Mean confidence of valid entities, 0 when there are none.
    pub fn entity_confidence(&self) -> f64 {
        let (sum, count) = self
            .valid_entities()
            .fold((0.0, 0usize), |(sum, n), e| (sum + e.confidence, n + 1));
        if count == 0 {
            0.0
        } else {
            sum / count as f64
        }
    }

    pub fn model_degraded(&self) -> bool {
        self.model_error.is_some()
    }
}

/// Extracts typed entities from a ticket summary and its notes.
pub struct EntityExtractor {
    model: Option<Arc<dyn LanguageModelConnector>>,
    patterns: Arc<PatternTable>,
    timeout: Duration,
    min_confidence: f64,
}

impl EntityExtractor {
    /// Creates an extractor; without a model only the pattern pass runs.
    pub fn new(model: Option<Arc<dyn LanguageModelConnector>>, config: &EnrichmentConfig) -> Self {
        Self {
            model,
            patterns: PatternTable::builtin(),
            timeout: config.model_timeout(),
            min_confidence: config.min_entity_confidence,
        }
    }

    pub fn with_patterns(mut self, patterns: Arc<PatternTable>) -> Self {
        self.patterns = patterns;
        self
    }

    #[instrument(skip(self, summary, notes), fields(notes = notes.len()))]
    pub async fn extract(&self, summary: &str, notes: &[TicketNote]) -> ExtractionOutcome {
        let text = compose_text(summary, notes);
        let pattern_entities = self.patterns.extract(&text);

        let mut outcome = match self.call_model(&text).await {
            Ok(extraction) => {
                let intent = IssueIntent::parse(&extraction.intent);
                let confidence = extraction.confidence.clamp(0.0, 1.0);
                let token_usage = extraction.token_usage;
                ExtractionOutcome {
                    entities: model_entities(extraction),
                    intent,
                    confidence,
                    token_usage,
                    model_error: None,
                }
            }
            Err(e) => {
                warn!(error = %e, "Language model extraction failed, using pattern results only");
                metrics::counter!("ie_model_failures_total", "reason" => e.kind()).increment(1);
                ExtractionOutcome {
                    entities: Vec::new(),
                    intent: IssueIntent::Unknown,
                    confidence: 0.0,
                    token_usage: TokenUsage::default(),
                    model_error: Some(e.to_string()),
                }
            }
        };

        for entity in outcome.entities.iter().chain(pattern_entities.iter()) {
            metrics::counter!("ie_entities_extracted_total", "source" => entity.source.as_str())
                .increment(1);
        }

        let mut entities = merge_entities(std::mem::take(&mut outcome.entities), pattern_entities);
        validate_entities(&mut entities, self.min_confidence);
        outcome.entities = entities;

        debug!(
            entities = outcome.entities.len(),
            invalid = outcome.invalid_count(),
            intent = %outcome.intent,
            "Extraction complete"
        );
        outcome
    }

    async fn call_model(&self, text: &str) -> EnrichmentResult<ModelExtraction> {
        let Some(model) = &self.model else {
            return Err(EnrichmentError::ExternalService(
                "no language model configured".to_string(),
            ));
        };

        let started = Instant::now();
        let result = tokio::time::timeout(self.timeout, model.extract(text)).await;
        metrics::histogram!("ie_model_call_duration_seconds").record(started.elapsed().as_secs_f64());

        match result {
            Ok(Ok(extraction)) => Ok(extraction),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(EnrichmentError::Timeout(format!(
                "language model call exceeded {}s",
                self.timeout.as_secs()
            ))),
        }
    }
}

/// Summary first, then notes oldest to newest.
fn compose_text(summary: &str, notes: &[TicketNote]) -> String {
    let mut text = summary.trim().to_string();
    for note in notes.iter().rev() {
        let body = note.text.trim();
        if body.is_empty() {
            continue;
        }
        if !text.is_empty() {
            text.push_str("\n\n");
        }
        text.push_str(body);
    }
    text
}

fn model_entities(extraction: ModelExtraction) -> Vec<ExtractedEntity> {
    let default_confidence = extraction.confidence;
    extraction
        .entities
        .into_iter()
        .filter_map(|entity| {
            let value = entity.value.trim();
            if value.is_empty() {
                return None;
            }
            let Some(entity_type) = EntityType::from_category(&entity.category) else {
                debug!(category = %entity.category, "Ignoring unknown entity category");
                return None;
            };
            Some(
                ExtractedEntity::new(
                    entity_type,
                    value,
                    entity.confidence.unwrap_or(default_confidence),
                    EntitySource::Llm,
                )
                .with_metadata("llm_category", entity.category.as_str()),
            )
        })
        .collect()
}
