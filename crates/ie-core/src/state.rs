//! Persisted enrichment state.

use crate::entity::EntityType;
use crate::matcher::CiMatchCandidate;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::str::FromStr;

/// Position of a ticket in the enrichment state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnrichmentStage {
    Created,
    NotesAnalyzed,
    ClarificationPending,
    Enriched,
    Error,
}

impl EnrichmentStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnrichmentStage::Created => "CREATED",
            EnrichmentStage::NotesAnalyzed => "NOTES_ANALYZED",
            EnrichmentStage::ClarificationPending => "CLARIFICATION_PENDING",
            EnrichmentStage::Enriched => "ENRICHED",
            EnrichmentStage::Error => "ERROR",
        }
    }

    /// Terminal for a processing cycle; a later forced trigger may revisit.
    pub fn is_terminal(&self) -> bool {
        matches!(self, EnrichmentStage::Enriched | EnrichmentStage::Error)
    }

    /// Stages a periodic sweep picks up.
    pub fn is_active(&self) -> bool {
        matches!(self, EnrichmentStage::Created | EnrichmentStage::NotesAnalyzed)
    }
}

impl std::fmt::Display for EnrichmentStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EnrichmentStage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().replace(['-', ' '], "_").as_str() {
            "CREATED" => Ok(EnrichmentStage::Created),
            "NOTES_ANALYZED" => Ok(EnrichmentStage::NotesAnalyzed),
            "CLARIFICATION_PENDING" => Ok(EnrichmentStage::ClarificationPending),
            "ENRICHED" => Ok(EnrichmentStage::Enriched),
            "ERROR" => Ok(EnrichmentStage::Error),
            other => Err(format!("unknown enrichment stage: {}", other)),
        }
    }
}

/// Well-known metadata keys.
pub mod meta {
    pub const MAX_ATTEMPTS_REACHED: &str = "max_attempts_reached";
    pub const MAX_AGE_REACHED: &str = "max_age_reached";
    pub const EXTERNAL_DEPENDENCY: &str = "external_dependency";
    pub const CI_LINKED: &str = "ci_linked";
    pub const LINKED_CI_ID: &str = "linked_ci_id";
    pub const MANUAL_SELECTION: &str = "manual_selection";
    pub const MANUAL_SKIP: &str = "manual_skip";
    pub const RESPONDED_BY: &str = "responded_by";
    /// Mirror of the pending clarification request.
    pub const CLARIFICATION: &str = "clarification";
    /// Channel used for clarification prompts for this ticket.
    pub const CHANNEL: &str = "channel";
    pub const INTENT: &str = "intent";
    pub const MODEL_DEGRADED: &str = "model_degraded";
    pub const INVALID_ENTITIES: &str = "invalid_entities";
    pub const ERROR: &str = "error";
    /// Set when a decision failed after extraction; forces a re-run.
    pub const RETRY_PENDING: &str = "retry_pending";

    /// Keys written by a decision. A fresh extraction starts without them.
    pub const DECISION_KEYS: [&str; 8] = [
        MAX_ATTEMPTS_REACHED,
        MAX_AGE_REACHED,
        EXTERNAL_DEPENDENCY,
        CI_LINKED,
        LINKED_CI_ID,
        MANUAL_SELECTION,
        MANUAL_SKIP,
        RESPONDED_BY,
    ];
}

/// Confidence summary, each value in 0.0-1.0.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceScores {
    pub overall: f64,
    pub ci_match: f64,
    pub entity_extraction: f64,
}

impl ConfidenceScores {
    /// `ci_match` is on the 0-100 matcher scale.
    pub fn new(ci_match: f64, entity_extraction: f64) -> Self {
        let ci_match = (ci_match / 100.0).clamp(0.0, 1.0);
        let entity_extraction = entity_extraction.clamp(0.0, 1.0);
        Self {
            overall: (ci_match + entity_extraction) / 2.0,
            ci_match,
            entity_extraction,
        }
    }
}

/// Durable record of one ticket's progress through the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentState {
    pub ticket_id: String,
    pub ticket_number: String,
    pub parent_id: Option<String>,
    pub stage: EnrichmentStage,
    /// Valid entities from the latest extraction only.
    pub extracted_entities: BTreeMap<EntityType, Vec<String>>,
    /// Candidates considered in the latest decision.
    pub matched_cis: Vec<CiMatchCandidate>,
    pub confidence_scores: ConfidenceScores,
    /// Extractions that actually ran.
    pub attempts: u32,
    /// Newest note seen at the last extraction.
    pub last_note_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl EnrichmentState {
    pub fn new(
        ticket_id: impl Into<String>,
        ticket_number: impl Into<String>,
        parent_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            ticket_id: ticket_id.into(),
            ticket_number: ticket_number.into(),
            parent_id,
            stage: EnrichmentStage::Created,
            extracted_entities: BTreeMap::new(),
            matched_cis: Vec::new(),
            confidence_scores: ConfidenceScores::default(),
            attempts: 0,
            last_note_at: None,
            created_at: now,
            updated_at: now,
            metadata: BTreeMap::new(),
        }
    }

    pub fn transition(&mut self, stage: EnrichmentStage, now: DateTime<Utc>) {
        self.stage = stage;
        self.updated_at = now;
    }

    /// Advances `last_note_at`; older timestamps are ignored.
    pub fn observe_note(&mut self, at: DateTime<Utc>) {
        if self.last_note_at.map_or(true, |prev| at > prev) {
            self.last_note_at = Some(at);
        }
    }

    pub fn set_meta(&mut self, key: &str, value: impl Into<Value>) {
        self.metadata.insert(key.to_string(), value.into());
    }

    pub fn clear_meta(&mut self, key: &str) -> Option<Value> {
        self.metadata.remove(key)
    }

    /// True when `key` holds boolean `true`.
    pub fn flag(&self, key: &str) -> bool {
        self.metadata.get(key).and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }

    pub fn is_terminal(&self) -> bool {
        self.stage.is_terminal()
    }

    pub fn linked_ci_id(&self) -> Option<&str> {
        self.meta_str(meta::LINKED_CI_ID)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_stage_round_trips_through_strings() {
        for stage in [
            EnrichmentStage::Created,
            EnrichmentStage::NotesAnalyzed,
            EnrichmentStage::ClarificationPending,
            EnrichmentStage::Enriched,
            EnrichmentStage::Error,
        ] {
            assert_eq!(stage.as_str().parse::<EnrichmentStage>(), Ok(stage));
            let json = serde_json::to_string(&stage).unwrap();
            assert_eq!(json, format!("\"{}\"", stage.as_str()));
        }
        assert_eq!("notes-analyzed".parse(), Ok(EnrichmentStage::NotesAnalyzed));
        assert!("DONE".parse::<EnrichmentStage>().is_err());
    }

    #[test]
    fn test_terminal_and_active_stages() {
        assert!(EnrichmentStage::Enriched.is_terminal());
        assert!(EnrichmentStage::Error.is_terminal());
        assert!(!EnrichmentStage::ClarificationPending.is_terminal());
        assert!(EnrichmentStage::Created.is_active());
        assert!(!EnrichmentStage::ClarificationPending.is_active());
    }

    #[test]
    fn test_last_note_at_never_moves_backwards() {
        let now = Utc::now();
        let mut state = EnrichmentState::new("T1", "INC0001", None, now);
        state.observe_note(now);
        state.observe_note(now - Duration::hours(1));
        assert_eq!(state.last_note_at, Some(now));
        state.observe_note(now + Duration::minutes(1));
        assert_eq!(state.last_note_at, Some(now + Duration::minutes(1)));
    }

    #[test]
    fn test_flags() {
        let mut state = EnrichmentState::new("T1", "INC0001", None, Utc::now());
        assert!(!state.flag(meta::CI_LINKED));
        state.set_meta(meta::CI_LINKED, true);
        state.set_meta(meta::LINKED_CI_ID, "ci-1");
        assert!(state.flag(meta::CI_LINKED));
        assert_eq!(state.linked_ci_id(), Some("ci-1"));
        assert!(!state.flag(meta::LINKED_CI_ID));
    }

    #[test]
    fn test_confidence_scores_average() {
        let scores = ConfidenceScores::new(95.0, 0.85);
        assert!((scores.ci_match - 0.95).abs() < 1e-9);
        assert!((scores.overall - 0.9).abs() < 1e-9);
        assert_eq!(ConfidenceScores::new(0.0, 0.0).overall, 0.0);
    }

    #[test]
    fn test_state_serializes_entity_map_with_type_keys() {
        let mut state = EnrichmentState::new("T1", "INC0001", Some("CS1".into()), Utc::now());
        state
            .extracted_entities
            .insert(EntityType::IpAddress, vec!["192.168.1.5".into()]);
        let value = serde_json::to_value(&state).unwrap();
        assert_eq!(value["stage"], "CREATED");
        assert_eq!(value["extracted_entities"]["IP_ADDRESS"][0], "192.168.1.5");

        let back: EnrichmentState = serde_json::from_value(value).unwrap();
        assert_eq!(back, state);
    }
}
