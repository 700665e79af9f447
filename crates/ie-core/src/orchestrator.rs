//! The enrichment state machine.
//!
//! ```text
//! CREATED -> NOTES_ANALYZED -> ENRICHED
//!                           -> CLARIFICATION_PENDING -> ENRICHED
//!                           -> ERROR
//! ```
//!
//! Every public entry point returns an [`EnrichmentOutcome`]; failures are
//! folded into the outcome instead of being returned as errors.

use crate::clarification::{ClarificationCoordinator, ManualResolution};
use crate::clock::Clock;
use crate::config::EnrichmentConfig;
use crate::entity::{group_by_type, EntityType};
use crate::error::{EnrichmentError, EnrichmentResult};
use crate::extractor::{EntityExtractor, ExtractionOutcome, IssueIntent};
use crate::matcher::{CiMatchCandidate, CiMatcher};
use crate::state::{meta, ConfidenceScores, EnrichmentStage, EnrichmentState};
use crate::store::EnrichmentStateStore;
use async_trait::async_trait;
use ie_connectors::{
    CiRepositoryConnector, ClarificationCallback, ConnectorError, LanguageModelConnector,
    MessagingConnector, Ticket, TicketSystemConnector,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, instrument, warn};

/// Collaborators the orchestrator is wired with.
pub struct EnrichmentServices {
    pub tickets: Arc<dyn TicketSystemConnector>,
    pub ci_repository: Arc<dyn CiRepositoryConnector>,
    pub messaging: Arc<dyn MessagingConnector>,
    /// Without a model, extraction runs the pattern pass only.
    pub model: Option<Arc<dyn LanguageModelConnector>>,
    pub store: Arc<dyn EnrichmentStateStore>,
    pub clock: Arc<dyn Clock>,
}

/// Structured result of every orchestrator entry point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentOutcome {
    pub success: bool,
    pub ticket_id: String,
    /// `None` when the ticket is not tracked.
    pub stage: Option<EnrichmentStage>,
    pub message: String,
    pub ci_linked: bool,
    pub linked_ci: Option<String>,
    /// The invocation did no work.
    pub skipped: bool,
    pub attempts: u32,
}

impl EnrichmentOutcome {
    pub fn from_state(state: &EnrichmentState, success: bool, message: impl Into<String>) -> Self {
        Self {
            success,
            ticket_id: state.ticket_id.clone(),
            stage: Some(state.stage),
            message: message.into(),
            ci_linked: state.flag(meta::CI_LINKED),
            linked_ci: state.linked_ci_id().map(str::to_string),
            skipped: false,
            attempts: state.attempts,
        }
    }

    pub fn not_tracked(ticket_id: &str) -> Self {
        Self {
            success: false,
            ticket_id: ticket_id.to_string(),
            stage: None,
            message: "Ticket is not tracked for enrichment".to_string(),
            ci_linked: false,
            linked_ci: None,
            skipped: true,
            attempts: 0,
        }
    }

    fn failure(ticket_id: &str, err: &EnrichmentError) -> Self {
        Self {
            success: false,
            ticket_id: ticket_id.to_string(),
            stage: None,
            message: err.to_string(),
            ci_linked: false,
            linked_ci: None,
            skipped: false,
            attempts: 0,
        }
    }

    fn skipped(mut self) -> Self {
        self.skipped = true;
        self
    }

    /// Label for the runs counter.
    pub fn metric_label(&self) -> &'static str {
        if !self.success {
            "failure"
        } else if self.skipped {
            "skipped"
        } else {
            match self.stage {
                Some(EnrichmentStage::Enriched) if self.ci_linked => "linked",
                Some(EnrichmentStage::Enriched) => "enriched",
                Some(EnrichmentStage::ClarificationPending) => "clarification",
                Some(_) => "progressed",
                None => "untracked",
            }
        }
    }
}

/// Drives tickets through extraction, matching and linking.
pub struct EnrichmentOrchestrator {
    config: EnrichmentConfig,
    tickets: Arc<dyn TicketSystemConnector>,
    store: Arc<dyn EnrichmentStateStore>,
    extractor: EntityExtractor,
    matcher: CiMatcher,
    clarifications: ClarificationCoordinator,
    clock: Arc<dyn Clock>,
}

impl EnrichmentOrchestrator {
    pub fn new(config: EnrichmentConfig, services: EnrichmentServices) -> EnrichmentResult<Self> {
        config.validate()?;

        let extractor = EntityExtractor::new(services.model, &config);
        let matcher = CiMatcher::new(
            services.ci_repository,
            config.confidence_threshold,
            config.name_search_limit,
            services.clock.clone(),
        );
        let clarifications = ClarificationCoordinator::new(
            services.messaging,
            services.store.clone(),
            services.clock.clone(),
            &config,
        );

        Ok(Self {
            config,
            tickets: services.tickets,
            store: services.store,
            extractor,
            matcher,
            clarifications,
            clock: services.clock,
        })
    }

    /// Replaces the extractor, e.g. to use a custom pattern table.
    pub fn with_extractor(mut self, extractor: EntityExtractor) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn config(&self) -> &EnrichmentConfig {
        &self.config
    }

    pub fn clarifications(&self) -> &ClarificationCoordinator {
        &self.clarifications
    }

    /// Current state of a tracked ticket.
    pub async fn status(&self, ticket_id: &str) -> EnrichmentResult<Option<EnrichmentState>> {
        Ok(self.store.get(ticket_id).await?)
    }

    /// Puts a ticket on the watch list in `CREATED`.
    #[instrument(skip(self))]
    pub async fn start_tracking(
        &self,
        ticket_id: &str,
        ticket_number: &str,
        parent_id: Option<String>,
    ) -> EnrichmentOutcome {
        let result: EnrichmentResult<EnrichmentOutcome> = async {
            if let Some(existing) = self.store.get(ticket_id).await? {
                return Ok(EnrichmentOutcome::from_state(&existing, true, "Already tracked").skipped());
            }
            let state = EnrichmentState::new(ticket_id, ticket_number, parent_id, self.clock.now());
            self.store.upsert(&state).await?;
            info!(ticket_id = %ticket_id, "Tracking ticket for enrichment");
            Ok(EnrichmentOutcome::from_state(&state, true, "Tracking started"))
        }
        .await;

        result.unwrap_or_else(|e| EnrichmentOutcome::failure(ticket_id, &e))
    }

    /// Runs one enrichment cycle for a ticket.
    ///
    /// Without `force`, tickets in `ENRICHED`, `ERROR` or
    /// `CLARIFICATION_PENDING` are returned unchanged.
    #[instrument(skip(self))]
    pub async fn process_ticket(&self, ticket_id: &str, force: bool) -> EnrichmentOutcome {
        if !self.config.enabled {
            let mut outcome = EnrichmentOutcome::not_tracked(ticket_id);
            outcome.success = true;
            outcome.message = "Enrichment is disabled".to_string();
            return outcome;
        }

        let started = Instant::now();
        let result = self.run(ticket_id, force).await;
        let outcome = result.unwrap_or_else(|e| {
            error!(ticket_id = %ticket_id, error = %e, kind = e.kind(), "Enrichment failed");
            EnrichmentOutcome::failure(ticket_id, &e)
        });

        metrics::counter!("ie_enrichment_runs_total", "outcome" => outcome.metric_label())
            .increment(1);
        metrics::histogram!("ie_enrichment_duration_seconds")
            .record(started.elapsed().as_secs_f64());
        outcome
    }

    /// Pre-closure pass. A no-op for tickets already enriched with candidates;
    /// otherwise a forced [`process_ticket`](Self::process_ticket).
    #[instrument(skip(self))]
    pub async fn run_final_enrichment(&self, ticket_id: &str) -> EnrichmentOutcome {
        match self.store.get(ticket_id).await {
            Ok(Some(state))
                if state.stage == EnrichmentStage::Enriched && !state.matched_cis.is_empty() =>
            {
                debug!(ticket_id = %ticket_id, "Final enrichment already complete");
                EnrichmentOutcome::from_state(&state, true, "Already enriched").skipped()
            }
            Ok(Some(_)) => self.process_ticket(ticket_id, true).await,
            Ok(None) => EnrichmentOutcome::not_tracked(ticket_id),
            Err(e) => EnrichmentOutcome::failure(ticket_id, &e.into()),
        }
    }

    pub async fn handle_clarification_response(
        &self,
        ticket_id: &str,
        ci_id: &str,
        responded_by: &str,
    ) -> EnrichmentOutcome {
        self.clarifications
            .handle_response(self, ticket_id, ci_id, responded_by)
            .await
    }

    pub async fn handle_clarification_skip(
        &self,
        ticket_id: &str,
        responded_by: &str,
    ) -> EnrichmentOutcome {
        self.clarifications
            .handle_skip(self, ticket_id, responded_by)
            .await
    }

    /// Entry point for messaging callbacks.
    pub async fn handle_clarification_event(
        &self,
        callback: ClarificationCallback,
    ) -> EnrichmentOutcome {
        self.clarifications.handle_event(self, callback).await
    }

    async fn run(&self, ticket_id: &str, force: bool) -> EnrichmentResult<EnrichmentOutcome> {
        let Some(mut state) = self.store.get(ticket_id).await? else {
            debug!(ticket_id = %ticket_id, "Ticket not tracked");
            return Ok(EnrichmentOutcome::not_tracked(ticket_id));
        };

        if !force
            && matches!(
                state.stage,
                EnrichmentStage::Enriched
                    | EnrichmentStage::Error
                    | EnrichmentStage::ClarificationPending
            )
        {
            let message = format!("Ticket is {}; nothing to do", state.stage);
            return Ok(EnrichmentOutcome::from_state(&state, true, message).skipped());
        }

        let ticket = match self.tickets.get_ticket(ticket_id).await {
            Ok(Some(ticket)) => ticket,
            Ok(None) | Err(ConnectorError::NotFound(_)) => {
                return self.mark_error(state, "Ticket could not be fetched").await;
            }
            Err(e) => {
                warn!(ticket_id = %ticket_id, error = %e, "Ticket fetch failed, will retry");
                return Err(e.into());
            }
        };
        let notes = self
            .tickets
            .get_notes(ticket_id, self.config.note_limit)
            .await?;
        let newest_note = notes.iter().map(|n| n.created_at).max();
        let now = self.clock.now();

        // No new notes.
        let has_new_notes = match (newest_note, state.last_note_at) {
            (Some(newest), Some(last)) => newest > last,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if state.attempts > 0 && !has_new_notes && !state.flag(meta::RETRY_PENDING) {
            metrics::counter!("ie_stop_conditions_total", "reason" => "no_new_notes").increment(1);
            debug!(ticket_id = %ticket_id, attempts = state.attempts, "No new notes, skipping");
            return Ok(
                EnrichmentOutcome::from_state(&state, true, "No new notes since last extraction")
                    .skipped(),
            );
        }

        if state.attempts >= self.config.max_attempts {
            let message = format!("Maximum attempts ({}) reached", self.config.max_attempts);
            return self
                .force_enriched(state, meta::MAX_ATTEMPTS_REACHED, message)
                .await;
        }

        let max_age = chrono::Duration::try_hours(self.config.max_age_hours).ok_or_else(|| {
            EnrichmentError::Config(format!(
                "max_age_hours out of range: {}",
                self.config.max_age_hours
            ))
        })?;
        if now - ticket.created_at > max_age {
            let message = format!("Ticket older than {} hours", self.config.max_age_hours);
            return self
                .force_enriched(state, meta::MAX_AGE_REACHED, message)
                .await;
        }

        let extraction = self
            .extractor
            .extract(&ticket.summary_text(), &notes)
            .await;

        state.attempts += 1;
        if let Some(newest) = newest_note {
            state.observe_note(newest);
        }
        record_extraction(&mut state, &extraction);
        state.transition(EnrichmentStage::NotesAnalyzed, self.clock.now());
        self.store.upsert(&state).await?;
        info!(
            ticket_id = %ticket_id,
            attempt = state.attempts,
            entities = extraction.valid_entities().count(),
            intent = %extraction.intent,
            "Notes analyzed"
        );

        self.decide(state, &ticket, &extraction).await
    }

    async fn decide(
        &self,
        mut state: EnrichmentState,
        ticket: &Ticket,
        extraction: &ExtractionOutcome,
    ) -> EnrichmentResult<EnrichmentOutcome> {
        let ticket_id = state.ticket_id.clone();

        if extraction.intent == IssueIntent::ExternalDependency {
            self.annotate(
                &ticket_id,
                &format!(
                    "Incident enrichment: issue classified as an external dependency; \
                     no configuration item linked.\nExtracted entities:\n{}",
                    entity_lines(&state.extracted_entities)
                ),
            )
            .await;
            state.matched_cis.clear();
            state.set_meta(meta::EXTERNAL_DEPENDENCY, true);
            state.set_meta(meta::CI_LINKED, false);
            state.transition(EnrichmentStage::Enriched, self.clock.now());
            self.store.upsert(&state).await?;
            info!(ticket_id = %ticket_id, "External dependency, CI matching skipped");
            return Ok(EnrichmentOutcome::from_state(
                &state,
                true,
                "External dependency; no CI matching performed",
            ));
        }

        let result = self.matcher.match_entities(&extraction.entities).await;
        state.matched_cis = result.matches.clone();
        state.confidence_scores =
            ConfidenceScores::new(result.overall_confidence, extraction.entity_confidence());

        if let Some(top) = result.recommended_ci().cloned() {
            if let Err(e) = self
                .tickets
                .link_configuration_item(&ticket_id, &top.id)
                .await
            {
                return self.defer_retry(state, e.into()).await;
            }
            metrics::counter!("ie_ci_links_total", "mode" => "auto").increment(1);
            self.annotate(&ticket_id, &link_annotation(&top, &state.extracted_entities))
                .await;

            state.set_meta(meta::CI_LINKED, true);
            state.set_meta(meta::LINKED_CI_ID, top.id.as_str());
            state.transition(EnrichmentStage::Enriched, self.clock.now());
            self.store.upsert(&state).await?;
            info!(
                ticket_id = %ticket_id,
                ci_id = %top.id,
                confidence = top.confidence,
                "Configuration item linked"
            );
            return Ok(EnrichmentOutcome::from_state(
                &state,
                true,
                format!("Linked configuration item {} ({})", top.name, top.id),
            ));
        }

        if !result.low_confidence_matches.is_empty() {
            let channel = state.meta_str(meta::CHANNEL).map(str::to_string);
            let candidates: Vec<CiMatchCandidate> = result
                .low_confidence_matches
                .iter()
                .take(self.config.max_clarification_candidates)
                .cloned()
                .collect();

            let message = match self
                .clarifications
                .request_clarification(
                    &mut state,
                    &ticket.short_description,
                    &candidates,
                    channel.as_deref(),
                )
                .await
            {
                Ok(_) => format!("Clarification requested for {} candidates", candidates.len()),
                Err(EnrichmentError::DuplicateRequest(msg)) => {
                    debug!(ticket_id = %ticket_id, reason = %msg, "Clarification already pending");
                    "Clarification already pending".to_string()
                }
                Err(e) => return self.defer_retry(state, e).await,
            };

            state.transition(EnrichmentStage::ClarificationPending, self.clock.now());
            self.store.upsert(&state).await?;
            info!(
                ticket_id = %ticket_id,
                candidates = candidates.len(),
                "Awaiting clarification"
            );
            return Ok(EnrichmentOutcome::from_state(&state, true, message));
        }

        self.annotate(
            &ticket_id,
            &format!(
                "Incident enrichment: no CI match found.\nExtracted entities:\n{}",
                entity_lines(&state.extracted_entities)
            ),
        )
        .await;
        state.set_meta(meta::CI_LINKED, false);
        state.transition(EnrichmentStage::Enriched, self.clock.now());
        self.store.upsert(&state).await?;
        info!(ticket_id = %ticket_id, "No CI match found");
        Ok(EnrichmentOutcome::from_state(&state, true, "No CI match found"))
    }

    async fn force_enriched(
        &self,
        mut state: EnrichmentState,
        flag: &'static str,
        message: String,
    ) -> EnrichmentResult<EnrichmentOutcome> {
        state.set_meta(flag, true);
        state.transition(EnrichmentStage::Enriched, self.clock.now());
        self.store.upsert(&state).await?;
        metrics::counter!("ie_stop_conditions_total", "reason" => flag).increment(1);
        info!(ticket_id = %state.ticket_id, reason = flag, "Stop condition reached");
        Ok(EnrichmentOutcome::from_state(&state, true, message))
    }

    async fn mark_error(
        &self,
        mut state: EnrichmentState,
        message: &str,
    ) -> EnrichmentResult<EnrichmentOutcome> {
        state.set_meta(meta::ERROR, message);
        state.transition(EnrichmentStage::Error, self.clock.now());
        self.store.upsert(&state).await?;
        warn!(ticket_id = %state.ticket_id, "{}", message);
        Ok(EnrichmentOutcome::from_state(&state, false, message))
    }

    /// Leaves the ticket in `NOTES_ANALYZED` and flags it so the next trigger
    /// re-runs extraction even without new notes.
    async fn defer_retry(
        &self,
        mut state: EnrichmentState,
        err: EnrichmentError,
    ) -> EnrichmentResult<EnrichmentOutcome> {
        warn!(ticket_id = %state.ticket_id, error = %err, "Decision failed, will retry");
        state.set_meta(meta::RETRY_PENDING, true);
        state.set_meta(meta::ERROR, err.to_string());
        state.updated_at = self.clock.now();
        self.store.upsert(&state).await?;
        Ok(EnrichmentOutcome::from_state(&state, false, err.to_string()))
    }

    async fn annotate(&self, ticket_id: &str, text: &str) {
        if let Err(e) = self.tickets.annotate(ticket_id, text).await {
            warn!(ticket_id = %ticket_id, error = %e, "Failed to annotate ticket");
        }
    }
}

#[async_trait]
impl ManualResolution for EnrichmentOrchestrator {
    #[instrument(skip(self))]
    async fn link_selected(
        &self,
        ticket_id: &str,
        ci_id: &str,
        responded_by: &str,
    ) -> EnrichmentOutcome {
        let mut state = match self.store.get(ticket_id).await {
            Ok(Some(state)) => state,
            Ok(None) => return EnrichmentOutcome::not_tracked(ticket_id),
            Err(e) => return EnrichmentOutcome::failure(ticket_id, &e.into()),
        };

        if state.stage == EnrichmentStage::Enriched && state.linked_ci_id() == Some(ci_id) {
            return EnrichmentOutcome::from_state(&state, true, "Configuration item already linked")
                .skipped();
        }
        if state.stage != EnrichmentStage::ClarificationPending {
            return no_clarification_pending(&state, "selection");
        }

        if let Err(e) = self.tickets.link_configuration_item(ticket_id, ci_id).await {
            warn!(ticket_id = %ticket_id, ci_id = %ci_id, error = %e, "Manual link failed");
            let err: EnrichmentError = e.into();
            return EnrichmentOutcome::from_state(&state, false, err.to_string());
        }
        metrics::counter!("ie_ci_links_total", "mode" => "manual").increment(1);

        let chosen = state
            .matched_cis
            .iter()
            .find(|c| c.id == ci_id)
            .cloned()
            .unwrap_or_else(|| {
                let manual = CiMatchCandidate::manual(ci_id, ci_id, "unknown", self.clock.now());
                state.matched_cis.push(manual.clone());
                manual
            });
        self.annotate(
            ticket_id,
            &format!(
                "Incident enrichment: configuration item {} ({}) linked by manual selection ({}).",
                chosen.name, chosen.id, responded_by
            ),
        )
        .await;

        state.set_meta(meta::MANUAL_SELECTION, true);
        state.set_meta(meta::CI_LINKED, true);
        state.set_meta(meta::LINKED_CI_ID, ci_id);
        state.set_meta(meta::RESPONDED_BY, responded_by);
        state.clear_meta(meta::CLARIFICATION);
        state.transition(EnrichmentStage::Enriched, self.clock.now());
        if let Err(e) = self.store.upsert(&state).await {
            return EnrichmentOutcome::failure(ticket_id, &e.into());
        }

        info!(ticket_id = %ticket_id, ci_id = %ci_id, responded_by = %responded_by, "Manual selection applied");
        EnrichmentOutcome::from_state(
            &state,
            true,
            format!("Linked configuration item {} ({})", chosen.name, chosen.id),
        )
    }

    #[instrument(skip(self))]
    async fn record_skip(&self, ticket_id: &str, responded_by: &str) -> EnrichmentOutcome {
        let mut state = match self.store.get(ticket_id).await {
            Ok(Some(state)) => state,
            Ok(None) => return EnrichmentOutcome::not_tracked(ticket_id),
            Err(e) => return EnrichmentOutcome::failure(ticket_id, &e.into()),
        };

        if state.stage == EnrichmentStage::Enriched && state.flag(meta::MANUAL_SKIP) {
            return EnrichmentOutcome::from_state(&state, true, "Already skipped").skipped();
        }
        if state.stage != EnrichmentStage::ClarificationPending {
            return no_clarification_pending(&state, "skip");
        }

        state.set_meta(meta::MANUAL_SKIP, true);
        state.set_meta(meta::CI_LINKED, false);
        state.set_meta(meta::RESPONDED_BY, responded_by);
        state.clear_meta(meta::CLARIFICATION);
        state.transition(EnrichmentStage::Enriched, self.clock.now());
        if let Err(e) = self.store.upsert(&state).await {
            return EnrichmentOutcome::failure(ticket_id, &e.into());
        }

        info!(ticket_id = %ticket_id, responded_by = %responded_by, "Clarification skipped");
        EnrichmentOutcome::from_state(&state, true, "Clarification skipped; no CI linked")
    }
}

/// Rejects a human answer that arrives when no prompt is open, e.g. a replayed
/// button click after the ticket was auto-linked.
fn no_clarification_pending(state: &EnrichmentState, action: &str) -> EnrichmentOutcome {
    warn!(
        ticket_id = %state.ticket_id,
        stage = %state.stage,
        action,
        "Ignoring clarification answer, none pending"
    );
    EnrichmentOutcome::from_state(
        state,
        false,
        format!("No clarification pending (ticket is {})", state.stage),
    )
    .skipped()
}

/// Copies the latest extraction into the state.
fn record_extraction(state: &mut EnrichmentState, extraction: &ExtractionOutcome) {
    state.extracted_entities = group_by_type(&extraction.entities);
    state.confidence_scores = ConfidenceScores::new(0.0, extraction.entity_confidence());
    state.set_meta(meta::INTENT, extraction.intent.as_str());
    state.set_meta(meta::MODEL_DEGRADED, extraction.model_degraded());
    state.clear_meta(meta::RETRY_PENDING);
    state.clear_meta(meta::ERROR);
    for key in meta::DECISION_KEYS {
        state.clear_meta(key);
    }

    let invalid: Vec<serde_json::Value> = extraction
        .entities
        .iter()
        .filter(|e| !e.is_valid())
        .map(|e| {
            json!({
                "type": e.entity_type,
                "value": e.value,
                "reason": e.invalid_reason,
            })
        })
        .collect();
    if invalid.is_empty() {
        state.clear_meta(meta::INVALID_ENTITIES);
    } else {
        state.set_meta(meta::INVALID_ENTITIES, invalid);
    }
}

fn entity_lines(entities: &BTreeMap<EntityType, Vec<String>>) -> String {
    if entities.is_empty() {
        return "- none".to_string();
    }
    entities
        .iter()
        .map(|(ty, values)| format!("- {}: {}", ty, values.join(", ")))
        .collect::<Vec<_>>()
        .join("\n")
}

fn link_annotation(ci: &CiMatchCandidate, entities: &BTreeMap<EntityType, Vec<String>>) -> String {
    format!(
        "Incident enrichment: linked configuration item {} ({}) with {}% confidence.\n\
         Reason: {}\nExtracted entities:\n{}",
        ci.name,
        ci.class,
        ci.confidence,
        ci.reason,
        entity_lines(entities)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::matcher::MatchSource;
    use crate::store::InMemoryStateStore;
    use chrono::{Duration, Utc};
    use ie_connectors::testing::{sample_ci, sample_note, sample_ticket_at};
    use ie_connectors::{
        MockCiRepository, MockLanguageModel, MockMessagingConnector, MockTicketSystem,
    };

    struct Harness {
        clock: ManualClock,
        tickets: Arc<MockTicketSystem>,
        cmdb: Arc<MockCiRepository>,
        messaging: Arc<MockMessagingConnector>,
        model: Arc<MockLanguageModel>,
        store: Arc<InMemoryStateStore>,
        orchestrator: EnrichmentOrchestrator,
    }

    fn harness_with(config: EnrichmentConfig) -> Harness {
        let clock = ManualClock::default();
        let tickets = Arc::new(MockTicketSystem::new("tickets"));
        let cmdb = Arc::new(MockCiRepository::with_items(
            "cmdb",
            vec![
                sample_ci("ci-web", "web01", Some("192.168.1.5"), None),
                sample_ci("ci-pay1", "payroll-db01", None, None),
                sample_ci("ci-pay2", "payroll-db02", None, None),
            ],
        ));
        let messaging = Arc::new(MockMessagingConnector::new("slack"));
        let model = Arc::new(MockLanguageModel::new("llm"));
        let store = Arc::new(InMemoryStateStore::new());
        let orchestrator = EnrichmentOrchestrator::new(
            config,
            EnrichmentServices {
                tickets: tickets.clone(),
                ci_repository: cmdb.clone(),
                messaging: messaging.clone(),
                model: Some(model.clone()),
                store: store.clone(),
                clock: Arc::new(clock.clone()),
            },
        )
        .unwrap();
        Harness {
            clock,
            tickets,
            cmdb,
            messaging,
            model,
            store,
            orchestrator,
        }
    }

    fn harness() -> Harness {
        harness_with(EnrichmentConfig {
            clarification_channel: Some("#ci-triage".into()),
            ..Default::default()
        })
    }

    impl Harness {
        async fn tracked_ticket(&self, id: &str, summary: &str, note: Option<&str>) {
            let now = self.clock.now();
            self.tickets
                .add_ticket(sample_ticket_at(id, summary, now - Duration::hours(1)))
                .await;
            if let Some(text) = note {
                self.tickets
                    .add_note(id, sample_note(text, now - Duration::minutes(30)))
                    .await;
            }
            self.orchestrator
                .start_tracking(id, &format!("INC{}", id), None)
                .await;
        }

        async fn state(&self, id: &str) -> EnrichmentState {
            self.store.get(id).await.unwrap().unwrap()
        }
    }

    #[tokio::test]
    async fn test_untracked_ticket_is_reported() {
        let h = harness();
        let outcome = h.orchestrator.process_ticket("nope", false).await;
        assert!(!outcome.success);
        assert_eq!(outcome.stage, None);
        assert_eq!(h.tickets.fetch_count(), 0);
    }

    #[tokio::test]
    async fn test_start_tracking_is_idempotent() {
        let h = harness();
        let first = h.orchestrator.start_tracking("T1", "INC0001", Some("CS1".into())).await;
        let second = h.orchestrator.start_tracking("T1", "INC0001", None).await;
        assert!(first.success && !first.skipped);
        assert!(second.skipped);
        assert_eq!(h.state("T1").await.parent_id.as_deref(), Some("CS1"));
    }

    #[tokio::test]
    async fn test_disabled_pipeline_is_a_no_op() {
        let h = harness_with(EnrichmentConfig {
            enabled: false,
            ..Default::default()
        });
        h.tracked_ticket("T1", "down", Some("ping 192.168.1.5 fails")).await;
        let outcome = h.orchestrator.process_ticket("T1", false).await;
        assert!(outcome.success);
        assert_eq!(h.tickets.fetch_count(), 0);
        assert_eq!(h.state("T1").await.stage, EnrichmentStage::Created);
    }

    #[tokio::test]
    async fn test_missing_ticket_moves_to_error() {
        let h = harness();
        h.orchestrator.start_tracking("T1", "INC0001", None).await;

        let outcome = h.orchestrator.process_ticket("T1", false).await;
        assert!(!outcome.success);
        assert_eq!(outcome.stage, Some(EnrichmentStage::Error));

        // Terminal: the next trigger does not fetch again.
        let again = h.orchestrator.process_ticket("T1", false).await;
        assert!(again.skipped);
        assert_eq!(h.tickets.fetch_count(), 1);
        assert_eq!(h.state("T1").await.attempts, 0);
    }

    #[tokio::test]
    async fn test_transient_fetch_failure_leaves_state_untouched() {
        let h = harness();
        h.tracked_ticket("T1", "down", Some("192.168.1.5")).await;
        h.tickets
            .set_fetch_failure(Some(ConnectorError::ConnectionFailed("reset".into())))
            .await;

        let outcome = h.orchestrator.process_ticket("T1", false).await;
        assert!(!outcome.success);
        let state = h.state("T1").await;
        assert_eq!(state.stage, EnrichmentStage::Created);
        assert_eq!(state.attempts, 0);

        h.tickets.set_fetch_failure(None).await;
        let retried = h.orchestrator.process_ticket("T1", false).await;
        assert!(retried.success);
        assert!(retried.ci_linked);
    }

    #[tokio::test]
    async fn test_zero_note_ticket_gets_one_extraction() {
        let h = harness();
        h.tracked_ticket("T1", "Printer on floor 3 jammed", None).await;

        let first = h.orchestrator.process_ticket("T1", true).await;
        assert_eq!(first.attempts, 1);
        assert_eq!(first.stage, Some(EnrichmentStage::Enriched));
        assert!(!first.ci_linked);
        assert_eq!(h.model.call_count(), 1);

        let annotations = h.tickets.annotations_for("T1").await;
        assert_eq!(annotations.len(), 1);
        assert!(annotations[0].contains("no CI match found"));

        let second = h.orchestrator.process_ticket("T1", true).await;
        assert!(second.skipped);
        assert_eq!(h.model.call_count(), 1);
    }

    #[tokio::test]
    async fn test_external_dependency_skips_matching() {
        let h = harness();
        h.model
            .set_response(MockLanguageModel::extraction(
                "external_dependency",
                0.9,
                &[("software", "Salesforce")],
            ))
            .await;
        h.tracked_ticket("T1", "Salesforce outage", Some("vendor status page red, 192.168.1.5 fine"))
            .await;

        let outcome = h.orchestrator.process_ticket("T1", false).await;

        assert_eq!(outcome.stage, Some(EnrichmentStage::Enriched));
        assert!(!outcome.ci_linked);
        assert_eq!(h.cmdb.call_count(), 0);
        let state = h.state("T1").await;
        assert!(state.flag(meta::EXTERNAL_DEPENDENCY));
        assert_eq!(state.meta_str(meta::INTENT), Some("external_dependency"));
        assert!(h.tickets.annotations_for("T1").await[0].contains("external dependency"));
    }

    #[tokio::test]
    async fn test_max_attempts_forces_enriched() {
        let h = harness();
        h.tracked_ticket("T1", "down", None).await;
        let mut state = h.state("T1").await;
        state.attempts = 3;
        state.transition(EnrichmentStage::NotesAnalyzed, h.clock.now());
        h.store.upsert(&state).await.unwrap();
        h.tickets
            .add_note("T1", sample_note("new info: srv-app02", h.clock.now()))
            .await;

        let outcome = h.orchestrator.process_ticket("T1", false).await;

        assert_eq!(outcome.stage, Some(EnrichmentStage::Enriched));
        assert_eq!(outcome.attempts, 3);
        assert!(h.state("T1").await.flag(meta::MAX_ATTEMPTS_REACHED));
        assert_eq!(h.model.call_count(), 0);
    }

    #[tokio::test]
    async fn test_link_failure_is_retried_on_next_trigger() {
        let h = harness();
        h.tracked_ticket("T1", "down", Some("cannot ping 192.168.1.5")).await;
        h.tickets.set_link_failure(true).await;

        let failed = h.orchestrator.process_ticket("T1", false).await;
        assert!(!failed.success);
        assert_eq!(failed.stage, Some(EnrichmentStage::NotesAnalyzed));
        let state = h.state("T1").await;
        assert!(state.flag(meta::RETRY_PENDING));
        assert!(state.last_note_at.is_some());

        h.tickets.set_link_failure(false).await;
        let retried = h.orchestrator.process_ticket("T1", false).await;
        assert!(retried.success);
        assert!(retried.ci_linked);
        assert_eq!(retried.attempts, 2);
        assert!(!h.state("T1").await.flag(meta::RETRY_PENDING));
    }

    #[tokio::test]
    async fn test_clarification_send_failure_keeps_notes_analyzed() {
        let h = harness_with(EnrichmentConfig {
            confidence_threshold: 90,
            clarification_channel: Some("#ci-triage".into()),
            ..Default::default()
        });
        h.messaging.set_should_fail(true).await;
        h.tracked_ticket("T1", "slow", Some("payroll-db is slow")).await;

        let outcome = h.orchestrator.process_ticket("T1", false).await;

        assert!(!outcome.success);
        assert_eq!(outcome.stage, Some(EnrichmentStage::NotesAnalyzed));
        assert!(!h.orchestrator.clarifications().is_pending("T1").await);
    }

    #[tokio::test]
    async fn test_manual_selection_links_and_enriches() {
        let h = harness_with(EnrichmentConfig {
            confidence_threshold: 90,
            clarification_channel: Some("#ci-triage".into()),
            ..Default::default()
        });
        h.tracked_ticket("T1", "slow", Some("payroll-db is slow")).await;
        let pending = h.orchestrator.process_ticket("T1", false).await;
        assert_eq!(pending.stage, Some(EnrichmentStage::ClarificationPending));

        let outcome = h
            .orchestrator
            .handle_clarification_response("T1", "ci-pay2", "jdoe")
            .await;

        assert!(outcome.success);
        assert_eq!(outcome.linked_ci.as_deref(), Some("ci-pay2"));
        let state = h.state("T1").await;
        assert_eq!(state.stage, EnrichmentStage::Enriched);
        assert!(state.flag(meta::MANUAL_SELECTION));
        assert!(!state.metadata.contains_key(meta::CLARIFICATION));
        assert_eq!(
            h.tickets.links().await,
            vec![("T1".to_string(), "ci-pay2".to_string())]
        );
        assert!(h.messaging.updates().await[0].1.contains("payroll-db02"));
    }

    #[tokio::test]
    async fn test_manual_skip_enriches_without_link() {
        let h = harness_with(EnrichmentConfig {
            confidence_threshold: 90,
            clarification_channel: Some("#ci-triage".into()),
            ..Default::default()
        });
        h.tracked_ticket("T1", "slow", Some("payroll-db is slow")).await;
        h.orchestrator.process_ticket("T1", false).await;

        let outcome = h.orchestrator.handle_clarification_skip("T1", "jdoe").await;

        assert!(outcome.success);
        assert!(!outcome.ci_linked);
        let state = h.state("T1").await;
        assert_eq!(state.stage, EnrichmentStage::Enriched);
        assert!(state.flag(meta::MANUAL_SKIP));
        assert!(h.tickets.links().await.is_empty());
        assert!(!h.orchestrator.clarifications().is_pending("T1").await);
    }

    #[tokio::test]
    async fn test_pending_clarification_is_not_reprocessed_without_force() {
        let h = harness_with(EnrichmentConfig {
            confidence_threshold: 90,
            clarification_channel: Some("#ci-triage".into()),
            ..Default::default()
        });
        h.tracked_ticket("T1", "slow", Some("payroll-db is slow")).await;
        h.orchestrator.process_ticket("T1", false).await;

        let outcome = h.orchestrator.process_ticket("T1", false).await;
        assert!(outcome.skipped);
        assert_eq!(h.messaging.prompt_count().await, 1);
        assert_eq!(h.model.call_count(), 1);
    }

    #[tokio::test]
    async fn test_stale_answers_on_auto_linked_ticket_are_rejected() {
        let h = harness();
        h.tracked_ticket("T1", "down", Some("cannot ping 192.168.1.5")).await;
        let linked = h.orchestrator.process_ticket("T1", false).await;
        assert_eq!(linked.linked_ci.as_deref(), Some("ci-web"));

        let selected = h
            .orchestrator
            .handle_clarification_response("T1", "ci-pay2", "jdoe")
            .await;
        assert!(!selected.success);
        assert!(selected.message.contains("No clarification pending"));

        let skipped = h.orchestrator.handle_clarification_skip("T1", "jdoe").await;
        assert!(!skipped.success);

        let state = h.state("T1").await;
        assert_eq!(state.stage, EnrichmentStage::Enriched);
        assert!(state.flag(meta::CI_LINKED));
        assert_eq!(state.linked_ci_id(), Some("ci-web"));
        assert!(!state.flag(meta::MANUAL_SELECTION));
        assert!(!state.flag(meta::MANUAL_SKIP));
        assert_eq!(
            h.tickets.links().await,
            vec![("T1".to_string(), "ci-web".to_string())]
        );
    }

    #[tokio::test]
    async fn test_answer_for_never_prompted_ticket_is_rejected() {
        let h = harness();
        h.tracked_ticket("T1", "down", Some("cannot ping 192.168.1.5")).await;

        let outcome = h
            .orchestrator
            .handle_clarification_response("T1", "ci-web", "jdoe")
            .await;

        assert!(!outcome.success);
        assert_eq!(outcome.stage, Some(EnrichmentStage::Created));
        assert!(h.tickets.links().await.is_empty());
    }

    #[tokio::test]
    async fn test_final_pass_replaces_previous_decision_flags() {
        let h = harness();
        h.model
            .set_response(MockLanguageModel::extraction(
                "external_dependency",
                0.9,
                &[("software", "Salesforce")],
            ))
            .await;
        h.tracked_ticket("T1", "Salesforce outage", Some("vendor status page is red"))
            .await;
        h.orchestrator.process_ticket("T1", false).await;
        assert!(h.state("T1").await.flag(meta::EXTERNAL_DEPENDENCY));

        h.clock.advance(Duration::minutes(10));
        h.tickets
            .add_note("T1", sample_note("actually 192.168.1.5 is down", h.clock.now()))
            .await;
        h.model
            .set_response(MockLanguageModel::extraction(
                "internal_ci",
                0.9,
                &[("ip_address", "192.168.1.5")],
            ))
            .await;

        let outcome = h.orchestrator.run_final_enrichment("T1").await;

        assert!(outcome.success);
        assert!(outcome.ci_linked);
        let state = h.state("T1").await;
        assert!(!state.metadata.contains_key(meta::EXTERNAL_DEPENDENCY));
        assert_eq!(state.meta_str(meta::INTENT), Some("internal_ci"));
        assert_eq!(state.linked_ci_id(), Some("ci-web"));
    }

    #[tokio::test]
    async fn test_manual_candidate_uses_injected_clock() {
        let h = harness_with(EnrichmentConfig {
            confidence_threshold: 90,
            clarification_channel: Some("#ci-triage".into()),
            ..Default::default()
        });
        h.tracked_ticket("T1", "slow", Some("payroll-db is slow")).await;
        h.orchestrator.process_ticket("T1", false).await;

        h.orchestrator
            .handle_clarification_response("T1", "ci-other", "jdoe")
            .await;

        let state = h.state("T1").await;
        let manual = state
            .matched_cis
            .iter()
            .find(|c| c.id == "ci-other")
            .unwrap();
        assert_eq!(manual.source, MatchSource::Manual);
        assert!(state
            .matched_cis
            .iter()
            .all(|c| c.matched_at == h.clock.now()));
    }

    #[test]
    fn test_oversized_max_age_is_rejected_at_construction() {
        let result = EnrichmentOrchestrator::new(
            EnrichmentConfig {
                max_age_hours: i64::MAX,
                ..Default::default()
            },
            EnrichmentServices {
                tickets: Arc::new(MockTicketSystem::new("tickets")),
                ci_repository: Arc::new(MockCiRepository::with_items("cmdb", vec![])),
                messaging: Arc::new(MockMessagingConnector::new("slack")),
                model: None,
                store: Arc::new(InMemoryStateStore::new()),
                clock: Arc::new(ManualClock::default()),
            },
        );
        assert!(matches!(result, Err(EnrichmentError::Config(_))));
    }

    #[test]
    fn test_entity_lines() {
        let mut entities = BTreeMap::new();
        assert_eq!(entity_lines(&entities), "- none");
        entities.insert(EntityType::IpAddress, vec!["10.0.0.1".into(), "10.0.0.2".into()]);
        entities.insert(EntityType::Software, vec!["Outlook".into()]);
        assert_eq!(
            entity_lines(&entities),
            "- IP_ADDRESS: 10.0.0.1, 10.0.0.2\n- SOFTWARE: Outlook"
        );
    }

    #[test]
    fn test_outcome_metric_labels() {
        let now = Utc::now();
        let mut state = EnrichmentState::new("T1", "INC1", None, now);
        assert_eq!(EnrichmentOutcome::not_tracked("T1").metric_label(), "failure");
        state.transition(EnrichmentStage::Enriched, now);
        state.set_meta(meta::CI_LINKED, true);
        assert_eq!(EnrichmentOutcome::from_state(&state, true, "").metric_label(), "linked");
        state.transition(EnrichmentStage::ClarificationPending, now);
        assert_eq!(
            EnrichmentOutcome::from_state(&state, true, "").metric_label(),
            "clarification"
        );
        assert_eq!(
            EnrichmentOutcome::from_state(&state, true, "").skipped().metric_label(),
            "skipped"
        );
    }
}
