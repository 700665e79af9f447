//! Human-in-the-loop CI disambiguation.
//!
//! Pending requests live in a process-local [`TtlCache`] keyed by ticket id.
//! The cache only suppresses duplicate prompts; the persisted
//! [`EnrichmentState`] remains authoritative, and each request is mirrored
//! into its metadata so a restart loses nothing but duplicate protection.

use crate::cache::TtlCache;
use crate::clock::Clock;
use crate::config::{EnrichmentConfig, DEFAULT_CLARIFICATION_TTL_SECS};
use crate::error::{EnrichmentError, EnrichmentResult};
use crate::matcher::CiMatchCandidate;
use crate::orchestrator::EnrichmentOutcome;
use crate::state::{meta, EnrichmentState};
use crate::store::EnrichmentStateStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ie_connectors::{
    ClarificationCallback, ClarificationChoice, ClarificationOption, ClarificationPrompt,
    MessageRef, MessagingConnector,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// A clarification request awaiting a human answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingClarification {
    /// Correlates the prompt, the callback and the log lines.
    pub request_id: Uuid,
    pub ticket_id: String,
    pub candidates: Vec<CiMatchCandidate>,
    pub requested_at: DateTime<Utc>,
    pub message_ref: Option<MessageRef>,
}

/// Applies a human decision to the ticket. Implemented by the orchestrator.
#[async_trait]
pub trait ManualResolution: Send + Sync {
    async fn link_selected(
        &self,
        ticket_id: &str,
        ci_id: &str,
        responded_by: &str,
    ) -> EnrichmentOutcome;

    async fn record_skip(&self, ticket_id: &str, responded_by: &str) -> EnrichmentOutcome;
}

/// Sends clarification prompts and routes the answers back.
pub struct ClarificationCoordinator {
    messaging: Arc<dyn MessagingConnector>,
    store: Arc<dyn EnrichmentStateStore>,
    pending: TtlCache<String, PendingClarification>,
    clock: Arc<dyn Clock>,
    default_channel: Option<String>,
    max_candidates: usize,
}

impl ClarificationCoordinator {
    pub fn new(
        messaging: Arc<dyn MessagingConnector>,
        store: Arc<dyn EnrichmentStateStore>,
        clock: Arc<dyn Clock>,
        config: &EnrichmentConfig,
    ) -> Self {
        let ttl = chrono::Duration::from_std(config.clarification_ttl())
            .unwrap_or_else(|_| chrono::Duration::seconds(DEFAULT_CLARIFICATION_TTL_SECS as i64));
        Self {
            messaging,
            store,
            pending: TtlCache::new(ttl, clock.clone()),
            clock,
            default_channel: config.clarification_channel.clone(),
            max_candidates: config.max_clarification_candidates,
        }
    }

    /// Sends an interactive prompt listing `candidates` plus a skip option.
    ///
    /// Rejected with [`EnrichmentError::DuplicateRequest`] while a request for
    /// the same ticket is younger than the TTL; in that case nothing is sent.
    /// On success the request is mirrored into `state.metadata` and persisted.
    #[instrument(skip(self, state, summary, candidates), fields(ticket_id = %state.ticket_id))]
    pub async fn request_clarification(
        &self,
        state: &mut EnrichmentState,
        summary: &str,
        candidates: &[CiMatchCandidate],
        channel: Option<&str>,
    ) -> EnrichmentResult<MessageRef> {
        if candidates.is_empty() {
            return Err(EnrichmentError::Validation(
                "clarification requires at least one candidate".to_string(),
            ));
        }
        let channel = channel
            .map(str::to_string)
            .or_else(|| self.default_channel.clone())
            .ok_or_else(|| {
                EnrichmentError::Config("no clarification channel configured".to_string())
            })?;
        let candidates: Vec<CiMatchCandidate> =
            candidates.iter().take(self.max_candidates).cloned().collect();

        let ticket_id = state.ticket_id.clone();
        let request_id = Uuid::new_v4();
        let entry = PendingClarification {
            request_id,
            ticket_id: ticket_id.clone(),
            candidates: candidates.clone(),
            requested_at: self.clock.now(),
            message_ref: None,
        };
        if let Err(existing) = self.pending.insert_if_vacant(ticket_id.clone(), entry).await {
            metrics::counter!("ie_clarifications_total", "result" => "duplicate").increment(1);
            return Err(EnrichmentError::DuplicateRequest(format!(
                "clarification for {} already pending since {}",
                ticket_id, existing.value.requested_at
            )));
        }

        let prompt = ClarificationPrompt {
            ticket_id: ticket_id.clone(),
            ticket_number: state.ticket_number.clone(),
            summary: summary.to_string(),
            options: candidates.iter().map(to_option).collect(),
        };

        let message_ref = match self.messaging.post_interactive(&prompt, &channel).await {
            Ok(posted) if posted.ok => match posted.message_ref {
                Some(message_ref) => message_ref,
                None => {
                    self.pending.remove(&ticket_id).await;
                    return Err(self.send_failed("messaging returned no message reference"));
                }
            },
            Ok(_) => {
                self.pending.remove(&ticket_id).await;
                return Err(self.send_failed("messaging rejected the prompt"));
            }
            Err(e) => {
                self.pending.remove(&ticket_id).await;
                return Err(self.send_failed(&e.to_string()));
            }
        };

        let stored_ref = message_ref.clone();
        self.pending
            .update(&ticket_id, move |entry| entry.message_ref = Some(stored_ref))
            .await;

        if let Some(entry) = self.pending.get(&ticket_id).await {
            state.set_meta(
                meta::CLARIFICATION,
                serde_json::to_value(&entry.value).unwrap_or_default(),
            );
        }
        state.set_meta(meta::CHANNEL, channel.as_str());
        state.updated_at = self.clock.now();
        if let Err(e) = self.store.upsert(state).await {
            warn!(ticket_id = %ticket_id, error = %e, "Failed to persist clarification mirror");
        }

        metrics::counter!("ie_clarifications_total", "result" => "requested").increment(1);
        info!(
            ticket_id = %ticket_id,
            request_id = %request_id,
            candidates = candidates.len(),
            channel = %channel,
            "Clarification requested"
        );
        Ok(message_ref)
    }

    /// Applies a human selection and updates the prompt message.
    #[instrument(skip(self, resolver))]
    pub async fn handle_response(
        &self,
        resolver: &dyn ManualResolution,
        ticket_id: &str,
        ci_id: &str,
        responded_by: &str,
    ) -> EnrichmentOutcome {
        let message_ref = self.take_pending(ticket_id).await;
        let outcome = resolver.link_selected(ticket_id, ci_id, responded_by).await;

        let text = if outcome.success {
            metrics::counter!("ie_clarifications_total", "result" => "selected").increment(1);
            format!("{} (selected by {})", outcome.message, responded_by)
        } else {
            metrics::counter!("ie_clarifications_total", "result" => "failed").increment(1);
            format!("Could not link configuration item {}: {}", ci_id, outcome.message)
        };
        self.update_prompt(message_ref, &text).await;
        outcome
    }

    /// Records that the human declined to pick a candidate.
    #[instrument(skip(self, resolver))]
    pub async fn handle_skip(
        &self,
        resolver: &dyn ManualResolution,
        ticket_id: &str,
        responded_by: &str,
    ) -> EnrichmentOutcome {
        let message_ref = self.take_pending(ticket_id).await;
        let outcome = resolver.record_skip(ticket_id, responded_by).await;

        if outcome.success {
            metrics::counter!("ie_clarifications_total", "result" => "skipped").increment(1);
            self.update_prompt(
                message_ref,
                &format!("Skipped by {}; no configuration item linked", responded_by),
            )
            .await;
        }
        outcome
    }

    /// Dispatches a messaging callback.
    pub async fn handle_event(
        &self,
        resolver: &dyn ManualResolution,
        callback: ClarificationCallback,
    ) -> EnrichmentOutcome {
        match callback.choice {
            ClarificationChoice::Select(ci_id) => {
                self.handle_response(resolver, &callback.ticket_id, &ci_id, &callback.responded_by)
                    .await
            }
            ClarificationChoice::Skip => {
                self.handle_skip(resolver, &callback.ticket_id, &callback.responded_by)
                    .await
            }
        }
    }

    /// Evicts expired requests. Scheduled externally.
    pub async fn cleanup_expired(&self) -> usize {
        let removed = self.pending.purge_expired().await;
        if removed > 0 {
            metrics::counter!("ie_clarification_cache_evictions_total").increment(removed as u64);
            info!(removed, "Evicted expired clarification requests");
        }
        removed
    }

    pub async fn pending(&self, ticket_id: &str) -> Option<PendingClarification> {
        self.pending
            .get(&ticket_id.to_string())
            .await
            .map(|entry| entry.value)
    }

    pub async fn is_pending(&self, ticket_id: &str) -> bool {
        self.pending.contains(&ticket_id.to_string()).await
    }

    /// Entries held, including expired ones not yet evicted.
    pub async fn pending_count(&self) -> usize {
        self.pending.len().await
    }

    /// Removes the cache entry and returns the prompt reference, falling back
    /// to the persisted mirror when the cache no longer holds it.
    async fn take_pending(&self, ticket_id: &str) -> Option<MessageRef> {
        if let Some(entry) = self.pending.remove(&ticket_id.to_string()).await {
            if entry.value.message_ref.is_some() {
                return entry.value.message_ref;
            }
        }

        match self.store.get(ticket_id).await {
            Ok(Some(state)) => state
                .metadata
                .get(meta::CLARIFICATION)
                .cloned()
                .and_then(|v| serde_json::from_value::<PendingClarification>(v).ok())
                .and_then(|p| p.message_ref),
            Ok(None) => None,
            Err(e) => {
                warn!(ticket_id = %ticket_id, error = %e, "Failed to load clarification mirror");
                None
            }
        }
    }

    async fn update_prompt(&self, message_ref: Option<MessageRef>, text: &str) {
        let Some(message_ref) = message_ref else {
            debug!("No prompt message to update");
            return;
        };
        if let Err(e) = self.messaging.update_message(&message_ref, text).await {
            warn!(
                channel = %message_ref.channel,
                message_id = %message_ref.message_id,
                error = %e,
                "Failed to update clarification message"
            );
        }
    }

    fn send_failed(&self, reason: &str) -> EnrichmentError {
        metrics::counter!("ie_clarifications_total", "result" => "send_failed").increment(1);
        EnrichmentError::ExternalService(format!("clarification not sent: {}", reason))
    }
}

fn to_option(candidate: &CiMatchCandidate) -> ClarificationOption {
    ClarificationOption {
        ci_id: candidate.id.clone(),
        name: candidate.name.clone(),
        class: candidate.class.clone(),
        confidence: candidate.confidence,
        reason: candidate.reason.clone(),
    }
}
