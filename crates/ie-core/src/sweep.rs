//! Periodic sweep over active tickets.

use crate::error::EnrichmentResult;
use crate::orchestrator::{EnrichmentOrchestrator, EnrichmentOutcome};
use crate::state::EnrichmentStage;
use crate::store::EnrichmentStateStore;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

/// Summary of one sweep.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub outcomes: Vec<EnrichmentOutcome>,
}

impl SweepReport {
    fn record(&mut self, outcome: EnrichmentOutcome) {
        self.processed += 1;
        if !outcome.success {
            self.failed += 1;
        } else if outcome.skipped {
            self.skipped += 1;
        } else {
            self.succeeded += 1;
        }
        self.outcomes.push(outcome);
    }
}

/// Re-processes every ticket in `CREATED` or `NOTES_ANALYZED`.
pub struct SweepRunner {
    orchestrator: Arc<EnrichmentOrchestrator>,
    store: Arc<dyn EnrichmentStateStore>,
    concurrency: usize,
}

impl SweepRunner {
    pub fn new(
        orchestrator: Arc<EnrichmentOrchestrator>,
        store: Arc<dyn EnrichmentStateStore>,
    ) -> Self {
        let concurrency = orchestrator.config().sweep_concurrency.max(1);
        Self {
            orchestrator,
            store,
            concurrency,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Processes active tickets with at most `concurrency` in flight.
    pub async fn run_once(&self) -> EnrichmentResult<SweepReport> {
        let mut report = SweepReport::default();

        let active = self
            .store
            .list_by_stages(&[EnrichmentStage::Created, EnrichmentStage::NotesAnalyzed])
            .await?;
        debug!(count = active.len(), "Sweeping active tickets");

        let orchestrator = &self.orchestrator;
        let mut outcomes = stream::iter(active)
            .map(|state| async move { orchestrator.process_ticket(&state.ticket_id, false).await })
            .buffer_unordered(self.concurrency);

        while let Some(outcome) = outcomes.next().await {
            report.record(outcome);
        }

        metrics::counter!("ie_sweeps_total").increment(1);
        info!(
            processed = report.processed,
            succeeded = report.succeeded,
            failed = report.failed,
            skipped = report.skipped,
            "Sweep finished"
        );
        Ok(report)
    }

    /// Evicts expired clarification requests. Scheduled on its own interval.
    pub async fn cleanup_clarifications(&self) -> usize {
        let evicted = self.orchestrator.clarifications().cleanup_expired().await;
        if evicted > 0 {
            info!(evicted, "Expired clarification requests evicted");
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::config::EnrichmentConfig;
    use crate::orchestrator::EnrichmentServices;
    use crate::store::InMemoryStateStore;
    use chrono::Duration;
    use ie_connectors::testing::{sample_ci, sample_note, sample_ticket_at};
    use ie_connectors::{
        MockCiRepository, MockLanguageModel, MockMessagingConnector, MockTicketSystem,
    };

    #[tokio::test]
    async fn test_sweep_processes_only_active_tickets() {
        let clock = ManualClock::default();
        let now = clock.now();
        let tickets = Arc::new(MockTicketSystem::new("tickets"));
        let store = Arc::new(InMemoryStateStore::new());
        let orchestrator = Arc::new(
            EnrichmentOrchestrator::new(
                EnrichmentConfig::default(),
                EnrichmentServices {
                    tickets: tickets.clone(),
                    ci_repository: Arc::new(MockCiRepository::with_items(
                        "cmdb",
                        vec![sample_ci("ci-1", "web01", Some("10.0.0.7"), None)],
                    )),
                    messaging: Arc::new(MockMessagingConnector::new("slack")),
                    model: Some(Arc::new(MockLanguageModel::new("llm"))),
                    store: store.clone(),
                    clock: Arc::new(clock.clone()),
                },
            )
            .unwrap(),
        );

        for id in ["T1", "T2", "T3"] {
            tickets
                .add_ticket(sample_ticket_at(id, "outage", now - Duration::hours(1)))
                .await;
            tickets
                .add_note(id, sample_note("10.0.0.7 unreachable", now - Duration::minutes(5)))
                .await;
            orchestrator.start_tracking(id, id, None).await;
        }
        let mut done = store.get("T3").await.unwrap().unwrap();
        done.transition(EnrichmentStage::Enriched, now);
        store.upsert(&done).await.unwrap();

        let report = SweepRunner::new(orchestrator, store.clone())
            .with_concurrency(2)
            .run_once()
            .await
            .unwrap();

        assert_eq!(report.processed, 2);
        assert_eq!(report.succeeded, 2);
        assert_eq!(tickets.links().await.len(), 2);
        assert_eq!(tickets.fetch_count(), 2);
    }

    #[test]
    fn test_report_buckets() {
        let mut report = SweepReport::default();
        let mut outcome = EnrichmentOutcome::not_tracked("T1");
        report.record(outcome.clone());
        outcome.success = true;
        report.record(outcome.clone());
        outcome.skipped = false;
        report.record(outcome);
        assert_eq!((report.failed, report.skipped, report.succeeded), (1, 1, 1));
    }
}
