//! End-to-end pipeline tests.
//!
//! Each test wires the orchestrator against the in-memory connector mocks and
//! a manual clock, then drives a ticket through the state machine.
//!
//! ```bash
//! cargo test --package ie-core --test pipeline_tests
//! ```

use std::sync::Arc;

use chrono::Duration;

use ie_connectors::testing::{sample_ci, sample_note, sample_ticket_at};
use ie_connectors::{
    ClarificationCallback, ClarificationChoice, ConnectorError, MockCiRepository,
    MockLanguageModel, MockMessagingConnector, MockTicketSystem,
};
use ie_core::state::meta;
use ie_core::{
    Clock, EnrichmentConfig, EnrichmentOrchestrator, EnrichmentServices, EnrichmentStage,
    EnrichmentState, EnrichmentStateStore, InMemoryStateStore, ManualClock,
};

// ============================================================================
// Test Harness
// ============================================================================

struct Pipeline {
    clock: ManualClock,
    tickets: Arc<MockTicketSystem>,
    cmdb: Arc<MockCiRepository>,
    messaging: Arc<MockMessagingConnector>,
    model: Arc<MockLanguageModel>,
    store: Arc<InMemoryStateStore>,
    orchestrator: EnrichmentOrchestrator,
}

impl Pipeline {
    fn new(confidence_threshold: u8) -> Self {
        let clock = ManualClock::default();
        let tickets = Arc::new(MockTicketSystem::new("servicenow"));
        let cmdb = Arc::new(MockCiRepository::with_items(
            "cmdb",
            vec![
                sample_ci("ci-web01", "web01", Some("192.168.1.5"), Some("web01.corp.local")),
                sample_ci("ci-payroll-a", "payroll-db01", None, None),
                sample_ci("ci-payroll-b", "payroll-db02", None, None),
            ],
        ));
        let messaging = Arc::new(MockMessagingConnector::new("slack"));
        let model = Arc::new(MockLanguageModel::new("llm"));
        let store = Arc::new(InMemoryStateStore::new());

        let config = EnrichmentConfig {
            confidence_threshold,
            clarification_channel: Some("#service-desk".to_string()),
            ..Default::default()
        };
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
        .expect("valid config");

        Self {
            clock,
            tickets,
            cmdb,
            messaging,
            model,
            store,
            orchestrator,
        }
    }

    /// Adds a ticket created `age_hours` ago with one note and starts tracking it.
    async fn open_ticket(&self, id: &str, summary: &str, note: &str, age_hours: i64) {
        let now = self.clock.now();
        self.tickets
            .add_ticket(sample_ticket_at(id, summary, now - Duration::hours(age_hours)))
            .await;
        self.tickets
            .add_note(id, sample_note(note, now - Duration::minutes(10)))
            .await;
        let outcome = self
            .orchestrator
            .start_tracking(id, &format!("INC{}", id), None)
            .await;
        assert!(outcome.success);
    }

    async fn state(&self, id: &str) -> EnrichmentState {
        self.store.get(id).await.unwrap().expect("tracked")
    }
}

// ============================================================================
// Auto-linking
// ============================================================================

#[tokio::test]
async fn test_ip_in_note_is_auto_linked() {
    let p = Pipeline::new(70);
    p.open_ticket("1001", "Website down", "Cannot reach 192.168.1.5 from the office", 1)
        .await;

    let outcome = p.orchestrator.process_ticket("1001", false).await;

    assert!(outcome.success);
    assert_eq!(outcome.stage, Some(EnrichmentStage::Enriched));
    assert!(outcome.ci_linked);
    assert_eq!(outcome.linked_ci.as_deref(), Some("ci-web01"));
    assert_eq!(
        p.tickets.links().await,
        vec![("1001".to_string(), "ci-web01".to_string())]
    );

    let annotations = p.tickets.annotations_for("1001").await;
    assert_eq!(annotations.len(), 1);
    assert!(annotations[0].contains("web01"));
    assert!(annotations[0].contains("192.168.1.5"));

    let state = p.state("1001").await;
    assert_eq!(state.attempts, 1);
    assert_eq!(state.matched_cis[0].confidence, 95);
    assert!((state.confidence_scores.ci_match - 0.95).abs() < 1e-9);
    assert_eq!(p.messaging.prompt_count().await, 0);
}

#[tokio::test]
async fn test_model_failure_falls_back_to_patterns() {
    let p = Pipeline::new(70);
    p.model
        .set_failure(Some(ConnectorError::Timeout("upstream".into())))
        .await;
    p.open_ticket("1002", "Website down", "web01.corp.local returns 502", 1)
        .await;

    let outcome = p.orchestrator.process_ticket("1002", false).await;

    assert!(outcome.ci_linked);
    assert!(p.state("1002").await.flag(meta::MODEL_DEGRADED));
}

// ============================================================================
// Clarification
// ============================================================================

#[tokio::test]
async fn test_ambiguous_name_requests_clarification() {
    let p = Pipeline::new(90);
    p.open_ticket("2001", "Payroll slow", "users say payroll-db is slow today", 1)
        .await;

    let outcome = p.orchestrator.process_ticket("2001", false).await;

    assert!(outcome.success);
    assert_eq!(outcome.stage, Some(EnrichmentStage::ClarificationPending));
    assert!(!outcome.ci_linked);
    assert!(p.tickets.links().await.is_empty());

    let prompts = p.messaging.prompts().await;
    assert_eq!(prompts.len(), 1);
    assert_eq!(prompts[0].channel, "#service-desk");
    assert_eq!(prompts[0].prompt.ticket_number, "INC2001");
    assert_eq!(prompts[0].prompt.options.len(), 2);
    assert!(prompts[0].prompt.options.iter().all(|o| o.confidence == 85));
    assert!(p.orchestrator.clarifications().is_pending("2001").await);
}

#[tokio::test]
async fn test_repeat_request_while_pending_sends_one_prompt() {
    let p = Pipeline::new(90);
    p.open_ticket("2002", "Payroll slow", "payroll-db is slow", 1).await;
    p.orchestrator.process_ticket("2002", false).await;

    p.tickets
        .add_note("2002", sample_note("still slow on payroll-db", p.clock.now()))
        .await;
    let again = p.orchestrator.process_ticket("2002", true).await;

    assert!(again.success);
    assert_eq!(again.stage, Some(EnrichmentStage::ClarificationPending));
    assert_eq!(again.attempts, 2);
    assert_eq!(p.messaging.prompt_count().await, 1);
}

#[tokio::test]
async fn test_clarification_callback_links_selected_ci() {
    let p = Pipeline::new(90);
    p.open_ticket("2003", "Payroll slow", "payroll-db is slow", 1).await;
    p.orchestrator.process_ticket("2003", false).await;

    let outcome = p
        .orchestrator
        .handle_clarification_event(ClarificationCallback {
            ticket_id: "2003".to_string(),
            choice: ClarificationChoice::Select("ci-payroll-a".to_string()),
            responded_by: "U123".to_string(),
        })
        .await;

    assert!(outcome.success);
    assert_eq!(outcome.stage, Some(EnrichmentStage::Enriched));
    assert_eq!(outcome.linked_ci.as_deref(), Some("ci-payroll-a"));
    let state = p.state("2003").await;
    assert!(state.flag(meta::MANUAL_SELECTION));
    assert_eq!(state.meta_str(meta::RESPONDED_BY), Some("U123"));

    let updates = p.messaging.updates().await;
    assert_eq!(updates.len(), 1);
    assert!(updates[0].1.contains("U123"));
}

#[tokio::test]
async fn test_clarification_skip_callback() {
    let p = Pipeline::new(90);
    p.open_ticket("2004", "Payroll slow", "payroll-db is slow", 1).await;
    p.orchestrator.process_ticket("2004", false).await;

    let outcome = p
        .orchestrator
        .handle_clarification_event(ClarificationCallback {
            ticket_id: "2004".to_string(),
            choice: ClarificationChoice::Skip,
            responded_by: "U123".to_string(),
        })
        .await;

    assert!(outcome.success);
    assert!(!outcome.ci_linked);
    assert!(p.state("2004").await.flag(meta::MANUAL_SKIP));
    assert!(p.tickets.links().await.is_empty());
}

#[tokio::test]
async fn test_replayed_callbacks_do_not_touch_auto_linked_ticket() {
    let p = Pipeline::new(70);
    p.open_ticket("2006", "Website down", "Cannot reach 192.168.1.5", 1)
        .await;
    p.orchestrator.process_ticket("2006", false).await;

    for choice in [
        ClarificationChoice::Select("ci-payroll-b".to_string()),
        ClarificationChoice::Skip,
    ] {
        let outcome = p
            .orchestrator
            .handle_clarification_event(ClarificationCallback {
                ticket_id: "2006".to_string(),
                choice,
                responded_by: "U999".to_string(),
            })
            .await;
        assert!(!outcome.success);
        assert_eq!(outcome.linked_ci.as_deref(), Some("ci-web01"));
    }

    let state = p.state("2006").await;
    assert!(state.flag(meta::CI_LINKED));
    assert!(!state.flag(meta::MANUAL_SKIP));
    assert_eq!(state.meta_str(meta::RESPONDED_BY), None);
    assert_eq!(
        p.tickets.links().await,
        vec![("2006".to_string(), "ci-web01".to_string())]
    );
    assert!(p.messaging.updates().await.is_empty());
}

#[tokio::test]
async fn test_expired_clarification_is_evicted() {
    let p = Pipeline::new(90);
    p.open_ticket("2005", "Payroll slow", "payroll-db is slow", 1).await;
    p.orchestrator.process_ticket("2005", false).await;

    p.clock.advance(Duration::hours(5));

    assert_eq!(p.orchestrator.clarifications().cleanup_expired().await, 1);
    assert!(!p.orchestrator.clarifications().is_pending("2005").await);
}

// ============================================================================
// Stop conditions
// ============================================================================

#[tokio::test]
async fn test_unchanged_ticket_skips_extraction() {
    let p = Pipeline::new(70);
    p.open_ticket("3001", "Website down", "Cannot reach 192.168.1.5", 1)
        .await;
    let mut state = p.state("3001").await;
    state.attempts = 1;
    state.observe_note(p.clock.now());
    state.transition(EnrichmentStage::NotesAnalyzed, p.clock.now());
    p.store.upsert(&state).await.unwrap();

    let outcome = p.orchestrator.process_ticket("3001", false).await;

    assert!(outcome.success);
    assert!(outcome.skipped);
    assert_eq!(outcome.stage, Some(EnrichmentStage::NotesAnalyzed));
    assert_eq!(p.model.call_count(), 0);
    assert_eq!(p.cmdb.call_count(), 0);
    assert_eq!(p.state("3001").await.attempts, 1);
}

#[tokio::test]
async fn test_old_ticket_reaches_max_age() {
    let p = Pipeline::new(70);
    p.open_ticket("3002", "Website down", "Cannot reach 192.168.1.5", 30)
        .await;

    let outcome = p.orchestrator.process_ticket("3002", false).await;

    assert!(outcome.success);
    assert_eq!(outcome.stage, Some(EnrichmentStage::Enriched));
    assert!(!outcome.ci_linked);
    assert!(p.state("3002").await.flag(meta::MAX_AGE_REACHED));
    assert_eq!(p.model.call_count(), 0);
    assert!(p.tickets.links().await.is_empty());
}

#[tokio::test]
async fn test_missing_ticket_marks_error() {
    let p = Pipeline::new(70);
    p.open_ticket("3003", "Website down", "Cannot reach 192.168.1.5", 1)
        .await;
    p.tickets.remove_ticket("3003").await;

    let outcome = p.orchestrator.process_ticket("3003", false).await;

    assert!(!outcome.success);
    assert_eq!(outcome.stage, Some(EnrichmentStage::Error));
    assert!(p.state("3003").await.meta_str(meta::ERROR).is_some());
}

// ============================================================================
// Final enrichment
// ============================================================================

#[tokio::test]
async fn test_final_enrichment_is_idempotent() {
    let p = Pipeline::new(70);
    p.open_ticket("4001", "Website down", "Cannot reach 192.168.1.5", 1)
        .await;

    let first = p.orchestrator.run_final_enrichment("4001").await;
    assert!(first.success);
    assert!(first.ci_linked);

    let second = p.orchestrator.run_final_enrichment("4001").await;
    assert!(second.success);
    assert!(second.skipped);

    assert_eq!(p.tickets.annotations_for("4001").await.len(), 1);
    assert_eq!(p.tickets.links().await.len(), 1);
    assert_eq!(p.state("4001").await.attempts, 1);
}

#[tokio::test]
async fn test_final_enrichment_on_untracked_ticket() {
    let p = Pipeline::new(70);
    let outcome = p.orchestrator.run_final_enrichment("unknown").await;
    assert!(!outcome.success);
    assert_eq!(outcome.stage, None);
}

// ============================================================================
// Durable store
// ============================================================================

#[cfg(feature = "database")]
#[tokio::test]
async fn test_pipeline_on_sqlite_store() {
    use ie_core::SqliteStateStore;

    let clock = ManualClock::default();
    let tickets = Arc::new(MockTicketSystem::new("servicenow"));
    let store: Arc<SqliteStateStore> =
        Arc::new(SqliteStateStore::connect("sqlite::memory:", 1).await.unwrap());
    let orchestrator = EnrichmentOrchestrator::new(
        EnrichmentConfig::default(),
        EnrichmentServices {
            tickets: tickets.clone(),
            ci_repository: Arc::new(MockCiRepository::with_items(
                "cmdb",
                vec![sample_ci("ci-web01", "web01", Some("192.168.1.5"), None)],
            )),
            messaging: Arc::new(MockMessagingConnector::new("slack")),
            model: None,
            store: store.clone(),
            clock: Arc::new(clock.clone()),
        },
    )
    .unwrap();

    tickets
        .add_ticket(sample_ticket_at("5001", "down", clock.now() - Duration::hours(1)))
        .await;
    tickets
        .add_note("5001", sample_note("ping 192.168.1.5 fails", clock.now()))
        .await;
    orchestrator.start_tracking("5001", "INC5001", None).await;

    let outcome = orchestrator.process_ticket("5001", false).await;

    assert!(outcome.ci_linked);
    let state = store.get("5001").await.unwrap().unwrap();
    assert_eq!(state.stage, EnrichmentStage::Enriched);
    assert_eq!(state.linked_ci_id(), Some("ci-web01"));
}
