//! Metric descriptions and enrichment KPIs.

use chrono::{DateTime, Duration, Utc};
use ie_core::{EnrichmentOutcome, EnrichmentStage};
use metrics::{describe_counter, describe_gauge, describe_histogram, gauge};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Registers descriptions for every metric the pipeline emits.
pub fn register_metrics() {
    describe_counter!(
        "ie_enrichment_runs_total",
        "Enrichment invocations by outcome"
    );
    describe_counter!(
        "ie_stop_conditions_total",
        "Tickets stopped before extraction, by reason"
    );
    describe_counter!(
        "ie_entities_extracted_total",
        "Entities extracted, by source"
    );
    describe_counter!(
        "ie_model_failures_total",
        "Language model calls that failed or timed out"
    );
    describe_counter!(
        "ie_ci_lookups_total",
        "Configuration item lookups by strategy and status"
    );
    describe_counter!("ie_ci_links_total", "Configuration items linked, by mode");
    describe_counter!(
        "ie_clarifications_total",
        "Clarification requests by result"
    );
    describe_counter!(
        "ie_clarification_cache_evictions_total",
        "Pending clarifications dropped after their TTL"
    );
    describe_counter!("ie_sweeps_total", "Completed sweeps over active tickets");

    describe_gauge!(
        "ie_tickets_tracked",
        "Tickets currently tracked by the KPI collector"
    );

    describe_histogram!(
        "ie_model_call_duration_seconds",
        "Language model call latency"
    );
    describe_histogram!(
        "ie_enrichment_duration_seconds",
        "Duration of one enrichment invocation"
    );
}

/// Key performance indicators for the enrichment pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnrichmentKpis {
    /// Tickets seen by the collector.
    pub total_tickets: u64,
    /// Tickets that reached `ENRICHED`.
    pub enriched: u64,
    /// Share of enriched tickets that ended with a linked CI.
    pub link_rate: f64,
    /// Share of tickets that needed a clarification prompt.
    pub clarification_rate: f64,
    /// Share of tickets with at least one failed invocation.
    pub failure_rate: f64,
    /// Mean time from tracking start to `ENRICHED`.
    pub mean_time_to_enrichment: Option<Duration>,
}

#[derive(Debug, Clone)]
struct TicketTiming {
    tracked_at: DateTime<Utc>,
    enriched_at: Option<DateTime<Utc>>,
    linked: bool,
    clarified: bool,
    failed: bool,
}

impl TicketTiming {
    fn new(at: DateTime<Utc>) -> Self {
        Self {
            tracked_at: at,
            enriched_at: None,
            linked: false,
            clarified: false,
            failed: false,
        }
    }
}

/// KPI collector fed with orchestrator outcomes.
pub struct EnrichmentMetrics {
    timings: Arc<RwLock<HashMap<String, TicketTiming>>>,
}

impl EnrichmentMetrics {
    pub fn new() -> Self {
        register_metrics();
        Self {
            timings: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Records when a ticket started being tracked.
    pub async fn record_tracking_started(&self, ticket_id: &str, at: DateTime<Utc>) {
        let mut timings = self.timings.write().await;
        timings
            .entry(ticket_id.to_string())
            .or_insert_with(|| TicketTiming::new(at));
        gauge!("ie_tickets_tracked").set(timings.len() as f64);
    }

    /// Folds one outcome into the ticket's timing record.
    pub async fn record_outcome(&self, outcome: &EnrichmentOutcome, at: DateTime<Utc>) {
        if outcome.stage.is_none() {
            return;
        }
        let mut timings = self.timings.write().await;
        let timing = timings
            .entry(outcome.ticket_id.clone())
            .or_insert_with(|| TicketTiming::new(at));

        if !outcome.success {
            timing.failed = true;
        }
        match outcome.stage {
            Some(EnrichmentStage::ClarificationPending) => timing.clarified = true,
            Some(EnrichmentStage::Enriched) => {
                timing.enriched_at.get_or_insert(at);
                timing.linked = outcome.ci_linked;
            }
            _ => {}
        }
        gauge!("ie_tickets_tracked").set(timings.len() as f64);
    }

    pub async fn calculate_kpis(&self) -> EnrichmentKpis {
        let timings = self.timings.read().await;
        let total = timings.len() as u64;

        let durations: Vec<i64> = timings
            .values()
            .filter_map(|t| t.enriched_at.map(|e| (e - t.tracked_at).num_seconds()))
            .collect();
        let enriched = durations.len() as u64;
        let mean_time_to_enrichment = if durations.is_empty() {
            None
        } else {
            let sum: i64 = durations.iter().sum();
            Some(Duration::seconds(sum / durations.len() as i64))
        };

        let linked = timings
            .values()
            .filter(|t| t.enriched_at.is_some() && t.linked)
            .count() as u64;
        let clarified = timings.values().filter(|t| t.clarified).count() as u64;
        let failed = timings.values().filter(|t| t.failed).count() as u64;

        EnrichmentKpis {
            total_tickets: total,
            enriched,
            link_rate: ratio(linked, enriched),
            clarification_rate: ratio(clarified, total),
            failure_rate: ratio(failed, total),
            mean_time_to_enrichment,
        }
    }

    /// Drops records of tickets tracked before `now - max_age_hours`.
    pub async fn cleanup(&self, now: DateTime<Utc>, max_age_hours: i64) {
        let Some(cutoff) =
            Duration::try_hours(max_age_hours).and_then(|age| now.checked_sub_signed(age))
        else {
            return;
        };
        let mut timings = self.timings.write().await;
        timings.retain(|_, t| t.tracked_at > cutoff);
        gauge!("ie_tickets_tracked").set(timings.len() as f64);
    }
}

impl Default for EnrichmentMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(ticket_id: &str, stage: EnrichmentStage, ci_linked: bool) -> EnrichmentOutcome {
        EnrichmentOutcome {
            success: true,
            ticket_id: ticket_id.to_string(),
            stage: Some(stage),
            message: String::new(),
            ci_linked,
            linked_ci: ci_linked.then(|| "ci-1".to_string()),
            skipped: false,
            attempts: 1,
        }
    }

    #[tokio::test]
    async fn test_kpis_from_outcomes() {
        let collector = EnrichmentMetrics::new();
        let start = Utc::now();

        collector.record_tracking_started("T1", start).await;
        collector.record_tracking_started("T2", start).await;
        collector
            .record_outcome(
                &outcome("T1", EnrichmentStage::Enriched, true),
                start + Duration::minutes(10),
            )
            .await;
        collector
            .record_outcome(
                &outcome("T2", EnrichmentStage::ClarificationPending, false),
                start + Duration::minutes(5),
            )
            .await;
        collector
            .record_outcome(
                &outcome("T2", EnrichmentStage::Enriched, false),
                start + Duration::minutes(30),
            )
            .await;

        let kpis = collector.calculate_kpis().await;
        assert_eq!(kpis.total_tickets, 2);
        assert_eq!(kpis.enriched, 2);
        assert_eq!(kpis.link_rate, 0.5);
        assert_eq!(kpis.clarification_rate, 0.5);
        assert_eq!(kpis.failure_rate, 0.0);
        assert_eq!(kpis.mean_time_to_enrichment, Some(Duration::minutes(20)));
    }

    #[tokio::test]
    async fn test_untracked_outcomes_are_ignored() {
        let collector = EnrichmentMetrics::new();
        collector
            .record_outcome(&EnrichmentOutcome::not_tracked("X"), Utc::now())
            .await;
        assert_eq!(collector.calculate_kpis().await.total_tickets, 0);
    }

    #[tokio::test]
    async fn test_cleanup_drops_old_records() {
        let collector = EnrichmentMetrics::new();
        let now = Utc::now();
        collector
            .record_tracking_started("old", now - Duration::hours(48))
            .await;
        collector.record_tracking_started("new", now).await;

        collector.cleanup(now, 24).await;

        assert_eq!(collector.calculate_kpis().await.total_tickets, 1);
    }

    #[tokio::test]
    async fn test_cleanup_with_unbounded_age_keeps_records() {
        let collector = EnrichmentMetrics::new();
        let now = Utc::now();
        collector
            .record_tracking_started("old", now - Duration::hours(48))
            .await;

        collector.cleanup(now, i64::MAX).await;

        assert_eq!(collector.calculate_kpis().await.total_tickets, 1);
    }
}
