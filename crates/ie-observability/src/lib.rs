//! # ie-observability
//!
//! Logging and metrics for the incident enricher.
//!
//! Pipeline code records metrics inline through the `metrics` facade; this
//! crate installs the tracing subscriber, describes the metric names once at
//! start-up, and keeps the KPI collector the CLI feeds with outcomes.

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, init_logging_with_config, LoggingConfig};
pub use metrics::{register_metrics, EnrichmentKpis, EnrichmentMetrics};
