//! Logging infrastructure for the incident enricher.
//!
//! Structured logging on the tracing ecosystem. `RUST_LOG` wins over the
//! configured level when set.

use std::str::FromStr;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Crates covered by the fallback filter.
const CRATES: &[&str] = &["ie_core", "ie_connectors", "ie_observability", "incident_enricher"];

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Log level.
    pub level: Level,
    /// Whether to use JSON format.
    pub json_format: bool,
    /// Whether to include span events.
    pub include_spans: bool,
    /// Whether to include file/line info.
    pub include_location: bool,
    /// Whether to include thread IDs.
    pub include_thread_ids: bool,
    /// Whether to include target (module path).
    pub include_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            json_format: false,
            include_spans: false,
            include_location: false,
            include_thread_ids: false,
            include_target: true,
        }
    }
}

impl LoggingConfig {
    /// Verbose output for local runs.
    pub fn development() -> Self {
        Self {
            level: Level::DEBUG,
            json_format: false,
            include_spans: true,
            include_location: true,
            include_thread_ids: true,
            include_target: true,
        }
    }

    /// JSON output for log aggregation.
    pub fn production() -> Self {
        Self {
            level: Level::INFO,
            json_format: true,
            include_spans: false,
            include_location: false,
            include_thread_ids: false,
            include_target: true,
        }
    }

    /// Builds a config from a level name ("debug", "info", ...) and format.
    pub fn from_settings(level: &str, json_format: bool) -> Result<Self, String> {
        let level = Level::from_str(level).map_err(|_| format!("unknown log level '{}'", level))?;
        let base = if json_format {
            Self::production()
        } else {
            Self::default()
        };
        Ok(Self { level, ..base })
    }

    /// Filter directive used when `RUST_LOG` is unset.
    pub fn fallback_filter(&self) -> String {
        CRATES
            .iter()
            .map(|krate| format!("{}={}", krate, self.level))
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Initializes logging with the default configuration.
pub fn init_logging() {
    init_logging_with_config(LoggingConfig::default());
}

/// Initializes logging with the given configuration.
pub fn init_logging_with_config(config: LoggingConfig) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.fallback_filter()));

    let span_events = if config.include_spans {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    if config.json_format {
        let fmt_layer = fmt::layer()
            .json()
            .with_span_events(span_events)
            .with_file(config.include_location)
            .with_line_number(config.include_location)
            .with_thread_ids(config.include_thread_ids)
            .with_target(config.include_target);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .init();
    } else {
        let fmt_layer = fmt::layer()
            .with_span_events(span_events)
            .with_file(config.include_location)
            .with_line_number(config.include_location)
            .with_thread_ids(config.include_thread_ids)
            .with_target(config.include_target);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .init();
    }
}

/// Creates a span for one ticket's enrichment.
#[macro_export]
macro_rules! enrichment_span {
    ($ticket_id:expr) => {
        tracing::info_span!("enrichment", ticket_id = %$ticket_id)
    };
    ($ticket_id:expr, $($field:tt)*) => {
        tracing::info_span!("enrichment", ticket_id = %$ticket_id, $($field)*)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets() {
        assert_eq!(LoggingConfig::default().level, Level::INFO);
        assert!(LoggingConfig::production().json_format);
        assert_eq!(LoggingConfig::development().level, Level::DEBUG);
    }

    #[test]
    fn test_from_settings() {
        let config = LoggingConfig::from_settings("debug", true).unwrap();
        assert_eq!(config.level, Level::DEBUG);
        assert!(config.json_format);
        assert!(LoggingConfig::from_settings("chatty", false).is_err());
    }

    #[test]
    fn test_fallback_filter_names_every_crate() {
        let filter = LoggingConfig::default().fallback_filter();
        assert!(filter.starts_with("ie_core=INFO"));
        assert!(filter.contains("incident_enricher=INFO"));
    }

    #[test]
    fn test_enrichment_span_macro() {
        let span = crate::enrichment_span!("T1", attempt = 2);
        let _entered = span.enter();

        let ticket_id = String::from("T2");
        let force = true;
        let span = crate::enrichment_span!(ticket_id, command = "enrich", force);
        span.in_scope(|| tracing::info!("inside enrichment span"));
    }
}
