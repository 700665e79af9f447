//! Configuration validation for the incident enricher.
//!
//! Runs before any command that talks to external systems so misconfiguration
//! is reported up front instead of as a failed enrichment.

use crate::config::AppConfig;
use colored::Colorize;
use ie_connectors::ServiceNowConfig;
use ie_observability::LoggingConfig;

/// Result of configuration validation.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// Critical errors that prevent startup.
    pub errors: Vec<String>,
    /// Warnings that should be addressed but don't prevent startup.
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    pub fn add_warning(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }

    /// Prints the validation result to the console.
    pub fn print(&self) {
        if !self.warnings.is_empty() {
            println!();
            println!("{}", "Configuration Warnings:".yellow().bold());
            for warning in &self.warnings {
                println!("  {} {}", "⚠".yellow(), warning);
            }
        }

        if !self.errors.is_empty() {
            println!();
            println!("{}", "Configuration Errors:".red().bold());
            for error in &self.errors {
                println!("  {} {}", "✗".red(), error);
            }
        }

        if self.errors.is_empty() && self.warnings.is_empty() {
            println!("  {} Configuration OK", "✓".green());
        }
    }
}

/// Validates application configuration before startup.
pub struct ConfigValidator;

impl ConfigValidator {
    pub fn validate(config: &AppConfig) -> ValidationResult {
        let mut result = ValidationResult::new();

        Self::validate_enrichment(config, &mut result);
        Self::validate_servicenow(config, &mut result);
        Self::validate_slack(config, &mut result);
        Self::validate_llm(config, &mut result);
        Self::validate_database(config, &mut result);
        Self::validate_logging(config, &mut result);
        Self::validate_scheduler(config, &mut result);

        result
    }

    fn validate_enrichment(config: &AppConfig, result: &mut ValidationResult) {
        if let Err(e) = config.enrichment.validate() {
            result.add_error(e.to_string());
        }
        if !config.enrichment.enabled {
            result.add_warning("Enrichment is disabled; every command will be a no-op.");
        }
    }

    fn validate_servicenow(config: &AppConfig, result: &mut ValidationResult) {
        let settings = &config.servicenow;
        if settings.has_inline_credentials() {
            if settings.url.starts_with("http://") {
                result.add_warning(format!(
                    "ServiceNow URL '{}' uses plaintext HTTP. Credentials are sent unencrypted.",
                    settings.url
                ));
            }
            if !settings.verify_ssl {
                result.add_warning("ServiceNow TLS verification is disabled.");
            }
            return;
        }

        if let Err(e) = ServiceNowConfig::from_environment(&settings.environment) {
            result.add_error(format!(
                "{}. Set servicenow.url/username/password in the config file or the \
                 environment variables.",
                e
            ));
        }
    }

    fn validate_slack(config: &AppConfig, result: &mut ValidationResult) {
        if config.slack.bot_token.is_empty() {
            result.add_warning(
                "slack.bot_token is not set. Clarification prompts cannot be sent; \
                 ambiguous tickets will stay in NOTES_ANALYZED until max attempts.",
            );
        }
        if config.enrichment_config().clarification_channel.is_none() {
            result.add_warning(
                "No clarification channel configured (enrichment.clarification_channel or \
                 slack.default_channel).",
            );
        }
    }

    fn validate_llm(config: &AppConfig, result: &mut ValidationResult) {
        let llm = &config.llm;
        if !llm.enabled {
            return;
        }
        if llm.api_key.is_empty() {
            result.add_warning(
                "llm.api_key is not set. Entity extraction will use the pattern table only.",
            );
        }
        if llm.base_url.starts_with("http://") && !is_loopback_url(&llm.base_url) {
            result.add_warning(format!(
                "Language model URL '{}' uses plaintext HTTP.",
                llm.base_url
            ));
        }
    }

    fn validate_database(config: &AppConfig, result: &mut ValidationResult) {
        let url = &config.database.url;
        if url.is_empty() {
            result.add_warning(
                "database.url is empty. Enrichment state is kept in memory and lost on exit.",
            );
        } else if !url.starts_with("sqlite:") {
            result.add_error(format!(
                "Unsupported database URL '{}'. Only sqlite: URLs are supported.",
                url
            ));
        }
        if config.database.max_connections == 0 {
            result.add_error("database.max_connections must be at least 1.");
        }
    }

    fn validate_logging(config: &AppConfig, result: &mut ValidationResult) {
        if let Err(e) = LoggingConfig::from_settings(&config.logging.level, false) {
            result.add_error(format!("logging.level: {}", e));
        }
    }

    fn validate_scheduler(config: &AppConfig, result: &mut ValidationResult) {
        let scheduler = &config.scheduler;
        if scheduler.sweep_interval_secs == 0 {
            result.add_error("scheduler.sweep_interval_secs must be positive.");
        }
        if scheduler.cleanup_interval_secs == 0 {
            result.add_error("scheduler.cleanup_interval_secs must be positive.");
        }
        if config.enrichment.clarification_ttl_secs < scheduler.sweep_interval_secs {
            result.add_warning(format!(
                "Clarification TTL ({}s) is shorter than the sweep interval ({}s); \
                 duplicate prompts may be sent between sweeps.",
                config.enrichment.clarification_ttl_secs, scheduler.sweep_interval_secs
            ));
        }
    }
}

fn is_loopback_url(url: &str) -> bool {
    let host = url
        .trim_start_matches("http://")
        .split(['/', ':'])
        .next()
        .unwrap_or_default();
    matches!(host, "localhost" | "127.0.0.1")
}
