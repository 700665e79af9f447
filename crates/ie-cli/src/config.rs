//! Configuration loading for the incident enricher CLI.

use anyhow::{Context, Result};
use ie_connectors::{SecureString, ServiceNowConfig};
use ie_core::EnrichmentConfig;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::OnceLock;

const REDACTED: &str = "***REDACTED***";

/// Application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Pipeline settings.
    #[serde(default)]
    pub enrichment: EnrichmentConfig,

    /// Ticket system and CI inventory.
    #[serde(default)]
    pub servicenow: ServiceNowSettings,

    /// Messaging channel for clarification prompts.
    #[serde(default)]
    pub slack: SlackSettings,

    /// Language model used for entity extraction.
    #[serde(default)]
    pub llm: LlmSettings,

    /// State persistence.
    #[serde(default)]
    pub database: DatabaseSettings,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingSettings,

    /// Periodic job intervals for `run`.
    #[serde(default)]
    pub scheduler: SchedulerSettings,
}

impl AppConfig {
    /// Loads configuration from a YAML file, expanding `${VAR}` references.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Parses YAML text, expanding `${VAR}` references from the environment.
    pub fn parse(contents: &str) -> Result<Self> {
        let expanded = expand_env_vars(contents, |name| std::env::var(name).ok());
        Ok(serde_yaml::from_str(&expanded)?)
    }

    /// Creates a copy with secrets redacted.
    pub fn redact_secrets(&self) -> Self {
        let mut config = self.clone();

        if !config.servicenow.password.is_empty() {
            config.servicenow.password = REDACTED.to_string();
        }
        if !config.slack.bot_token.is_empty() {
            config.slack.bot_token = REDACTED.to_string();
        }
        if !config.llm.api_key.is_empty() {
            config.llm.api_key = REDACTED.to_string();
        }

        config
    }

    /// Pipeline settings with the Slack default channel filled in.
    pub fn enrichment_config(&self) -> EnrichmentConfig {
        let mut enrichment = self.enrichment.clone();
        if enrichment.clarification_channel.is_none() && !self.slack.default_channel.is_empty() {
            enrichment.clarification_channel = Some(self.slack.default_channel.clone());
        }
        enrichment
    }
}

/// ServiceNow settings. Empty credentials fall back to environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceNowSettings {
    /// Environment name used for the environment variable lookup.
    #[serde(default = "default_environment")]
    pub environment: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_true")]
    pub verify_ssl: bool,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_environment() -> String {
    "prod".to_string()
}

fn default_true() -> bool {
    true
}

fn default_timeout() -> u64 {
    30
}

impl Default for ServiceNowSettings {
    fn default() -> Self {
        Self {
            environment: default_environment(),
            url: String::new(),
            username: String::new(),
            password: String::new(),
            verify_ssl: true,
            timeout_secs: default_timeout(),
        }
    }
}

impl ServiceNowSettings {
    pub fn has_inline_credentials(&self) -> bool {
        !self.url.is_empty() && !self.username.is_empty() && !self.password.is_empty()
    }

    /// Connector configuration from inline credentials or the environment.
    pub fn connector_config(&self) -> Result<ServiceNowConfig> {
        if self.has_inline_credentials() {
            let mut config = ServiceNowConfig::basic(
                &self.url,
                &self.username,
                SecureString::new(self.password.clone()),
            );
            config.connector.verify_tls = self.verify_ssl;
            config.connector.timeout_secs = self.timeout_secs;
            return Ok(config);
        }
        Ok(ServiceNowConfig::from_environment(&self.environment)?)
    }
}

/// Slack settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SlackSettings {
    #[serde(default)]
    pub bot_token: String,
    #[serde(default)]
    pub default_channel: String,
}

/// Language model settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmSettings {
    /// When false, extraction uses the pattern table only.
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_llm_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_llm_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_temperature() -> f32 {
    0.1
}

fn default_max_tokens() -> u32 {
    1024
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: default_llm_base_url(),
            api_key: String::new(),
            model: default_llm_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
        }
    }
}

/// Database settings. An empty URL keeps state in memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSettings {
    #[serde(default = "default_database_url")]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_database_url() -> String {
    "sqlite://incident-enricher.db".to_string()
}

fn default_max_connections() -> u32 {
    5
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json_format: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json_format: false,
        }
    }
}

/// Intervals for the `run` command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSettings {
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
}

fn default_sweep_interval() -> u64 {
    300
}

fn default_cleanup_interval() -> u64 {
    3600
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval(),
            cleanup_interval_secs: default_cleanup_interval(),
        }
    }
}

/// Replaces `${NAME}` with `lookup(NAME)`; unknown names become empty.
pub fn expand_env_vars<F>(input: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    static VAR: OnceLock<Regex> = OnceLock::new();
    let re = VAR.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("Invalid built-in env var pattern")
    });
    re.replace_all(input, |caps: &regex::Captures<'_>| {
        lookup(&caps[1]).unwrap_or_default()
    })
    .into_owned()
}
