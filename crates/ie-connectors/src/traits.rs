//! Connector trait definitions for the incident enricher.
//!
//! The enrichment pipeline talks to four external collaborators: the ticket
//! system, the configuration item (CI) inventory, a messaging channel used for
//! human clarification, and a language model used for entity extraction. Each
//! collaborator is described here as a trait so that production adapters and
//! in-memory mocks are interchangeable.

use crate::secure_string::SecureString;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Errors that can occur in connectors.
#[derive(Error, Debug, Clone)]
pub enum ConnectorError {
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Rate limited: retry after {0} seconds")]
    RateLimited(u64),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ConnectorError {
    /// Returns true for failures that may succeed when retried later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ConnectorError::ConnectionFailed(_)
                | ConnectorError::Timeout(_)
                | ConnectorError::RateLimited(_)
        )
    }
}

/// Result type for connector operations.
pub type ConnectorResult<T> = Result<T, ConnectorError>;

/// Health status of a connector.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConnectorHealth {
    /// Connector is healthy and operational.
    Healthy,
    /// Connector is degraded but still functional.
    Degraded(String),
    /// Connector is unhealthy and not operational.
    Unhealthy(String),
    /// Health status is unknown.
    Unknown,
}

/// Configuration for a connector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorConfig {
    /// Connector name/identifier.
    pub name: String,
    /// Base URL for the API.
    pub base_url: String,
    /// Authentication configuration.
    pub auth: AuthConfig,
    /// Request timeout in seconds.
    pub timeout_secs: u64,
    /// Maximum retries.
    pub max_retries: u32,
    /// Whether to verify TLS certificates.
    pub verify_tls: bool,
    /// Additional headers to include.
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

/// Authentication configuration.
///
/// Credential fields use `SecureString` so they are zeroized on drop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthConfig {
    /// No authentication.
    None,
    /// API key sent in a custom header.
    ApiKey {
        key: SecureString,
        header_name: String,
    },
    /// Bearer token authentication.
    BearerToken { token: SecureString },
    /// Basic authentication.
    Basic {
        username: String,
        password: SecureString,
    },
}

/// Connector categories.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ConnectorCategory {
    /// Ticket systems (ServiceNow incidents).
    Itsm,
    /// Configuration item inventories.
    Cmdb,
    /// Chat and messaging platforms.
    Collaboration,
    /// Hosted language models.
    LanguageModel,
}

impl std::fmt::Display for ConnectorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectorCategory::Itsm => "itsm",
            ConnectorCategory::Cmdb => "cmdb",
            ConnectorCategory::Collaboration => "collaboration",
            ConnectorCategory::LanguageModel => "language_model",
        };
        f.write_str(name)
    }
}

/// Base trait for all connectors.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Returns the connector name.
    fn name(&self) -> &str;

    /// Returns the connector type (e.g., "itsm", "collaboration").
    fn connector_type(&self) -> &str;

    /// Returns the connector category.
    fn category(&self) -> ConnectorCategory {
        match self.connector_type() {
            "cmdb" => ConnectorCategory::Cmdb,
            "collaboration" => ConnectorCategory::Collaboration,
            "language_model" => ConnectorCategory::LanguageModel,
            _ => ConnectorCategory::Itsm,
        }
    }

    /// Checks the health of the connector.
    async fn health_check(&self) -> ConnectorResult<ConnectorHealth>;

    /// Tests the connection to the external system.
    async fn test_connection(&self) -> ConnectorResult<bool>;
}

// ---------------------------------------------------------------------------
// Ticket system
// ---------------------------------------------------------------------------

/// A support ticket as seen by the enrichment pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticket {
    /// System identifier (ServiceNow `sys_id`).
    pub id: String,
    /// Human-facing number (e.g., "INC0012345").
    pub number: String,
    /// One-line summary.
    pub short_description: String,
    /// Long description.
    pub description: String,
    /// Ticket state as reported by the ticket system.
    pub state: String,
    /// Parent case, if this incident belongs to one.
    pub parent_id: Option<String>,
    /// Currently linked configuration item.
    pub configuration_item: Option<String>,
    /// Created timestamp.
    pub created_at: DateTime<Utc>,
    /// Updated timestamp.
    pub updated_at: DateTime<Utc>,
    /// URL to view the ticket.
    pub url: Option<String>,
    /// Raw fields returned by the ticket system.
    #[serde(default)]
    pub fields: HashMap<String, serde_json::Value>,
}

impl Ticket {
    /// Summary text used for extraction: short description plus description.
    pub fn summary_text(&self) -> String {
        if self.description.trim().is_empty() {
            self.short_description.clone()
        } else {
            format!("{}\n{}", self.short_description, self.description)
        }
    }
}

/// A work note or comment on a ticket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TicketNote {
    /// Note body.
    pub text: String,
    /// When the note was written.
    pub created_at: DateTime<Utc>,
    /// Author of the note.
    pub created_by: String,
}

/// Ticket system connector (ServiceNow incidents).
#[async_trait]
pub trait TicketSystemConnector: Connector {
    /// Gets a ticket by ID, returning `None` when it does not exist.
    async fn get_ticket(&self, ticket_id: &str) -> ConnectorResult<Option<Ticket>>;

    /// Gets up to `limit` notes for a ticket, newest first.
    async fn get_notes(&self, ticket_id: &str, limit: usize) -> ConnectorResult<Vec<TicketNote>>;

    /// Appends an annotation (work note) to a ticket.
    async fn annotate(&self, ticket_id: &str, text: &str) -> ConnectorResult<()>;

    /// Links a configuration item to a ticket.
    async fn link_configuration_item(&self, ticket_id: &str, ci_id: &str) -> ConnectorResult<()>;
}

// ---------------------------------------------------------------------------
// CI inventory
// ---------------------------------------------------------------------------

/// A configuration item from the inventory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigurationItem {
    /// Inventory identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// CI class (e.g., "cmdb_ci_linux_server").
    pub class: String,
    /// Primary IP address, if recorded.
    pub ip_address: Option<String>,
    /// Fully qualified domain name, if recorded.
    pub fqdn: Option<String>,
    /// Additional attributes.
    #[serde(default)]
    pub attributes: HashMap<String, serde_json::Value>,
}

/// Name-based CI search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CiSearchQuery {
    /// Name (or name fragment) to search for.
    pub name: String,
    /// Maximum number of results.
    pub limit: usize,
}

impl CiSearchQuery {
    pub fn by_name(name: impl Into<String>, limit: usize) -> Self {
        Self {
            name: name.into(),
            limit,
        }
    }
}

/// Configuration item inventory connector.
#[async_trait]
pub trait CiRepositoryConnector: Connector {
    /// Finds CIs whose IP address equals `ip`.
    async fn find_by_ip(&self, ip: &str) -> ConnectorResult<Vec<ConfigurationItem>>;

    /// Finds CIs whose FQDN or host name equals `host`.
    async fn find_by_fqdn(&self, host: &str) -> ConnectorResult<Vec<ConfigurationItem>>;

    /// Searches CIs by name.
    async fn search(&self, query: &CiSearchQuery) -> ConnectorResult<Vec<ConfigurationItem>>;
}

// ---------------------------------------------------------------------------
// Messaging
// ---------------------------------------------------------------------------

/// One selectable candidate in a clarification prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClarificationOption {
    /// CI identifier returned when the option is chosen.
    pub ci_id: String,
    /// CI display name.
    pub name: String,
    /// CI class.
    pub class: String,
    /// Match confidence (0-100).
    pub confidence: u8,
    /// Why the CI was proposed.
    pub reason: String,
}

/// Interactive disambiguation prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClarificationPrompt {
    /// Ticket the prompt is about.
    pub ticket_id: String,
    /// Human-facing ticket number.
    pub ticket_number: String,
    /// Ticket summary shown above the candidates.
    pub summary: String,
    /// Candidates to choose from.
    pub options: Vec<ClarificationOption>,
}

/// Reference to a message posted to a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRef {
    /// Channel the message lives in.
    pub channel: String,
    /// Platform message identifier (Slack `ts`).
    pub message_id: String,
}

/// Result of posting an interactive message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostedMessage {
    /// Whether the platform accepted the message.
    pub ok: bool,
    /// Reference to the posted message when accepted.
    pub message_ref: Option<MessageRef>,
}

/// The human decision carried by a clarification callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", content = "ci_id", rename_all = "snake_case")]
pub enum ClarificationChoice {
    /// A candidate CI was selected.
    Select(String),
    /// The human declined to pick a CI.
    Skip,
}

/// Out-of-band callback delivered by the messaging platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClarificationCallback {
    /// Ticket the response refers to.
    pub ticket_id: String,
    /// What the human chose.
    pub choice: ClarificationChoice,
    /// Who responded.
    pub responded_by: String,
}

/// Messaging channel connector (Slack).
#[async_trait]
pub trait MessagingConnector: Connector {
    /// Posts an interactive clarification prompt to a channel.
    async fn post_interactive(
        &self,
        prompt: &ClarificationPrompt,
        channel: &str,
    ) -> ConnectorResult<PostedMessage>;

    /// Replaces the content of a previously posted message.
    async fn update_message(&self, message_ref: &MessageRef, text: &str) -> ConnectorResult<()>;
}

// ---------------------------------------------------------------------------
// Language model
// ---------------------------------------------------------------------------

/// An entity reported by the language model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelEntity {
    /// Category key as reported by the model (e.g., "ip_addresses").
    pub category: String,
    /// Entity text.
    pub value: String,
    /// Per-entity confidence when the model provides one.
    #[serde(default)]
    pub confidence: Option<f64>,
}

/// Token accounting for a model call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Structured extraction result from the language model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelExtraction {
    /// Categorized entities.
    pub entities: Vec<ModelEntity>,
    /// Issue intent classification as reported by the model.
    pub intent: String,
    /// Overall model confidence (0.0-1.0).
    pub confidence: f64,
    /// Token usage for the call.
    #[serde(default)]
    pub token_usage: TokenUsage,
}

/// Language model connector used for entity extraction.
///
/// Callers bound the call with their own timeout; dropping the future cancels
/// the request.
#[async_trait]
pub trait LanguageModelConnector: Connector {
    /// Extracts categorized entities and an intent classification from text.
    async fn extract(&self, text: &str) -> ConnectorResult<ModelExtraction>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors() {
        assert!(ConnectorError::Timeout("slow".into()).is_transient());
        assert!(ConnectorError::RateLimited(30).is_transient());
        assert!(ConnectorError::ConnectionFailed("refused".into()).is_transient());
        assert!(!ConnectorError::NotFound("INC1".into()).is_transient());
        assert!(!ConnectorError::InvalidResponse("bad json".into()).is_transient());
    }

    #[test]
    fn test_summary_text_skips_empty_description() {
        let now = Utc::now();
        let mut ticket = Ticket {
            id: "abc".into(),
            number: "INC0010001".into(),
            short_description: "VPN down".into(),
            description: "   ".into(),
            state: "1".into(),
            parent_id: None,
            configuration_item: None,
            created_at: now,
            updated_at: now,
            url: None,
            fields: HashMap::new(),
        };
        assert_eq!(ticket.summary_text(), "VPN down");

        ticket.description = "Users on 10.0.0.0/24 cannot connect".into();
        assert_eq!(
            ticket.summary_text(),
            "VPN down\nUsers on 10.0.0.0/24 cannot connect"
        );
    }

    #[test]
    fn test_clarification_choice_serialization() {
        let select = serde_json::to_value(ClarificationChoice::Select("ci-1".into())).unwrap();
        assert_eq!(select["decision"], "select");
        assert_eq!(select["ci_id"], "ci-1");

        let skip = serde_json::to_value(ClarificationChoice::Skip).unwrap();
        assert_eq!(skip["decision"], "skip");
    }

    #[test]
    fn test_category_from_connector_type() {
        struct Dummy(&'static str);

        #[async_trait]
        impl Connector for Dummy {
            fn name(&self) -> &str {
                "dummy"
            }
            fn connector_type(&self) -> &str {
                self.0
            }
            async fn health_check(&self) -> ConnectorResult<ConnectorHealth> {
                Ok(ConnectorHealth::Healthy)
            }
            async fn test_connection(&self) -> ConnectorResult<bool> {
                Ok(true)
            }
        }

        assert_eq!(Dummy("cmdb").category(), ConnectorCategory::Cmdb);
        assert_eq!(Dummy("language_model").category(), ConnectorCategory::LanguageModel);
        assert_eq!(Dummy("itsm").category(), ConnectorCategory::Itsm);
    }
}
