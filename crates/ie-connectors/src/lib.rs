//! # ie-connectors
//!
//! Connectors for the systems the incident enricher talks to: the ticket
//! system, the configuration item inventory, the messaging channel used for
//! clarification prompts, and the language model used for entity extraction.
//!
//! Each collaborator is a trait in [`traits`] with a production adapter and
//! an in-memory mock for tests.

pub mod cmdb;
pub mod collaboration;
pub mod http;
pub mod itsm;
pub mod llm;
pub mod secure_string;
pub mod testing;
pub mod traits;

pub use secure_string::SecureString;

pub use traits::{
    AuthConfig, CiRepositoryConnector, CiSearchQuery, ClarificationCallback, ClarificationChoice,
    ClarificationOption, ClarificationPrompt, ConfigurationItem, Connector, ConnectorCategory,
    ConnectorConfig, ConnectorError, ConnectorHealth, ConnectorResult, LanguageModelConnector,
    MessageRef, MessagingConnector, ModelEntity, ModelExtraction, PostedMessage, Ticket,
    TicketNote, TicketSystemConnector, TokenUsage,
};

pub use cmdb::{LookupKind, MockCiRepository};
pub use collaboration::{MockMessagingConnector, SlackConfig, SlackConnector};
pub use itsm::{MockTicketSystem, ServiceNowConfig, ServiceNowConnector};
pub use llm::{MockLanguageModel, OpenAiConfig, OpenAiExtractionModel};
