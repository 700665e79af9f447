//! Messaging connectors used for human clarification.

pub mod mock;
pub mod slack;

pub use mock::{MockMessagingConnector, RecordedPrompt};
pub use slack::{SlackBlock, SlackConfig, SlackConnector};
