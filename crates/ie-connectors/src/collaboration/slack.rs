//! Slack connector for CI clarification prompts.
//!
//! Posts Block Kit messages listing candidate configuration items with a
//! "Select" button per candidate and a "Skip" button, and parses the
//! `block_actions` interaction payloads Slack sends back when a button is
//! pressed.

use crate::http::HttpClient;
use crate::secure_string::SecureString;
use crate::traits::{
    AuthConfig, ClarificationCallback, ClarificationChoice, ClarificationOption,
    ClarificationPrompt, Connector, ConnectorCategory, ConnectorConfig, ConnectorError,
    ConnectorHealth, ConnectorResult, MessageRef, MessagingConnector, PostedMessage,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{info, instrument, warn};

/// Prefix shared by all action ids emitted by this connector.
pub const ACTION_PREFIX: &str = "ie_clarify";

/// Slack connector configuration.
#[derive(Debug, Clone)]
pub struct SlackConfig {
    /// Bot token for Slack API access.
    pub bot_token: SecureString,
    /// Default channel for clarification prompts.
    pub default_channel: String,
    /// API base URL (overridable for tests and Enterprise Grid proxies).
    pub api_base_url: String,
}

impl SlackConfig {
    pub fn new(bot_token: SecureString, default_channel: impl Into<String>) -> Self {
        Self {
            bot_token,
            default_channel: default_channel.into(),
            api_base_url: "https://slack.com/api".to_string(),
        }
    }
}

/// Slack connector.
pub struct SlackConnector {
    config: SlackConfig,
    client: HttpClient,
}

/// A Slack Block Kit block element.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SlackBlock {
    /// Header block.
    Header { text: SlackTextObject },
    /// Section block with text and optional accessory.
    Section {
        text: SlackTextObject,
        #[serde(skip_serializing_if = "Option::is_none")]
        accessory: Option<SlackButton>,
        #[serde(skip_serializing_if = "Option::is_none")]
        fields: Option<Vec<SlackTextObject>>,
    },
    /// Divider block.
    Divider,
    /// Actions block with buttons.
    Actions { elements: Vec<SlackButton> },
    /// Context block for secondary information.
    Context { elements: Vec<SlackTextObject> },
}

/// Slack text object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlackTextObject {
    /// "plain_text" or "mrkdwn".
    #[serde(rename = "type")]
    pub text_type: String,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub emoji: Option<bool>,
}

impl SlackTextObject {
    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            text_type: "plain_text".to_string(),
            text: text.into(),
            emoji: Some(true),
        }
    }

    pub fn mrkdwn(text: impl Into<String>) -> Self {
        Self {
            text_type: "mrkdwn".to_string(),
            text: text.into(),
            emoji: None,
        }
    }
}

/// Button element, used both as a section accessory and inside actions blocks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlackButton {
    #[serde(rename = "type")]
    pub element_type: String,
    pub text: SlackTextObject,
    pub action_id: String,
    pub value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub style: Option<String>,
}

impl SlackButton {
    fn new(label: &str, action_id: String, value: String, style: Option<&str>) -> Self {
        Self {
            element_type: "button".to_string(),
            text: SlackTextObject::plain(label),
            action_id,
            value,
            style: style.map(String::from),
        }
    }
}

/// JSON carried in each button's `value`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ButtonValue {
    ticket_id: String,
    decision: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ci_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    ok: bool,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    ts: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InteractionPayload {
    #[serde(rename = "type")]
    payload_type: String,
    user: InteractionUser,
    #[serde(default)]
    actions: Vec<InteractionAction>,
}

#[derive(Debug, Deserialize)]
struct InteractionUser {
    id: String,
    #[serde(default)]
    username: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InteractionAction {
    action_id: String,
    #[serde(default)]
    value: Option<String>,
}

impl SlackConnector {
    pub fn new(config: SlackConfig) -> ConnectorResult<Self> {
        let connector_config = ConnectorConfig {
            name: "slack".to_string(),
            base_url: config.api_base_url.clone(),
            auth: AuthConfig::BearerToken {
                token: config.bot_token.clone(),
            },
            timeout_secs: 30,
            max_retries: 2,
            verify_tls: true,
            headers: HashMap::new(),
        };

        let client = HttpClient::new(connector_config)?;
        Ok(Self { config, client })
    }

    /// Channel used when a caller does not name one.
    pub fn default_channel(&self) -> &str {
        &self.config.default_channel
    }

    /// Builds the Block Kit body of a clarification prompt.
    pub fn build_clarification_blocks(prompt: &ClarificationPrompt) -> Vec<SlackBlock> {
        let mut blocks = vec![
            SlackBlock::Header {
                text: SlackTextObject::plain(format!(
                    ":mag: Which configuration item is {} about?",
                    prompt.ticket_number
                )),
            },
            SlackBlock::Section {
                text: SlackTextObject::mrkdwn(format!("*{}*", prompt.summary)),
                accessory: None,
                fields: None,
            },
            SlackBlock::Divider,
        ];

        for option in &prompt.options {
            blocks.push(Self::candidate_section(&prompt.ticket_id, option));
        }

        blocks.push(SlackBlock::Actions {
            elements: vec![SlackButton::new(
                "Skip",
                format!("{}_skip_{}", ACTION_PREFIX, prompt.ticket_id),
                button_value(&prompt.ticket_id, "skip", None),
                None,
            )],
        });
        blocks.push(SlackBlock::Context {
            elements: vec![SlackTextObject::mrkdwn(
                "Sent by *Incident Enricher*. Pick the matching CI or skip if none apply.",
            )],
        });
        blocks
    }

    fn candidate_section(ticket_id: &str, option: &ClarificationOption) -> SlackBlock {
        SlackBlock::Section {
            text: SlackTextObject::mrkdwn(format!("*{}*\n{}", option.name, option.reason)),
            accessory: Some(SlackButton::new(
                "Select",
                format!("{}_select_{}_{}", ACTION_PREFIX, ticket_id, option.ci_id),
                button_value(ticket_id, "select", Some(&option.ci_id)),
                Some("primary"),
            )),
            fields: Some(vec![
                SlackTextObject::mrkdwn(format!("*Class:*\n{}", option.class)),
                SlackTextObject::mrkdwn(format!("*Confidence:*\n{}%", option.confidence)),
            ]),
        }
    }

    /// Parses a `block_actions` interaction payload into a clarification callback.
    pub fn parse_interaction(payload: &str) -> ConnectorResult<ClarificationCallback> {
        let payload: InteractionPayload = serde_json::from_str(payload)
            .map_err(|e| ConnectorError::InvalidRequest(format!("Invalid payload: {}", e)))?;

        if payload.payload_type != "block_actions" {
            return Err(ConnectorError::InvalidRequest(format!(
                "Unsupported interaction type: {}",
                payload.payload_type
            )));
        }

        let action = payload
            .actions
            .iter()
            .find(|a| a.action_id.starts_with(ACTION_PREFIX))
            .ok_or_else(|| ConnectorError::InvalidRequest("No clarification action".into()))?;

        let raw_value = action
            .value
            .as_deref()
            .ok_or_else(|| ConnectorError::InvalidRequest("Action has no value".into()))?;
        let value: ButtonValue = serde_json::from_str(raw_value)
            .map_err(|e| ConnectorError::InvalidRequest(format!("Invalid action value: {}", e)))?;

        let choice = match (value.decision.as_str(), value.ci_id) {
            ("select", Some(ci_id)) => ClarificationChoice::Select(ci_id),
            ("skip", _) => ClarificationChoice::Skip,
            (other, _) => {
                return Err(ConnectorError::InvalidRequest(format!(
                    "Unknown decision: {}",
                    other
                )))
            }
        };

        Ok(ClarificationCallback {
            ticket_id: value.ticket_id,
            choice,
            responded_by: payload.user.username.unwrap_or(payload.user.id),
        })
    }

    fn check_response(method: &str, response: &ChatResponse) -> ConnectorResult<()> {
        if response.ok {
            return Ok(());
        }
        let error = response.error.as_deref().unwrap_or("unknown error");
        warn!(method, error, "Slack API call rejected");
        Err(ConnectorError::RequestFailed(format!(
            "Slack {} failed: {}",
            method, error
        )))
    }
}

fn button_value(ticket_id: &str, decision: &str, ci_id: Option<&str>) -> String {
    let value = ButtonValue {
        ticket_id: ticket_id.to_string(),
        decision: decision.to_string(),
        ci_id: ci_id.map(String::from),
    };
    serde_json::to_string(&value).unwrap_or_default()
}

#[async_trait]
impl Connector for SlackConnector {
    fn name(&self) -> &str {
        "slack"
    }

    fn connector_type(&self) -> &str {
        "collaboration"
    }

    fn category(&self) -> ConnectorCategory {
        ConnectorCategory::Collaboration
    }

    async fn health_check(&self) -> ConnectorResult<ConnectorHealth> {
        let response: serde_json::Value = self.client.get_json("/auth.test").await?;
        if response.get("ok").and_then(|v| v.as_bool()) == Some(true) {
            Ok(ConnectorHealth::Healthy)
        } else {
            let error = response
                .get("error")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown error");
            Ok(ConnectorHealth::Unhealthy(error.to_string()))
        }
    }

    async fn test_connection(&self) -> ConnectorResult<bool> {
        Ok(matches!(self.health_check().await?, ConnectorHealth::Healthy))
    }
}

#[async_trait]
impl MessagingConnector for SlackConnector {
    #[instrument(skip(self, prompt), fields(ticket_id = %prompt.ticket_id))]
    async fn post_interactive(
        &self,
        prompt: &ClarificationPrompt,
        channel: &str,
    ) -> ConnectorResult<PostedMessage> {
        let channel = if channel.is_empty() {
            self.config.default_channel.as_str()
        } else {
            channel
        };
        let body = serde_json::json!({
            "channel": channel,
            "text": format!("Configuration item clarification needed for {}", prompt.ticket_number),
            "blocks": Self::build_clarification_blocks(prompt),
        });

        let response: ChatResponse = self.client.post_json("/chat.postMessage", &body).await?;
        Self::check_response("chat.postMessage", &response)?;

        let message_ref = match (response.channel, response.ts) {
            (Some(channel), Some(ts)) => Some(MessageRef {
                channel,
                message_id: ts,
            }),
            _ => None,
        };
        info!(channel, posted = message_ref.is_some(), "Clarification prompt posted");
        Ok(PostedMessage {
            ok: true,
            message_ref,
        })
    }

    #[instrument(skip(self, text))]
    async fn update_message(&self, message_ref: &MessageRef, text: &str) -> ConnectorResult<()> {
        let body = serde_json::json!({
            "channel": message_ref.channel,
            "ts": message_ref.message_id,
            "text": text,
            "blocks": [SlackBlock::Section {
                text: SlackTextObject::mrkdwn(text),
                accessory: None,
                fields: None,
            }],
        });
        let response: ChatResponse = self.client.post_json("/chat.update", &body).await?;
        Self::check_response("chat.update", &response)
    }
}
