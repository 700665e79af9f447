//! OpenAI-compatible chat completions model for entity extraction.

use crate::http::HttpClient;
use crate::secure_string::SecureString;
use crate::traits::{
    AuthConfig, Connector, ConnectorCategory, ConnectorConfig, ConnectorError, ConnectorHealth,
    ConnectorResult, LanguageModelConnector, ModelEntity, ModelExtraction, TokenUsage,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, instrument};

/// Entity categories the model is asked to fill.
pub const ENTITY_CATEGORIES: [&str; 7] = [
    "ip_addresses",
    "hostnames",
    "systems",
    "users",
    "software",
    "error_codes",
    "network_devices",
];

const SYSTEM_PROMPT: &str = r#"You analyse IT support tickets and extract technical entities.
Respond with a single JSON object of the form:
{
  "entities": {
    "ip_addresses": [], "hostnames": [], "systems": [], "users": [],
    "software": [], "error_codes": [], "network_devices": []
  },
  "intent": "internal_ci" | "external_dependency" | "hybrid" | "unknown",
  "confidence": 0.0-1.0
}
Each entity list holds strings, or objects {"value": string, "confidence": number}.
Use "external_dependency" when the issue lies with a third-party service the
organisation does not operate. Only report entities that appear in the text."#;

/// Configuration for an OpenAI-compatible endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiConfig {
    /// API base URL, e.g. "https://api.openai.com/v1".
    pub base_url: String,
    /// API key.
    pub api_key: SecureString,
    /// Model name.
    pub model: String,
    /// Sampling temperature.
    pub temperature: f32,
    /// Upper bound on completion tokens.
    pub max_tokens: u32,
    /// HTTP timeout in seconds. The pipeline applies its own, usually shorter, budget.
    pub timeout_secs: u64,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: SecureString::default(),
            model: "gpt-4o-mini".to_string(),
            temperature: 0.1,
            max_tokens: 1024,
            timeout_secs: 180,
        }
    }
}

/// Language model backed by an OpenAI-compatible chat completions API.
pub struct OpenAiExtractionModel {
    config: OpenAiConfig,
    client: HttpClient,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<TokenUsage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiExtractionModel {
    pub fn new(config: OpenAiConfig) -> ConnectorResult<Self> {
        let connector_config = ConnectorConfig {
            name: "openai".to_string(),
            base_url: config.base_url.clone(),
            auth: AuthConfig::BearerToken {
                token: config.api_key.clone(),
            },
            timeout_secs: config.timeout_secs,
            max_retries: 1,
            verify_tls: true,
            headers: HashMap::new(),
        };
        let client = HttpClient::new(connector_config)?;
        Ok(Self { config, client })
    }

    fn request_body(&self, text: &str) -> serde_json::Value {
        serde_json::json!({
            "model": self.config.model,
            "temperature": self.config.temperature,
            "max_tokens": self.config.max_tokens,
            "response_format": {"type": "json_object"},
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": text},
            ],
        })
    }

    /// Parses the JSON document the model wrote into its message content.
    pub fn parse_content(content: &str, usage: TokenUsage) -> ConnectorResult<ModelExtraction> {
        let doc: serde_json::Value = serde_json::from_str(strip_code_fence(content))
            .map_err(|e| ConnectorError::InvalidResponse(format!("Model output is not JSON: {}", e)))?;

        let groups = doc
            .get("entities")
            .and_then(|v| v.as_object())
            .ok_or_else(|| ConnectorError::InvalidResponse("Model output has no entities".into()))?;

        let mut entities = Vec::new();
        for (category, values) in groups {
            let Some(values) = values.as_array() else {
                continue;
            };
            for value in values {
                let entity = match value {
                    serde_json::Value::String(s) => ModelEntity {
                        category: category.clone(),
                        value: s.clone(),
                        confidence: None,
                    },
                    serde_json::Value::Object(obj) => {
                        let Some(s) = obj.get("value").and_then(|v| v.as_str()) else {
                            continue;
                        };
                        ModelEntity {
                            category: category.clone(),
                            value: s.to_string(),
                            confidence: obj.get("confidence").and_then(|c| c.as_f64()),
                        }
                    }
                    _ => continue,
                };
                if !entity.value.trim().is_empty() {
                    entities.push(entity);
                }
            }
        }

        Ok(ModelExtraction {
            entities,
            intent: doc
                .get("intent")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown")
                .to_string(),
            confidence: doc
                .get("confidence")
                .and_then(|v| v.as_f64())
                .unwrap_or(0.0)
                .clamp(0.0, 1.0),
            token_usage: usage,
        })
    }
}

/// Removes a surrounding ```json fence some models add despite JSON mode.
fn strip_code_fence(content: &str) -> &str {
    let trimmed = content.trim();
    trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .map(str::trim)
        .unwrap_or(trimmed)
}

#[async_trait]
impl Connector for OpenAiExtractionModel {
    fn name(&self) -> &str {
        "openai"
    }

    fn connector_type(&self) -> &str {
        "language_model"
    }

    fn category(&self) -> ConnectorCategory {
        ConnectorCategory::LanguageModel
    }

    async fn health_check(&self) -> ConnectorResult<ConnectorHealth> {
        match self.client.get("/models").await {
            Ok(_) => Ok(ConnectorHealth::Healthy),
            Err(ConnectorError::AuthenticationFailed(e)) => Ok(ConnectorHealth::Unhealthy(e)),
            Err(e) => Ok(ConnectorHealth::Degraded(e.to_string())),
        }
    }

    async fn test_connection(&self) -> ConnectorResult<bool> {
        Ok(self.client.get("/models").await.is_ok())
    }
}

#[async_trait]
impl LanguageModelConnector for OpenAiExtractionModel {
    #[instrument(skip(self, text), fields(model = %self.config.model, chars = text.len()))]
    async fn extract(&self, text: &str) -> ConnectorResult<ModelExtraction> {
        let response: CompletionResponse = self
            .client
            .post_json("/chat/completions", &self.request_body(text))
            .await?;

        let content = response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ConnectorError::InvalidResponse("Model returned no choices".into()))?;

        let usage = response.usage.unwrap_or_default();
        debug!(total_tokens = usage.total_tokens, "Model extraction completed");
        Self::parse_content(&content, usage)
    }
}
