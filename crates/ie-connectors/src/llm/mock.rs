//! Mock language model for testing.

use crate::traits::{
    Connector, ConnectorCategory, ConnectorError, ConnectorHealth, ConnectorResult,
    LanguageModelConnector, ModelEntity, ModelExtraction, TokenUsage,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Mock model returning a scripted extraction, optionally after a delay.
pub struct MockLanguageModel {
    name: String,
    response: Arc<RwLock<ModelExtraction>>,
    failure: Arc<RwLock<Option<ConnectorError>>>,
    delay: Arc<RwLock<Option<Duration>>>,
    prompts: Arc<RwLock<Vec<String>>>,
    calls: AtomicUsize,
}

impl MockLanguageModel {
    /// Creates a model that finds nothing and reports intent "unknown".
    pub fn new(name: &str) -> Self {
        Self::with_response(
            name,
            ModelExtraction {
                entities: Vec::new(),
                intent: "unknown".to_string(),
                confidence: 0.5,
                token_usage: TokenUsage::default(),
            },
        )
    }

    pub fn with_response(name: &str, response: ModelExtraction) -> Self {
        Self {
            name: name.to_string(),
            response: Arc::new(RwLock::new(response)),
            failure: Arc::new(RwLock::new(None)),
            delay: Arc::new(RwLock::new(None)),
            prompts: Arc::new(RwLock::new(Vec::new())),
            calls: AtomicUsize::new(0),
        }
    }

    /// Builds a response from `(category, value)` pairs.
    pub fn extraction(intent: &str, confidence: f64, entities: &[(&str, &str)]) -> ModelExtraction {
        ModelExtraction {
            entities: entities
                .iter()
                .map(|(category, value)| ModelEntity {
                    category: category.to_string(),
                    value: value.to_string(),
                    confidence: None,
                })
                .collect(),
            intent: intent.to_string(),
            confidence,
            token_usage: TokenUsage {
                prompt_tokens: 120,
                completion_tokens: 40,
                total_tokens: 160,
            },
        }
    }

    pub async fn set_response(&self, response: ModelExtraction) {
        *self.response.write().await = response;
    }

    pub async fn set_failure(&self, failure: Option<ConnectorError>) {
        *self.failure.write().await = failure;
    }

    /// Delays every response, for exercising caller timeouts.
    pub async fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.write().await = delay;
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Texts received so far.
    pub async fn prompts(&self) -> Vec<String> {
        self.prompts.read().await.clone()
    }
}

#[async_trait]
impl Connector for MockLanguageModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn connector_type(&self) -> &str {
        "language_model"
    }

    fn category(&self) -> ConnectorCategory {
        ConnectorCategory::LanguageModel
    }

    async fn health_check(&self) -> ConnectorResult<ConnectorHealth> {
        Ok(ConnectorHealth::Healthy)
    }

    async fn test_connection(&self) -> ConnectorResult<bool> {
        Ok(true)
    }
}

#[async_trait]
impl LanguageModelConnector for MockLanguageModel {
    async fn extract(&self, text: &str) -> ConnectorResult<ModelExtraction> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.write().await.push(text.to_string());

        let delay = *self.delay.read().await;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = self.failure.read().await.clone() {
            return Err(err);
        }
        Ok(self.response.read().await.clone())
    }
}
