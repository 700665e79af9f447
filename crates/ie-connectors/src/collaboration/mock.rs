//! Mock messaging connector for testing.

use crate::traits::{
    ClarificationPrompt, Connector, ConnectorCategory, ConnectorError, ConnectorHealth,
    ConnectorResult, MessageRef, MessagingConnector, PostedMessage,
};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;

/// A prompt captured by the mock.
#[derive(Debug, Clone)]
pub struct RecordedPrompt {
    pub channel: String,
    pub prompt: ClarificationPrompt,
    pub message_ref: MessageRef,
}

/// Mock messaging connector that records prompts and message updates.
pub struct MockMessagingConnector {
    name: String,
    prompts: Arc<RwLock<Vec<RecordedPrompt>>>,
    updates: Arc<RwLock<Vec<(MessageRef, String)>>>,
    should_fail: Arc<RwLock<bool>>,
    reject: Arc<RwLock<bool>>,
}

impl MockMessagingConnector {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            prompts: Arc::new(RwLock::new(Vec::new())),
            updates: Arc::new(RwLock::new(Vec::new())),
            should_fail: Arc::new(RwLock::new(false)),
            reject: Arc::new(RwLock::new(false)),
        }
    }

    /// Makes every call fail with a connection error.
    pub async fn set_should_fail(&self, fail: bool) {
        *self.should_fail.write().await = fail;
    }

    /// Makes the platform answer `ok: false` to new prompts.
    pub async fn set_reject(&self, reject: bool) {
        *self.reject.write().await = reject;
    }

    pub async fn prompts(&self) -> Vec<RecordedPrompt> {
        self.prompts.read().await.clone()
    }

    pub async fn prompt_count(&self) -> usize {
        self.prompts.read().await.len()
    }

    pub async fn updates(&self) -> Vec<(MessageRef, String)> {
        self.updates.read().await.clone()
    }

    async fn check(&self) -> ConnectorResult<()> {
        if *self.should_fail.read().await {
            return Err(ConnectorError::ConnectionFailed(
                "Simulated messaging failure".into(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl Connector for MockMessagingConnector {
    fn name(&self) -> &str {
        &self.name
    }

    fn connector_type(&self) -> &str {
        "collaboration"
    }

    fn category(&self) -> ConnectorCategory {
        ConnectorCategory::Collaboration
    }

    async fn health_check(&self) -> ConnectorResult<ConnectorHealth> {
        if *self.should_fail.read().await {
            Ok(ConnectorHealth::Unhealthy("Simulated failure".into()))
        } else {
            Ok(ConnectorHealth::Healthy)
        }
    }

    async fn test_connection(&self) -> ConnectorResult<bool> {
        Ok(!*self.should_fail.read().await)
    }
}

#[async_trait]
impl MessagingConnector for MockMessagingConnector {
    async fn post_interactive(
        &self,
        prompt: &ClarificationPrompt,
        channel: &str,
    ) -> ConnectorResult<PostedMessage> {
        self.check().await?;
        if *self.reject.read().await {
            return Ok(PostedMessage {
                ok: false,
                message_ref: None,
            });
        }

        let mut prompts = self.prompts.write().await;
        let message_ref = MessageRef {
            channel: channel.to_string(),
            message_id: format!("1700000000.{:06}", prompts.len() + 1),
        };
        prompts.push(RecordedPrompt {
            channel: channel.to_string(),
            prompt: prompt.clone(),
            message_ref: message_ref.clone(),
        });
        Ok(PostedMessage {
            ok: true,
            message_ref: Some(message_ref),
        })
    }

    async fn update_message(&self, message_ref: &MessageRef, text: &str) -> ConnectorResult<()> {
        self.check().await?;
        self.updates
            .write()
            .await
            .push((message_ref.clone(), text.to_string()));
        Ok(())
    }
}
