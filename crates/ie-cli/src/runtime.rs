//! Service wiring: builds the orchestrator from the application config.

use crate::config::AppConfig;
use anyhow::{Context, Result};
use ie_connectors::{
    LanguageModelConnector, OpenAiConfig, OpenAiExtractionModel, SecureString, ServiceNowConnector,
    SlackConfig, SlackConnector,
};
use ie_core::{
    EnrichmentOrchestrator, EnrichmentServices, EnrichmentStateStore, InMemoryStateStore,
    SqliteStateStore, SweepRunner, SystemClock,
};
use std::sync::Arc;
use tracing::{info, warn};

/// Wired services shared by every command.
pub struct Runtime {
    pub orchestrator: Arc<EnrichmentOrchestrator>,
    pub store: Arc<dyn EnrichmentStateStore>,
}

impl Runtime {
    pub async fn build(config: &AppConfig) -> Result<Self> {
        let servicenow = Arc::new(
            ServiceNowConnector::new(config.servicenow.connector_config()?)
                .context("Failed to create ServiceNow connector")?,
        );

        let enrichment = config.enrichment_config();
        let slack = SlackConnector::new(SlackConfig::new(
            SecureString::new(config.slack.bot_token.clone()),
            enrichment.clarification_channel.clone().unwrap_or_default(),
        ))
        .context("Failed to create Slack connector")?;

        let model = build_model(config, enrichment.model_timeout_secs)?;
        let store = build_store(config).await?;

        let orchestrator = EnrichmentOrchestrator::new(
            enrichment,
            EnrichmentServices {
                tickets: servicenow.clone(),
                ci_repository: servicenow,
                messaging: Arc::new(slack),
                model,
                store: store.clone(),
                clock: Arc::new(SystemClock),
            },
        )?;

        Ok(Self {
            orchestrator: Arc::new(orchestrator),
            store,
        })
    }

    pub fn sweep_runner(&self) -> SweepRunner {
        SweepRunner::new(self.orchestrator.clone(), self.store.clone())
    }
}

fn build_model(
    config: &AppConfig,
    timeout_secs: u64,
) -> Result<Option<Arc<dyn LanguageModelConnector>>> {
    let llm = &config.llm;
    if !llm.enabled || llm.api_key.is_empty() {
        info!("Language model disabled; using pattern extraction only");
        return Ok(None);
    }
    let model = OpenAiExtractionModel::new(OpenAiConfig {
        base_url: llm.base_url.clone(),
        api_key: SecureString::new(llm.api_key.clone()),
        model: llm.model.clone(),
        temperature: llm.temperature,
        max_tokens: llm.max_tokens,
        timeout_secs,
    })
    .context("Failed to create language model connector")?;
    Ok(Some(Arc::new(model)))
}

async fn build_store(config: &AppConfig) -> Result<Arc<dyn EnrichmentStateStore>> {
    let url = &config.database.url;
    if url.is_empty() {
        warn!("No database configured; enrichment state will not survive restarts");
        return Ok(Arc::new(InMemoryStateStore::new()));
    }
    let store = SqliteStateStore::connect(url, config.database.max_connections)
        .await
        .with_context(|| format!("Failed to open state database: {}", url))?;
    Ok(Arc::new(store))
}
