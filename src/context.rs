use crate::catalog::SchemaCatalog;
use crate::config::AssistantConfig;
use crate::error::{AssistantError, Result};
use crate::interpreter::QueryInterpreter;
use crate::llm::{LlmClient, ModelClient};
use crate::narrator::ResultNarrator;
use crate::retry::RetryPolicy;
use crate::safety::QuerySafetyValidator;
use crate::store::{DocumentStore, InMemoryStore};
use crate::translator::QueryTranslator;
use std::sync::Arc;
use tracing::info;

/// Everything a request needs, built once and shared read-only.
pub struct AppContext {
    pub catalog: SchemaCatalog,
    pub store: Arc<dyn DocumentStore>,
    pub model: Arc<dyn ModelClient>,
    pub config: AssistantConfig,
    pub retry: RetryPolicy,
}

impl AppContext {
    pub fn new(
        config: AssistantConfig,
        store: Arc<dyn DocumentStore>,
        model: Arc<dyn ModelClient>,
    ) -> Self {
        Self {
            catalog: SchemaCatalog::inventory(),
            retry: config.retry_policy(),
            store,
            model,
            config,
        }
    }

    /// Seed store from `config.data_path` and the HTTP model client.
    pub fn from_config(config: AssistantConfig) -> Result<Self> {
        let api_key = config.api_key.clone().ok_or_else(|| {
            AssistantError::Config("AI_API_KEY (or OPENAI_API_KEY) is not set".to_string())
        })?;
        let store = InMemoryStore::from_json_file(&config.data_path)?;
        let model = LlmClient::new(
            api_key,
            config.model.clone(),
            config.api_endpoint.clone(),
            config.timeout,
        )?;
        info!("Using model {} at {}", model.model(), config.api_endpoint);
        Ok(Self::new(config, Arc::new(store), Arc::new(model)))
    }

    pub fn validator(&self) -> QuerySafetyValidator<'_> {
        QuerySafetyValidator::new(&self.catalog)
    }

    pub fn translator(&self) -> QueryTranslator<'_> {
        QueryTranslator::new(self.model.as_ref(), &self.catalog, &self.retry)
    }

    pub fn interpreter(&self) -> QueryInterpreter<'_> {
        QueryInterpreter::new(
            &self.catalog,
            self.store.as_ref(),
            self.config.default_pipeline_collection.as_deref(),
        )
    }

    pub fn narrator(&self) -> ResultNarrator<'_> {
        ResultNarrator::new(self.model.as_ref(), &self.retry, self.config.narration_row_limit)
    }
}
