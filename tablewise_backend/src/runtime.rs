use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use flume::Sender;

use crate::agent::AgentEvent;
use crate::catalog::TableInfo;
use crate::config::{BackendConfig, EmbeddingProvider};
use crate::embedding::{Embedder, LocalEmbedder, OpenAiEmbedder};
use crate::error::AgentResult;
use crate::http_client::build_http_client;
use crate::llm_client::{LanguageModel, LlmClient};
use crate::session::{AgentServices, AgentSession, DbCredentials, SessionRegistry};

pub struct BackendRuntime {
    pub config: BackendConfig,
    pub services: AgentServices,
    pub registry: Arc<SessionRegistry>,
}

pub struct BackendRuntimeBuilder {
    config: BackendConfig,
    event_tx: Sender<AgentEvent>,
    llm: Option<Arc<dyn LanguageModel>>,
    embedder: Option<Arc<dyn Embedder>>,
}

impl BackendRuntimeBuilder {
    pub fn new(config: BackendConfig, event_tx: Sender<AgentEvent>) -> Self {
        Self {
            config,
            event_tx,
            llm: None,
            embedder: None,
        }
    }

    pub fn with_llm(mut self, llm: Arc<dyn LanguageModel>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn build(self) -> Result<BackendRuntime> {
        let config = self.config;

        let needs_http = self.llm.is_none()
            || (self.embedder.is_none() && config.embedding_provider == EmbeddingProvider::Openai);
        let http = if needs_http {
            Some(
                build_http_client(Duration::from_secs(config.llm_timeout_secs.max(1)))
                    .context("Failed to build HTTP client for model calls")?,
            )
        } else {
            None
        };

        let llm: Arc<dyn LanguageModel> = match (self.llm, &http) {
            (Some(llm), _) => llm,
            (None, Some(client)) => {
                if config.llm_api_key.is_none() {
                    tracing::warn!("No LLM API key configured; requests go out unauthenticated");
                }
                let llm = LlmClient::new(
                    client.clone(),
                    config.llm_api_url.clone(),
                    config.llm_api_key.clone(),
                    config.llm_model.clone(),
                )
                .with_sampling(config.llm_temperature, config.llm_max_tokens);
                tracing::info!("LLM: {} at {}", llm.model(), config.llm_api_url);
                Arc::new(llm)
            }
            (None, None) => anyhow::bail!("No HTTP client available for the LLM"),
        };

        let embedder: Arc<dyn Embedder> = match (self.embedder, config.embedding_provider) {
            (Some(embedder), _) => embedder,
            (None, EmbeddingProvider::Local) => {
                tracing::info!("Embeddings: local hashed bag-of-words");
                Arc::new(LocalEmbedder::new(LocalEmbedder::DEFAULT_DIMENSIONS)?)
            }
            (None, EmbeddingProvider::Openai) => {
                let client = http
                    .clone()
                    .context("No HTTP client available for embeddings")?;
                tracing::info!(
                    "Embeddings: {} at {}",
                    config.embedding_model,
                    config.embedding_api_url()
                );
                Arc::new(OpenAiEmbedder::new(
                    client,
                    config.embedding_api_url().to_string(),
                    config.llm_api_key.clone(),
                    config.embedding_model.clone(),
                ))
            }
        };

        let services = AgentServices {
            llm,
            embedder,
            policy: config.agent_policy(),
            memory_policy: config.memory_policy(),
            event_tx: Some(self.event_tx),
        };

        Ok(BackendRuntime {
            config,
            services,
            registry: Arc::new(SessionRegistry::new()),
        })
    }
}

impl BackendRuntime {
    pub fn bootstrap(config: BackendConfig, event_tx: Sender<AgentEvent>) -> Result<Self> {
        BackendRuntimeBuilder::new(config, event_tx).build()
    }

    /// Build a session and register it, replacing any session with that id.
    pub async fn configure_session(
        &self,
        session_id: &str,
        credentials: &DbCredentials,
        tables: Vec<TableInfo>,
    ) -> AgentResult<Arc<AgentSession>> {
        let session =
            AgentSession::configure(session_id, credentials, tables, &self.services).await?;
        Ok(self.registry.insert(session).await)
    }
}
