use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::agent::AgentPolicy;
use crate::memory::MemoryPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingProvider {
    /// OpenAI-compatible `/embeddings` endpoint
    Openai,
    /// Offline hashed bag-of-words vectors (no network)
    Local,
}

impl Default for EmbeddingProvider {
    fn default() -> Self {
        EmbeddingProvider::Openai
    }
}

impl EmbeddingProvider {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "openai" | "remote" => Some(EmbeddingProvider::Openai),
            "local" | "offline" => Some(EmbeddingProvider::Local),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    // LLM configuration (OpenAI-compatible: OpenAI, Ollama, LM Studio, vLLM, etc.)
    #[serde(default = "default_llm_url")]
    pub llm_api_url: String,
    #[serde(default = "default_llm_model")]
    pub llm_model: String,
    #[serde(default)]
    pub llm_api_key: Option<String>,
    #[serde(default)]
    pub llm_temperature: f32,
    #[serde(default = "default_llm_max_tokens")]
    pub llm_max_tokens: u32,
    #[serde(default = "default_llm_timeout_secs")]
    pub llm_timeout_secs: u64,

    // Embeddings for table selection
    #[serde(default)]
    pub embedding_provider: EmbeddingProvider,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    #[serde(default)]
    pub embedding_api_url: Option<String>,

    // Control loop
    #[serde(default = "default_table_top_k")]
    pub table_top_k: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_step_limit")]
    pub step_limit: usize,
    #[serde(default = "default_max_result_rows")]
    pub max_result_rows: usize,

    // Conversation memory
    #[serde(default = "default_summary_threshold")]
    pub summary_threshold: usize,
    #[serde(default = "default_summary_keep_recent")]
    pub summary_keep_recent: usize,

    /// Fact table -> dimension tables that must travel with it
    #[serde(default = "default_forced_tables")]
    pub forced_tables: BTreeMap<String, Vec<String>>,
}

fn default_llm_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_llm_model() -> String {
    "gpt-4o".to_string()
}

fn default_llm_max_tokens() -> u32 {
    1024
}

fn default_llm_timeout_secs() -> u64 {
    60
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}

fn default_table_top_k() -> usize {
    3
}

fn default_max_retries() -> u32 {
    3
}

fn default_step_limit() -> usize {
    15
}

fn default_max_result_rows() -> usize {
    200
}

fn default_summary_threshold() -> usize {
    10
}

fn default_summary_keep_recent() -> usize {
    4
}

fn default_forced_tables() -> BTreeMap<String, Vec<String>> {
    let mut forced = BTreeMap::new();
    forced.insert(
        "vendas".to_string(),
        vec!["clientes".to_string(), "produtos".to_string()],
    );
    forced
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            llm_api_url: default_llm_url(),
            llm_model: default_llm_model(),
            llm_api_key: None,
            llm_temperature: 0.0,
            llm_max_tokens: default_llm_max_tokens(),
            llm_timeout_secs: default_llm_timeout_secs(),
            embedding_provider: EmbeddingProvider::default(),
            embedding_model: default_embedding_model(),
            embedding_api_url: None,
            table_top_k: default_table_top_k(),
            max_retries: default_max_retries(),
            step_limit: default_step_limit(),
            max_result_rows: default_max_result_rows(),
            summary_threshold: default_summary_threshold(),
            summary_keep_recent: default_summary_keep_recent(),
            forced_tables: default_forced_tables(),
        }
    }
}

impl BackendConfig {
    /// Get the directory containing the executable
    fn get_base_dir() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    /// Get the path to the config file (relative to executable)
    pub fn config_path() -> PathBuf {
        Self::get_base_dir().join("tablewise_config.toml")
    }

    /// Load config from tablewise_config.toml (next to executable), falling back to env vars
    pub fn load() -> Self {
        let path = Self::config_path();
        match Self::load_from(&path) {
            Ok(Some(config)) => {
                tracing::info!("Loaded config from {:?}", path);
                return config.with_env_overrides();
            }
            Ok(None) => {}
            Err(e) => {
                tracing::error!("Failed to parse {:?}: {:#}", path, e);
            }
        }

        tracing::warn!("No config file found, using defaults + env vars");
        Self::from_env()
    }

    /// Read a config file. `Ok(None)` when the file does not exist.
    pub fn load_from(path: &Path) -> Result<Option<Self>> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("Failed to read {:?}", path)),
        };
        let config = toml::from_str::<BackendConfig>(&contents)
            .with_context(|| format!("Failed to parse {:?}", path))?;
        Ok(Some(config))
    }

    /// Load from environment variables on top of the defaults
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    fn with_env_overrides(mut self) -> Self {
        if let Ok(url) = env::var("LLM_API_URL") {
            self.llm_api_url = url;
        }

        if let Ok(model) = env::var("LLM_MODEL") {
            self.llm_model = model;
        }

        if let Some(key) = env::var("LLM_API_KEY")
            .or_else(|_| env::var("OPENAI_API_KEY"))
            .ok()
            .filter(|key| !key.trim().is_empty())
        {
            self.llm_api_key = Some(key);
        }

        if let Ok(provider) = env::var("EMBEDDING_PROVIDER") {
            match EmbeddingProvider::parse(&provider) {
                Some(provider) => self.embedding_provider = provider,
                None => tracing::warn!("Ignoring unknown EMBEDDING_PROVIDER '{}'", provider),
            }
        }

        if let Ok(model) = env::var("EMBEDDING_MODEL") {
            self.embedding_model = model;
        }

        if let Ok(url) = env::var("EMBEDDING_API_URL") {
            if !url.trim().is_empty() {
                self.embedding_api_url = Some(url);
            }
        }

        if let Ok(top_k) = env::var("TABLEWISE_TABLE_TOP_K") {
            if let Ok(top_k) = top_k.parse() {
                self.table_top_k = top_k;
            }
        }

        if let Ok(retries) = env::var("TABLEWISE_MAX_RETRIES") {
            if let Ok(retries) = retries.parse() {
                self.max_retries = retries;
            }
        }

        self
    }

    pub fn embedding_api_url(&self) -> &str {
        self.embedding_api_url
            .as_deref()
            .unwrap_or(self.llm_api_url.as_str())
    }

    pub fn agent_policy(&self) -> AgentPolicy {
        AgentPolicy {
            max_retries: self.max_retries.max(1),
            step_limit: self.step_limit,
            table_top_k: self.table_top_k.max(1),
            max_result_rows: self.max_result_rows,
            forced_tables: self.forced_tables.clone(),
        }
    }

    /// `keep_recent` is clamped below the threshold so every compaction shrinks the log.
    pub fn memory_policy(&self) -> MemoryPolicy {
        let keep_recent = if self.summary_threshold > 0 {
            self.summary_keep_recent.min(self.summary_threshold.saturating_sub(2))
        } else {
            self.summary_keep_recent
        };
        MemoryPolicy {
            summary_threshold: self.summary_threshold,
            keep_recent,
        }
    }

    /// Copy safe to hand out over the API.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if copy.llm_api_key.is_some() {
            copy.llm_api_key = Some("********".to_string());
        }
        copy
    }
}
