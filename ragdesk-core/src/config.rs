use crate::knowledge::NameEncoding;
use crate::pricing::PricingConfig;
use crate::provider::ReasoningEffort;
use crate::resilience::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("No API key found in environment variable {0}")]
    MissingCredential(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Configuration for the whole client.
///
/// Covers the model selection, the policies the orchestration layer runs with, and where
/// local state lives. Credentials are never part of this file; see [`crate::secrets`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub llm: LlmConfig,
    pub system_prompt: String,
    /// Name of the preset `system_prompt` was taken from, if any.
    pub prompt_mode: Option<String>,
    pub retry: RetryPolicy,
    pub pricing: PricingConfig,
    pub knowledge: KnowledgeConfig,
    pub credentials: CredentialsConfig,
}

/// Configuration for the AI model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub model: String,
    pub base_url: String,
    pub reasoning_effort: Option<ReasoningEffort>,
    /// Upper bound for one request, including the whole streamed body.
    pub request_timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: "gpt-5.2".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            reasoning_effort: Some(ReasoningEffort::Medium),
            request_timeout_secs: 1200,
        }
    }
}

/// Configuration for knowledge-base synchronization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KnowledgeConfig {
    /// How file names are encoded before upload.
    pub name_encoding: NameEncoding,
    /// Maximum number of collections fetched by a full refresh.
    pub list_limit: usize,
    /// Delay between indexing polls after an upload.
    pub poll_interval_ms: u64,
    /// Give up polling after this many refreshes; the file stays `uploaded`.
    pub max_polls: u32,
    /// Local JSON cache of the last known view. `None` disables caching.
    pub cache_path: Option<PathBuf>,
    /// Delete member files together with their collection.
    pub cascade_file_delete: bool,
    /// Collection used for file search when the session starts.
    pub active_collection: Option<String>,
}

impl Default for KnowledgeConfig {
    fn default() -> Self {
        Self {
            name_encoding: NameEncoding::default(),
            list_limit: 100,
            poll_interval_ms: 2_000,
            max_polls: 60,
            cache_path: Some(PathBuf::from("./data/knowledge_cache.json")),
            cascade_file_delete: true,
            active_collection: None,
        }
    }
}

/// Where the API key comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialsConfig {
    pub env_var: String,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            env_var: "OPENAI_API_KEY".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            llm: LlmConfig::default(),
            system_prompt: String::new(),
            prompt_mode: None,
            retry: RetryPolicy::default(),
            pricing: PricingConfig::default(),
            knowledge: KnowledgeConfig::default(),
            credentials: CredentialsConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from `config.yaml` if it exists, otherwise use defaults.
    pub fn load_or_default() -> Self {
        Self::load("config.yaml").unwrap_or_default()
    }

    /// Write configuration as YAML, creating parent directories as needed.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_yaml::to_string(self)?)?;
        Ok(())
    }
}
