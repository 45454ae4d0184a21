//! Configuration structures and loading logic

use crate::definitions::TrainingDefinitions;
use crate::language::LanguageCode;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

/// Main server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub api_port: u16,
    pub host: String,
    pub model_dir: PathBuf,
    pub state_file: PathBuf,
    /// Base URL of the engine worker
    pub engine_url: String,
    /// Bearer token required on every route but `/info` and `/health`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    pub max_training_per_node: usize,
    pub queue_interval_ms: u64,
    pub training_poll_interval_ms: u64,
    /// Max utterances per prediction request, 0 disables the limit
    pub batch_size: usize,
    pub released_session_capacity: usize,
    pub released_session_ttl_secs: u64,
    pub auto_restore_on_restart: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster: Option<ClusterConfig>,
    /// Bots mounted at startup, before the saved state is restored
    pub bots: Vec<BotConfig>,
}

/// Shared coordination directory of a multi-node deployment
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ClusterConfig {
    pub shared_dir: PathBuf,
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default = "default_lock_lease_secs")]
    pub lock_lease_secs: u64,
}

impl ClusterConfig {
    pub fn jobs_dir(&self) -> PathBuf {
        self.shared_dir.join("jobs")
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.shared_dir.join("locks")
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            api_port: default_api_port(),
            host: default_host(),
            model_dir: default_model_dir(),
            state_file: default_state_file(),
            engine_url: default_engine_url(),
            auth_token: None,
            max_training_per_node: default_max_training_per_node(),
            queue_interval_ms: default_queue_interval_ms(),
            training_poll_interval_ms: default_training_poll_interval_ms(),
            batch_size: default_batch_size(),
            released_session_capacity: default_released_session_capacity(),
            released_session_ttl_secs: default_released_session_ttl_secs(),
            auto_restore_on_restart: true,
            cluster: None,
            bots: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content).context("Failed to parse TOML config")?
        } else {
            Self::default()
        };

        // Environment variable overrides
        if let Ok(port) = std::env::var("NLU_MANAGER_API_PORT") {
            config.api_port = port.parse().context("Invalid NLU_MANAGER_API_PORT value")?;
        }
        if let Ok(host) = std::env::var("NLU_MANAGER_HOST") {
            config.host = host;
        }
        if let Ok(model_dir) = std::env::var("NLU_MANAGER_MODEL_DIR") {
            config.model_dir = PathBuf::from(model_dir);
        }
        if let Ok(state_file) = std::env::var("NLU_MANAGER_STATE_FILE") {
            config.state_file = PathBuf::from(state_file);
        }
        if let Ok(engine_url) = std::env::var("NLU_MANAGER_ENGINE_URL") {
            config.engine_url = engine_url;
        }
        if let Ok(token) = std::env::var("NLU_MANAGER_AUTH_TOKEN") {
            config.auth_token = Some(token).filter(|t| !t.is_empty());
        }
        if let Ok(max) = std::env::var("NLU_MANAGER_MAX_TRAINING_PER_NODE") {
            config.max_training_per_node = max
                .parse()
                .context("Invalid NLU_MANAGER_MAX_TRAINING_PER_NODE value")?;
        }
        if let Ok(batch_size) = std::env::var("NLU_MANAGER_BATCH_SIZE") {
            config.batch_size = batch_size
                .parse()
                .context("Invalid NLU_MANAGER_BATCH_SIZE value")?;
        }

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.api_port < 1024 {
            anyhow::bail!("API port must be >= 1024 (got {})", self.api_port);
        }
        if self.max_training_per_node == 0 {
            anyhow::bail!("max_training_per_node must be at least 1");
        }
        if self.queue_interval_ms == 0 || self.training_poll_interval_ms == 0 {
            anyhow::bail!("Queue and training poll intervals must be > 0");
        }
        if self.released_session_capacity == 0 {
            anyhow::bail!("released_session_capacity must be at least 1");
        }

        if let Some(cluster) = &self.cluster {
            if cluster.node_id.trim().is_empty() {
                anyhow::bail!("Cluster node_id cannot be empty");
            }
            if cluster.lock_lease_secs == 0 {
                anyhow::bail!("Cluster lock_lease_secs must be > 0");
            }
        }

        let mut ids = HashSet::new();
        for bot in &self.bots {
            bot.validate()?;
            if !ids.insert(&bot.bot_id) {
                anyhow::bail!("Duplicate bot id: {}", bot.bot_id);
            }
        }

        std::fs::create_dir_all(&self.model_dir)
            .with_context(|| format!("Cannot create model directory: {:?}", self.model_dir))?;

        // Ensure state file directory exists or can be created
        if let Some(parent) = self.state_file.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Cannot create state file directory: {:?}", parent))?;
        }

        Ok(())
    }

    pub fn queue_interval(&self) -> Duration {
        Duration::from_millis(self.queue_interval_ms)
    }

    pub fn training_poll_interval(&self) -> Duration {
        Duration::from_millis(self.training_poll_interval_ms)
    }

    pub fn released_session_ttl(&self) -> Duration {
        Duration::from_secs(self.released_session_ttl_secs)
    }
}

/// Configuration of a tenant
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct BotConfig {
    pub bot_id: String,
    pub default_language: LanguageCode,
    pub languages: Vec<LanguageCode>,

    /// Secret salting the bot's model files
    #[serde(default)]
    pub password: String,

    /// Training seed; derived from the bot id when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,

    #[serde(default)]
    pub definitions: BTreeMap<LanguageCode, TrainingDefinitions>,

    /// Auto-generated field (not in user config)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl BotConfig {
    pub fn validate(&self) -> Result<()> {
        if self.bot_id.is_empty() {
            anyhow::bail!("Bot id cannot be empty");
        }
        if self.bot_id.contains('/') || self.bot_id.contains('\\') {
            anyhow::bail!("Bot id '{}' cannot contain path separators", self.bot_id);
        }
        if !self.languages.contains(&self.default_language) {
            anyhow::bail!(
                "Bot '{}' default language {} is not one of its languages",
                self.bot_id,
                self.default_language
            );
        }
        Ok(())
    }
}

// Default functions
fn default_api_port() -> u16 {
    3200
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_model_dir() -> PathBuf {
    data_dir().join("models")
}
fn default_state_file() -> PathBuf {
    data_dir().join("nlu-manager-state.toml")
}
fn default_engine_url() -> String {
    "http://127.0.0.1:3201".to_string()
}
fn default_max_training_per_node() -> usize {
    2
}
fn default_queue_interval_ms() -> u64 {
    2000
}
fn default_training_poll_interval_ms() -> u64 {
    500
}
fn default_batch_size() -> usize {
    1
}
fn default_released_session_capacity() -> usize {
    1000
}
fn default_released_session_ttl_secs() -> u64 {
    3600
}
fn default_node_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
fn default_lock_lease_secs() -> u64 {
    30
}

fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("nlu-manager")
}
