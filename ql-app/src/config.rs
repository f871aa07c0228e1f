//! Quietline configuration loader.
//!
//! TOML file first, then environment overrides, then validation. Every section
//! has defaults so an env-only deployment can run without a file.

use ql_core::{CoordinatorConfig, KeySpace, QueueConfig};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct QuietlineConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub bot: BotConfig,
    #[serde(default)]
    pub channel: ChannelConfig,
    #[serde(default)]
    pub assistant: AssistantConfig,
    #[serde(default)]
    pub threads: ThreadsConfig,
    #[serde(default)]
    pub coordination: CoordinatorConfig,
    #[serde(default)]
    pub queue: QueueConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_http_timeout_seconds")]
    pub http_timeout_seconds: u64,
    #[serde(default = "default_http_max_in_flight")]
    pub http_max_in_flight: usize,
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_http_timeout_seconds() -> u64 {
    30
}

fn default_http_max_in_flight() -> usize {
    256
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            http_timeout_seconds: default_http_timeout_seconds(),
            http_max_in_flight: default_http_max_in_flight(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Redis,
    /// Single-process only; locks and buffers are not shared across instances.
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_backend")]
    pub backend: StoreBackend,
    #[serde(default = "default_redis_url")]
    pub url: String,
}

fn default_store_backend() -> StoreBackend {
    StoreBackend::Redis
}

fn default_redis_url() -> String {
    "redis://localhost:6379/0".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
            url: default_redis_url(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BotConfig {
    /// Public base URL of this deployment, used for history links and the key
    /// namespace.
    #[serde(default)]
    pub bot_url: String,
    /// Overrides the namespace derived from `bot_url`.
    #[serde(default)]
    pub namespace: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChannelConfig {
    #[serde(default)]
    pub wazzup_api_key: String,
    /// Only webhooks for this channel are handled.
    #[serde(default)]
    pub channel_id: String,
    /// Operator phone that receives escalation summaries.
    #[serde(default)]
    pub admin_phone: String,
    /// Sent to the user when a conversation is handed to an operator.
    #[serde(default = "default_handoff_text")]
    pub handoff_text: String,
}

fn default_handoff_text() -> String {
    "Thank you! A manager will reply to you shortly.".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssistantConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub assistant_id: String,
    #[serde(default = "default_assistant_base_url")]
    pub base_url: String,
    /// File attached to every new thread for file search.
    #[serde(default)]
    pub file_id: Option<String>,
    #[serde(default = "default_seed_prompt")]
    pub seed_prompt: String,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_polls")]
    pub max_polls: u32,
}

fn default_assistant_base_url() -> String {
    ql_llm::DEFAULT_BASE_URL.to_string()
}

fn default_seed_prompt() -> String {
    "Price list, service and product descriptions and specifications".to_string()
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_max_polls() -> u32 {
    120
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            assistant_id: String::new(),
            base_url: default_assistant_base_url(),
            file_id: None,
            seed_prompt: default_seed_prompt(),
            poll_interval_ms: default_poll_interval_ms(),
            max_polls: default_max_polls(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ThreadsConfig {
    #[serde(default = "default_threads_db_path")]
    pub db_path: String,
}

fn default_threads_db_path() -> String {
    "conversations.db".to_string()
}

impl Default for ThreadsConfig {
    fn default() -> Self {
        Self {
            db_path: default_threads_db_path(),
        }
    }
}

impl QuietlineConfig {
    /// Loads from `path`, or from the default location when `None`. A missing
    /// default file is not an error; a missing explicit file is.
    pub async fn load(path: Option<PathBuf>) -> anyhow::Result<Self> {
        let explicit = path.is_some();
        let path = path.unwrap_or_else(default_config_path);
        let mut cfg = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => Self::from_toml_str(&contents)
                .map_err(|e| anyhow::anyhow!("parse config {}: {e}", path.display()))?,
            Err(e) if !explicit && e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "no config file; using defaults and environment");
                Self::default()
            }
            Err(e) => return Err(anyhow::anyhow!("read config {}: {e}", path.display())),
        };

        cfg.apply_env_overrides(|name| std::env::var(name).ok());
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_toml_str(contents: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Applies overrides from `lookup`. Blank values are ignored.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(v) = var("REDIS_URL") {
            self.store.url = v;
        }
        if let Some(v) = var("QUIETLINE_BIND_ADDR") {
            self.server.bind_addr = v;
        } else if let Some(port) = var("PORT") {
            self.server.bind_addr = format!("0.0.0.0:{}", port.trim());
        }
        if let Some(v) = var("BOT_URL") {
            self.bot.bot_url = v;
        }
        if let Some(v) = var("OPENAI_API_KEY") {
            self.assistant.api_key = v;
        }
        if let Some(v) = var("ASSISTANT_ID") {
            self.assistant.assistant_id = v;
        }
        if let Some(v) = var("ASSISTANT_FILE_ID") {
            self.assistant.file_id = Some(v);
        }
        if let Some(v) = var("WAZZUP_API_KEY") {
            self.channel.wazzup_api_key = v;
        }
        if let Some(v) = var("WAZZUP_CHANNEL_ID") {
            self.channel.channel_id = v;
        }
        if let Some(v) = var("ADMIN_PHONE") {
            self.channel.admin_phone = v;
        }
        if let Some(v) = var("HANDOFF_TEXT") {
            self.channel.handoff_text = v;
        }
        if let Some(v) = var("THREADS_DB_PATH") {
            self.threads.db_path = v;
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.coordination
            .validate()
            .map_err(|e| anyhow::anyhow!("{e}"))?;
        self.queue.validate().map_err(|e| anyhow::anyhow!("{e}"))?;
        self.bind_addr()?;
        if self.server.http_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("server.http_timeout_seconds must be > 0"));
        }
        if self.server.http_max_in_flight == 0 {
            return Err(anyhow::anyhow!("server.http_max_in_flight must be > 0"));
        }
        if self.store.backend == StoreBackend::Redis && self.store.url.trim().is_empty() {
            return Err(anyhow::anyhow!("store.url is required for the redis backend"));
        }
        if self.bot.bot_url.trim().is_empty() && self.bot.namespace.is_none() {
            return Err(anyhow::anyhow!("bot.bot_url (or bot.namespace) is required"));
        }
        if self.assistant.max_polls == 0 {
            return Err(anyhow::anyhow!("assistant.max_polls must be > 0"));
        }
        Ok(())
    }

    /// Credentials needed only by `serve`; `doctor` and `reap` run without them.
    pub fn validate_serving(&self) -> anyhow::Result<()> {
        let required = [
            ("assistant.api_key", &self.assistant.api_key),
            ("assistant.assistant_id", &self.assistant.assistant_id),
            ("channel.wazzup_api_key", &self.channel.wazzup_api_key),
            ("channel.channel_id", &self.channel.channel_id),
            ("channel.admin_phone", &self.channel.admin_phone),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(anyhow::anyhow!("{name} is required to serve"));
            }
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        self.server
            .bind_addr
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid server.bind_addr {:?}: {e}", self.server.bind_addr))
    }

    pub fn key_space(&self) -> KeySpace {
        match &self.bot.namespace {
            Some(ns) if !ns.trim().is_empty() => KeySpace::new(ns.trim()),
            _ => KeySpace::for_bot_url(&self.bot.bot_url),
        }
    }
}

pub fn default_config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".quietline").join("config.toml")
}
