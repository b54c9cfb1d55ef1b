use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use vigil_core::DEFAULT_AGENT_PORT;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub registry_path: String,
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub agent: AgentConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramConfig {
    /// Name of the environment variable holding the bot token. The token
    /// itself never lives in the config file.
    pub bot_token_env: String,
    pub polling_timeout_seconds: Option<u64>,
    pub allowed_chat_ids: Option<Vec<i64>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_agent_port")]
    pub port: u16,
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            port: default_agent_port(),
            request_timeout_seconds: default_request_timeout_seconds(),
        }
    }
}

fn default_agent_port() -> u16 {
    DEFAULT_AGENT_PORT
}

fn default_request_timeout_seconds() -> u64 {
    10
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }
}
