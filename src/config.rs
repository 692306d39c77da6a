use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;

use crate::lock::LockMode;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: String,
    pub enable_tracing: bool,
    /// PostgreSQL connection URL of the lock and rule tables
    #[serde(default)]
    pub postgres_url: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default)]
    pub locks: LockConfig,
}

fn default_max_connections() -> u32 {
    10
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LockConfig {
    /// Rows fetched per round trip by dataset-lock streams
    pub stream_batch_size: usize,
    /// Fail fast instead of waiting on locked rows when reconciling successes
    pub success_nowait: bool,
    /// Fail fast instead of waiting on locked rows when reconciling failures
    pub failure_nowait: bool,
    /// Lifetime granted to touched dataset locks; no expiry when unset
    pub default_lifetime_days: Option<u32>,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            stream_batch_size: 500,
            success_nowait: false,
            failure_nowait: true,
            default_lifetime_days: None,
        }
    }
}

impl LockConfig {
    pub fn success_mode(&self) -> LockMode {
        LockMode::from_nowait(self.success_nowait)
    }

    pub fn failure_mode(&self) -> LockMode {
        LockMode::from_nowait(self.failure_nowait)
    }
}

impl AppConfig {
    pub fn load(env: &str) -> anyhow::Result<Self> {
        let config_path = format!("config/{}.yaml", env);
        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path))?;
        Self::from_yaml(&content).with_context(|| format!("Failed to parse {}", config_path))
    }

    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }
}
