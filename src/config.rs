use std::path::{Path, PathBuf};
use serde::Deserialize;
use thiserror::Error;
use crate::queue::QueueConfig;
use crate::utils::RetryPolicy;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config: {0}")]
    Toml(#[from] toml::de::Error),
}

/// 后端接口地址与凭证（凭证由外部获取）
#[derive(Deserialize, Debug, Clone)]
pub struct BackendConfig {
    pub authorize_url: String,
    pub verify_url: String,
    #[serde(default)]
    pub token: String,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct StorageConfig {
    /// 存放 queue_snapshot.json 与 sessions.json
    pub state_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(".lesson-upload"),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct AppConfig {
    pub backend: BackendConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<AppConfig, ConfigError> {
        let path = path.as_ref();
        let config_str = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        Self::parse(&config_str)
    }

    pub fn parse(config_str: &str) -> Result<AppConfig, ConfigError> {
        Ok(toml::from_str(config_str)?)
    }
}
