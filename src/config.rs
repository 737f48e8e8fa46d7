use crate::constants::{
    DEFAULT_DATABASE_PATH, DEFAULT_SERVER_PORT, DEFAULT_TIMEOUT_SECONDS, ENV_DATABASE_PATH,
    ENV_SERVER_PORT, ENV_SYMPLA_API_TOKEN, ENV_SYMPLA_BASE_URL, ENV_SYMPLA_TIMEOUT_SECONDS,
};
use crate::error::{ImporterError, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub sympla: SymplaConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SymplaConfig {
    pub base_url: Option<String>,
    pub token: Option<String>,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Credentials the import needs before it may talk to Sympla
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymplaCredentials {
    pub base_url: String,
    pub token: String,
}

fn default_timeout_seconds() -> u64 {
    DEFAULT_TIMEOUT_SECONDS
}

fn default_database_path() -> PathBuf {
    PathBuf::from(DEFAULT_DATABASE_PATH)
}

fn default_port() -> u16 {
    DEFAULT_SERVER_PORT
}

impl Default for SymplaConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            token: None,
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_SERVER_PORT,
        }
    }
}

impl Config {
    /// Load `config.toml` (if present) and overlay the process environment.
    pub fn load(config_path: &Path) -> Result<Self> {
        let mut config = if config_path.exists() {
            let config_content = fs::read_to_string(config_path).map_err(|e| {
                ImporterError::Config(format!(
                    "Failed to read config file '{}': {}",
                    config_path.display(),
                    e
                ))
            })?;
            Self::from_toml_str(&config_content)?
        } else {
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Environment values win over the file; empty values are ignored.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(token) = lookup(ENV_SYMPLA_API_TOKEN) {
            self.sympla.token = Some(token);
        }
        if let Some(base_url) = lookup(ENV_SYMPLA_BASE_URL) {
            self.sympla.base_url = Some(base_url);
        }
        if let Some(timeout) = lookup(ENV_SYMPLA_TIMEOUT_SECONDS) {
            self.sympla.timeout_seconds = timeout.trim().parse().map_err(|_| {
                ImporterError::Config(format!(
                    "{} must be a whole number of seconds, got '{}'",
                    ENV_SYMPLA_TIMEOUT_SECONDS, timeout
                ))
            })?;
        }
        if let Some(path) = lookup(ENV_DATABASE_PATH) {
            self.storage.database_path = PathBuf::from(path);
        }
        if let Some(port) = lookup(ENV_SERVER_PORT) {
            self.server.port = port.trim().parse().map_err(|_| {
                ImporterError::Config(format!("{} must be a port number, got '{}'", ENV_SERVER_PORT, port))
            })?;
        }
        Ok(())
    }
}

impl SymplaConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// Both the token and the base URL are required; an absent or blank value is fatal for a run.
    pub fn credentials(&self) -> Result<SymplaCredentials> {
        let token = required(self.token.as_deref(), ENV_SYMPLA_API_TOKEN)?;
        let base_url = required(self.base_url.as_deref(), ENV_SYMPLA_BASE_URL)?;
        Ok(SymplaCredentials { base_url, token })
    }
}

fn required(value: Option<&str>, key: &str) -> Result<String> {
    match value.map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v.to_string()),
        _ => Err(ImporterError::Config(format!("Sympla API {key} is not configured."))),
    }
}
