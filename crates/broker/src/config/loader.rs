use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use super::validation;

/// Broker configuration loaded from a TOML file with environment-variable
/// overrides. Refuses to start on misconfiguration.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub listen_address: String,
    pub max_workers: u32,
    pub heartbeat_interval_secs: u64,
    pub liveness_window_secs: u64,
    pub response_wait_secs: u64,
    pub acquire_wait_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0:8080".into(),
            max_workers: 256,
            heartbeat_interval_secs: 25,
            liveness_window_secs: 30,
            response_wait_secs: 120,
            acquire_wait_secs: 10,
        }
    }
}

impl BrokerConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn liveness_window(&self) -> Duration {
        Duration::from_secs(self.liveness_window_secs)
    }

    pub fn response_wait(&self) -> Duration {
        Duration::from_secs(self.response_wait_secs)
    }

    pub fn acquire_wait(&self) -> Duration {
        Duration::from_secs(self.acquire_wait_secs)
    }
}

/// Load configuration from `path` (if it exists), then apply environment
/// overrides, then validate.
///
/// Missing config file is not an error — defaults plus env overrides are
/// sufficient to start the broker.
pub fn load_config(path: &Path) -> Result<BrokerConfig, ConfigError> {
    let mut config = if path.exists() {
        tracing::info!(path = %path.display(), "Loading broker configuration");
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.to_path_buf(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })?
    } else {
        tracing::info!(path = %path.display(), "No config file found, using defaults");
        BrokerConfig::default()
    };

    apply_env_overrides(&mut config);
    validation::validate(&config)?;

    tracing::info!(
        listen_address = %config.listen_address,
        max_workers = config.max_workers,
        "Broker configuration loaded"
    );

    Ok(config)
}

fn apply_env_overrides(config: &mut BrokerConfig) {
    if let Ok(v) = std::env::var("LISTEN_ADDRESS") {
        config.listen_address = v;
    }
    if let Some(v) = env_parsed("MAX_WORKERS") {
        config.max_workers = v;
    }
    if let Some(v) = env_parsed("HEARTBEAT_INTERVAL_SECS") {
        config.heartbeat_interval_secs = v;
    }
    if let Some(v) = env_parsed("LIVENESS_WINDOW_SECS") {
        config.liveness_window_secs = v;
    }
    if let Some(v) = env_parsed("RESPONSE_WAIT_SECS") {
        config.response_wait_secs = v;
    }
    if let Some(v) = env_parsed("ACQUIRE_WAIT_SECS") {
        config.acquire_wait_secs = v;
    }
}

fn env_parsed<T: std::str::FromStr>(var: &str) -> Option<T> {
    std::env::var(var).ok().and_then(|v| v.parse().ok())
}

/// Default path for the config file, overridable via `AGENTBRIDGE_CONFIG`.
pub fn default_config_path() -> PathBuf {
    std::env::var("AGENTBRIDGE_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config/broker.toml"))
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {detail}")]
    Parse { path: PathBuf, detail: String },

    #[error("validation failed: {0}")]
    Validation(String),
}
