mod loader;
mod validation;

pub use loader::{default_config_path, load_config, BrokerConfig, ConfigError};
