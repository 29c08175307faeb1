use super::loader::{BrokerConfig, ConfigError};

/// Validate a loaded configuration. The broker refuses to start if this
/// fails.
pub fn validate(config: &BrokerConfig) -> Result<(), ConfigError> {
    let mut errors: Vec<String> = Vec::new();

    if config.listen_address.is_empty() {
        errors.push("listen_address must not be empty".into());
    }
    if config.max_workers == 0 {
        errors.push("max_workers must be > 0".into());
    }
    if config.heartbeat_interval_secs == 0 {
        errors.push("heartbeat_interval_secs must be > 0".into());
    }
    if config.liveness_window_secs <= config.heartbeat_interval_secs {
        errors.push("liveness_window_secs must be greater than heartbeat_interval_secs".into());
    }
    if config.response_wait_secs == 0 {
        errors.push("response_wait_secs must be > 0".into());
    }
    if config.acquire_wait_secs == 0 {
        errors.push("acquire_wait_secs must be > 0".into());
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::Validation(errors.join("; ")))
    }
}
