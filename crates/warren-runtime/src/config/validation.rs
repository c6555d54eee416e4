//! Configuration validation utilities.

use std::time::Duration;

use super::error::{ConfigError, ConfigResult};
use super::schema::{BrokerConfig, LogOutput, LoggingConfig, QueueConfig, RetryConfig, WarrenConfig};

const BROKER_SCHEMES: [&str; 3] = ["amqp://", "amqps://", "memory://"];

/// Validates the entire configuration.
pub fn validate_config(config: &WarrenConfig) -> ConfigResult<()> {
    if config.service_name.trim().is_empty() {
        return Err(ConfigError::missing_field("service_name"));
    }

    validate_broker_config(&config.broker)?;

    if config.consumer.prefetch == 0 {
        return Err(ConfigError::validation("consumer.prefetch must be greater than 0"));
    }
    if config.consumer.concurrency == 0 {
        return Err(ConfigError::validation("consumer.concurrency must be greater than 0"));
    }

    for (name, queue) in &config.queues {
        validate_queue_config(name, queue)?;
    }

    if config.rpc.timeout == Duration::ZERO {
        return Err(ConfigError::validation("rpc.timeout must be greater than 0"));
    }

    validate_logging_config(&config.logging)?;

    Ok(())
}

fn validate_broker_config(broker: &BrokerConfig) -> ConfigResult<()> {
    validate_url(&broker.url)?;
    validate_retry_config(&broker.reconnect)?;

    if broker.dead_letter_exchange.as_deref() == Some("") {
        return Err(ConfigError::validation(
            "broker.dead_letter_exchange cannot be empty",
        ));
    }
    Ok(())
}

/// Validates a broker URL.
fn validate_url(url: &str) -> ConfigResult<()> {
    if url.is_empty() {
        return Err(ConfigError::missing_field("broker.url"));
    }

    if !BROKER_SCHEMES.iter().any(|s| url.starts_with(s)) {
        return Err(ConfigError::invalid_url(
            url,
            format!("URL must start with one of: {BROKER_SCHEMES:?}"),
        ));
    }

    Ok(())
}

/// Validates retry configuration.
fn validate_retry_config(retry: &RetryConfig) -> ConfigResult<()> {
    if retry.initial_delay == Duration::ZERO {
        return Err(ConfigError::validation(
            "Initial retry delay must be greater than 0",
        ));
    }

    if retry.max_delay < retry.initial_delay {
        return Err(ConfigError::validation(
            "Max retry delay must be greater than or equal to initial delay",
        ));
    }

    if retry.multiplier.is_nan() || retry.multiplier < 1.0 {
        return Err(ConfigError::validation(
            "Backoff multiplier must be at least 1.0",
        ));
    }

    Ok(())
}

fn validate_queue_config(name: &str, queue: &QueueConfig) -> ConfigResult<()> {
    if name.is_empty() {
        return Err(ConfigError::validation("Queue names cannot be empty"));
    }
    if queue.prefetch == Some(0) {
        return Err(ConfigError::validation(format!(
            "queues.{name}.prefetch must be greater than 0"
        )));
    }
    if queue.concurrency == Some(0) {
        return Err(ConfigError::validation(format!(
            "queues.{name}.concurrency must be greater than 0"
        )));
    }
    if let Some(binding) = queue.bindings.iter().find(|b| b.exchange.is_empty()) {
        return Err(ConfigError::validation(format!(
            "queues.{name}: binding with key {:?} names no exchange",
            binding.routing_key
        )));
    }
    Ok(())
}

fn validate_logging_config(logging: &LoggingConfig) -> ConfigResult<()> {
    if logging.output == LogOutput::File && logging.file_path.is_none() {
        return Err(ConfigError::missing_field("logging.file_path"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::BindingConfig;

    #[test]
    fn test_validate_default_config() {
        assert!(validate_config(&WarrenConfig::default()).is_ok());
    }

    #[test]
    fn test_validate_broker_url() {
        let mut config = WarrenConfig::default();
        config.broker.url = "memory://".into();
        assert!(validate_config(&config).is_ok());

        config.broker.url = "http://localhost".into();
        assert!(matches!(
            validate_config(&config),
            Err(ConfigError::InvalidUrl { .. })
        ));

        config.broker.url = String::new();
        assert!(matches!(
            validate_config(&config),
            Err(ConfigError::MissingField { .. })
        ));
    }

    #[test]
    fn test_validate_retry() {
        let mut config = WarrenConfig::default();
        config.broker.reconnect.multiplier = 0.5;
        assert!(validate_config(&config).is_err());

        let mut config = WarrenConfig::default();
        config.broker.reconnect.max_delay = Duration::from_millis(10);
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_queue_overrides() {
        let mut config = WarrenConfig::default();
        config.queues.insert(
            "orders".into(),
            QueueConfig {
                concurrency: Some(0),
                ..Default::default()
            },
        );
        assert!(validate_config(&config).is_err());

        let mut config = WarrenConfig::default();
        config.queues.insert(
            "orders".into(),
            QueueConfig {
                bindings: vec![BindingConfig {
                    exchange: String::new(),
                    routing_key: "#".into(),
                }],
                ..Default::default()
            },
        );
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_file_logging_requires_path() {
        let mut config = WarrenConfig::default();
        config.logging.output = LogOutput::File;
        assert!(matches!(
            validate_config(&config),
            Err(ConfigError::MissingField { .. })
        ));

        config.logging.file_path = Some("warren.log".into());
        assert!(validate_config(&config).is_ok());
    }
}
