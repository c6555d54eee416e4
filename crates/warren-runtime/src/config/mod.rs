//! Configuration module for the Warren runtime.
//!
//! This module provides figment-based configuration loading and validation
//! for broker, consumer, topology and logging settings.

pub mod error;
pub mod loader;
pub mod schema;
pub mod validation;

pub use error::{ConfigError, ConfigResult};
pub use loader::{ConfigLoader, Profile, load_config, load_config_from_file};
pub use schema::{
    BindingConfig, BrokerConfig, ConsumerConfig, ExchangeConfig, LogFormat, LogLevel, LogOutput,
    LogRotation, LoggingConfig, QueueConfig, RetryConfig, RpcConfig, SpanEventConfig,
    WarrenConfig,
};
pub use validation::validate_config;
