//! Warren Runtime - orchestration layer for warren services.
//!
//! This crate provides:
//! - Layered configuration (`WarrenConfig`) loaded with figment
//! - Logging setup on `tracing-subscriber`
//! - Topology planning from routes plus configuration
//! - The supervised runtime (`WarrenRuntime`): one session per broker
//!   connection, reconnecting with exponential backoff
//!
//! # Broker Selection
//!
//! The connector follows the scheme of `broker.url`:
//!
//! - `memory://`: an in-process broker, useful for tests and demos
//! - `amqp://` / `amqps://`: RabbitMQ through lapin (`amqp` feature)
//!
//! ```ignore
//! use warren_runtime::WarrenRuntime;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let runtime = WarrenRuntime::builder()
//!         .controller(echo_controller())
//!         .build()?;
//!
//!     // Run until Ctrl+C
//!     runtime.run().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod logging;
pub mod runtime;
pub mod topology;

pub use config::{
    ConfigError, ConfigLoader, ConfigResult, Profile, WarrenConfig, load_config,
    load_config_from_file,
};
pub use error::{RuntimeError, RuntimeResult};
pub use logging::{LoggingBuilder, SpanEvents};
pub use runtime::{RuntimeBuilder, RuntimeStats, WarrenRuntime};
pub use topology::plan_topology;

// Re-export tracing for use by other crates
pub use tracing;
pub use tracing_subscriber;

/// Logging macros for handler code.
pub mod prelude {
    pub use tracing::{Level, debug, error, info, instrument, span, trace, warn};
}
