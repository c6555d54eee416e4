//! Runtime error types.

use thiserror::Error;
use warren_core::GatewayError;
use warren_framework::{RegistrationError, RpcError};

use crate::config::ConfigError;

/// Errors that can occur during runtime operations.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// Configuration could not be loaded or is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Controllers could not be registered.
    #[error("Registration failed: {0}")]
    Registration(#[from] RegistrationError),

    /// Broker failure outside of a supervised session.
    #[error("Broker error: {0}")]
    Gateway(#[from] GatewayError),

    /// The RPC client could not be started.
    #[error("RPC client error: {0}")]
    Rpc(#[from] RpcError),

    /// No connector is available for the configured broker URL.
    #[error("Unsupported broker URL: {0}")]
    UnsupportedBroker(String),

    /// The broker stayed unreachable for every allowed attempt.
    #[error("Gave up after {attempts} connection attempt(s): {source}")]
    ReconnectExhausted {
        attempts: u32,
        #[source]
        source: GatewayError,
    },

    /// Installing a signal handler failed.
    #[error("Signal handler error: {0}")]
    Signal(#[source] std::io::Error),

    /// `run` was called while the runtime was already running.
    #[error("Runtime is already running")]
    AlreadyRunning,
}

/// Result type for runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;
