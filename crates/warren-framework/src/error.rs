//! Error types for the Warren framework.

use thiserror::Error;
use warren_core::{HandlerError, PatternError};

/// Errors raised while building the registry.
///
/// All of these are fatal: the service must not start consuming with an
/// ambiguous or incomplete route table.
#[derive(Debug, Clone, Error)]
pub enum RegistrationError {
    /// Two routes bind the same pattern on the same queue.
    #[error("duplicate binding '{pattern}' on queue '{queue}' ({existing} and {duplicate})")]
    DuplicateBinding {
        queue: String,
        pattern: String,
        existing: String,
        duplicate: String,
    },

    /// Two patterns on the same queue share a routing key at equal specificity.
    #[error(
        "ambiguous bindings on queue '{queue}': '{first}' ({first_handler}) and '{second}' ({second_handler}) overlap with equal specificity"
    )]
    AmbiguousBinding {
        queue: String,
        first: String,
        first_handler: String,
        second: String,
        second_handler: String,
    },

    #[error("invalid pattern for {handler}: {source}")]
    InvalidPattern {
        handler: String,
        #[source]
        source: PatternError,
    },

    /// Neither the route nor its controller names a queue.
    #[error("no queue declared for {handler}")]
    MissingQueue { handler: String },

    /// The same controller method was registered twice.
    #[error("handler {handler} is already registered")]
    DuplicateHandler { handler: String },
}

/// Result type for registration.
pub type RegistrationResult<T> = Result<T, RegistrationError>;

/// Errors that can occur during extraction of handler arguments.
#[derive(Debug, Clone, Error)]
pub enum ExtractError {
    /// The payload does not deserialize into the requested type.
    #[error("payload does not match '{expected}': {reason}")]
    PayloadMismatch {
        expected: &'static str,
        reason: String,
    },

    /// A required message property is absent.
    #[error("message has no {0}")]
    Missing(&'static str),

    #[error("{0}")]
    Custom(String),
}

impl ExtractError {
    /// Creates a custom extraction error.
    pub fn custom(msg: impl Into<String>) -> Self {
        Self::Custom(msg.into())
    }
}

impl From<ExtractError> for HandlerError {
    fn from(err: ExtractError) -> Self {
        HandlerError::invalid(err)
    }
}

/// Result type for extraction operations.
pub type ExtractResult<T> = Result<T, ExtractError>;
