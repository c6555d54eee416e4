//! Error types shared by every Warren layer.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Errors raised by a broker gateway.
///
/// These are connection or channel level failures. The dispatcher never
/// handles them per message; they end the current session and are handed to
/// the runtime's reconnect policy.
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    /// Establishing the broker connection failed.
    #[error("connection to '{url}' failed: {reason}")]
    ConnectionFailed {
        /// Broker URL (credentials stripped by the caller).
        url: String,
        /// Failure description.
        reason: String,
    },

    /// A channel operation failed.
    #[error("channel error: {0}")]
    Channel(String),

    /// The gateway was closed.
    #[error("gateway is closed")]
    Closed,

    /// The broker cancelled a consumer or its stream ended.
    #[error("consumer for queue '{0}' was cancelled")]
    ConsumerCancelled(String),

    /// An ack or nack referenced a delivery tag the channel does not own.
    #[error("unknown delivery tag {0}")]
    UnknownDeliveryTag(u64),

    /// Publishing a message failed.
    #[error("publish to exchange '{exchange}' with routing key '{routing_key}' failed: {reason}")]
    PublishFailed {
        /// Target exchange.
        exchange: String,
        /// Routing key used.
        routing_key: String,
        /// Failure description.
        reason: String,
    },

    /// Declaring a queue, exchange or binding failed.
    #[error("topology declaration for '{name}' failed: {reason}")]
    Topology {
        /// Name of the queue or exchange.
        name: String,
        /// Failure description.
        reason: String,
    },
}

impl GatewayError {
    /// Creates a channel error.
    pub fn channel(reason: impl fmt::Display) -> Self {
        Self::Channel(reason.to_string())
    }

    /// Creates a topology error.
    pub fn topology(name: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::Topology {
            name: name.into(),
            reason: reason.to_string(),
        }
    }
}

/// Result type for gateway operations.
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Raised when no registered binding matches an inbound message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("no route for routing key '{routing_key}' on queue '{queue}'")]
pub struct RouteNotFound {
    /// Queue the message arrived on.
    pub queue: String,
    /// Routing key of the message.
    pub routing_key: String,
}

/// A payload failed decoding or validation.
///
/// `path` points at the offending field when the validator knows it.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationError {
    /// Human readable description.
    pub message: String,
    /// Optional field path (`order.items[2].sku`).
    pub path: Option<String>,
}

impl ValidationError {
    /// Creates a validation error without a field path.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            path: None,
        }
    }

    /// Creates a validation error attached to a field path.
    pub fn at(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            path: Some(path.into()),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.path {
            Some(path) => write!(f, "{path}: {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for ValidationError {}

impl From<serde_json::Error> for ValidationError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(err.to_string())
    }
}

/// How the dispatcher treats a failed invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Retryable; the message is requeued.
    Transient,
    /// Not retryable; the message is discarded.
    Permanent,
    /// The input was malformed; the message is discarded.
    Invalid,
}

impl ErrorKind {
    /// Returns the wire name of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Permanent => "permanent",
            Self::Invalid => "invalid",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned by handlers and interceptors.
///
/// # Example
///
/// ```rust,ignore
/// async fn charge(order: Payload<Order>) -> Result<Json<Receipt>, HandlerError> {
///     let receipt = gateway.charge(&order)
///         .await
///         .map_err(HandlerError::transient)?;
///     Ok(Json(receipt))
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message}")]
pub struct HandlerError {
    kind: ErrorKind,
    message: String,
    code: Option<i64>,
    data: Option<Value>,
}

impl HandlerError {
    /// Creates an error of the given kind.
    pub fn new(kind: ErrorKind, message: impl fmt::Display) -> Self {
        Self {
            kind,
            message: message.to_string(),
            code: None,
            data: None,
        }
    }

    /// A retryable failure. The message will be requeued.
    pub fn transient(message: impl fmt::Display) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    /// A non-retryable failure. The message will be discarded.
    pub fn permanent(message: impl fmt::Display) -> Self {
        Self::new(ErrorKind::Permanent, message)
    }

    /// The handler rejected its input.
    pub fn invalid(message: impl fmt::Display) -> Self {
        Self::new(ErrorKind::Invalid, message)
    }

    /// Attaches an application error code.
    pub fn with_code(mut self, code: i64) -> Self {
        self.code = Some(code);
        self
    }

    /// Attaches structured error data.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Changes the kind, keeping message, code and data.
    pub fn with_kind(mut self, kind: ErrorKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn code(&self) -> Option<i64> {
        self.code
    }

    pub fn data(&self) -> Option<&Value> {
        self.data.as_ref()
    }

    /// Returns `true` if the dispatcher should requeue the message.
    pub fn is_transient(&self) -> bool {
        self.kind == ErrorKind::Transient
    }
}

impl From<ValidationError> for HandlerError {
    fn from(err: ValidationError) -> Self {
        Self::invalid(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_validation_error_display_includes_path() {
        let err = ValidationError::at("order.qty", "must be positive");
        assert_eq!(err.to_string(), "order.qty: must be positive");
        assert_eq!(ValidationError::new("bad").to_string(), "bad");
    }

    #[test]
    fn test_handler_error_builders() {
        let err = HandlerError::permanent("out of stock")
            .with_code(409)
            .with_data(json!({"sku": "A1"}));
        assert_eq!(err.kind(), ErrorKind::Permanent);
        assert_eq!(err.code(), Some(409));
        assert_eq!(err.data(), Some(&json!({"sku": "A1"})));
        assert!(!err.is_transient());
        assert!(HandlerError::transient("db down").is_transient());
    }

    #[test]
    fn test_validation_error_converts_to_invalid() {
        let err: HandlerError = ValidationError::new("missing field `v`").into();
        assert_eq!(err.kind(), ErrorKind::Invalid);
        assert_eq!(err.message(), "missing field `v`");
    }
}
