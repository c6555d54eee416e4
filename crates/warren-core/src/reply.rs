//! Handler replies.

use serde::Serialize;
use serde_json::Value;

use crate::error::HandlerError;
use crate::message::Headers;

/// A successful handler result to send back to an RPC caller.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Reply {
    /// Reply body.
    pub payload: Value,
    /// Extra headers published with the reply.
    pub headers: Headers,
}

impl Reply {
    pub fn new(payload: Value) -> Self {
        Self {
            payload,
            headers: Headers::new(),
        }
    }

    /// Serializes `body` into a reply.
    ///
    /// Serialization failures are permanent: retrying the same handler will
    /// produce the same unserializable value.
    pub fn json<T: Serialize + ?Sized>(body: &T) -> Result<Self, HandlerError> {
        serde_json::to_value(body)
            .map(Self::new)
            .map_err(|e| HandlerError::permanent(format!("failed to serialize reply: {e}")))
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

/// Outcome of a handler or interceptor chain.
///
/// `Ok(None)` means the handler succeeded without producing a reply body.
pub type HandlerResult = Result<Option<Reply>, HandlerError>;
