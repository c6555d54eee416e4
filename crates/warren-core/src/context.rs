//! Per-message execution context.
//!
//! An [`ExecutionContext`] is created by the dispatcher for one delivery and
//! threaded by `&mut` through the pipe chain, the interceptor chain and the
//! handler's extractors. It is never shared between invocations.

use std::collections::HashMap;

use serde_json::Value;

use crate::message::InboundMessage;

/// Mutable scratch state for a single in-flight message.
///
/// # Example
///
/// ```rust,ignore
/// async fn transform(&self, value: Value, ctx: &mut ExecutionContext) -> Result<Value, ValidationError> {
///     if ctx.message().redelivered {
///         ctx.insert_metadata("redelivered", true);
///     }
///     Ok(value)
/// }
/// ```
#[derive(Debug)]
pub struct ExecutionContext {
    message: InboundMessage,
    handler: String,
    payload: Value,
    metadata: HashMap<String, Value>,
    abort: Option<String>,
}

impl ExecutionContext {
    /// Creates a context for `message` routed to `handler`.
    ///
    /// The payload starts as [`Value::Null`] until the dispatcher decodes the
    /// message body.
    pub fn new(message: InboundMessage, handler: impl Into<String>) -> Self {
        Self {
            message,
            handler: handler.into(),
            payload: Value::Null,
            metadata: HashMap::new(),
            abort: None,
        }
    }

    /// Returns the inbound message.
    pub fn message(&self) -> &InboundMessage {
        &self.message
    }

    /// Returns the display name of the resolved handler.
    pub fn handler(&self) -> &str {
        &self.handler
    }

    /// Returns the decoded payload as transformed so far.
    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn payload_mut(&mut self) -> &mut Value {
        &mut self.payload
    }

    pub fn set_payload(&mut self, payload: Value) {
        self.payload = payload;
    }

    /// Takes the payload, leaving `Null` in its place.
    pub fn take_payload(&mut self) -> Value {
        std::mem::take(&mut self.payload)
    }

    /// Returns a metadata entry recorded by a pipe or interceptor.
    pub fn metadata(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }

    pub fn insert_metadata(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.metadata.insert(key.into(), value.into());
    }

    pub fn metadata_map(&self) -> &HashMap<String, Value> {
        &self.metadata
    }

    /// Marks the invocation as aborted.
    ///
    /// Remaining pipes and the handler are skipped; the dispatcher acks the
    /// message and answers RPC callers with an `aborted` error reply.
    pub fn abort(&mut self, reason: impl Into<String>) {
        self.abort = Some(reason.into());
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.is_some()
    }

    pub fn abort_reason(&self) -> Option<&str> {
        self.abort.as_deref()
    }

    /// Consumes the context, returning the inbound message.
    pub fn into_message(self) -> InboundMessage {
        self.message
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::DeliveryTag;
    use serde_json::json;

    fn context() -> ExecutionContext {
        let message = InboundMessage::new("q", "k", b"{}".to_vec(), DeliveryTag::new(1));
        ExecutionContext::new(message, "Echo::echo")
    }

    #[test]
    fn test_metadata_and_payload() {
        let mut ctx = context();
        ctx.set_payload(json!({"v": 1}));
        ctx.insert_metadata("tenant", "acme");

        assert_eq!(ctx.metadata("tenant"), Some(&json!("acme")));
        assert_eq!(ctx.take_payload(), json!({"v": 1}));
        assert_eq!(ctx.payload(), &Value::Null);
        assert_eq!(ctx.handler(), "Echo::echo");
    }

    #[test]
    fn test_abort() {
        let mut ctx = context();
        assert!(!ctx.is_aborted());
        ctx.abort("duplicate");
        assert!(ctx.is_aborted());
        assert_eq!(ctx.abort_reason(), Some("duplicate"));
    }
}
